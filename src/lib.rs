//! The Small POS - offline-first sync
//!
//! Terminal side: a durable local store ([`db`]) that checkout writes to
//! whether or not the network is up, and a sync engine ([`sync`]) that
//! drains it to the server with retries. Server side: an idempotent
//! ingestion service ([`server`]) that turns terminal batches into ledger
//! rows and hands back a fresh catalog. Both sides speak [`protocol`].

pub mod api;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

pub use config::SyncConfig;
pub use db::DbState;
pub use session::TerminalSession;
pub use sync::scheduler::SyncHandle;
pub use sync::{SyncEngine, SyncTransport};
