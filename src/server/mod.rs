//! Server ingestion service.
//!
//! One authenticated sync endpoint backed by an authoritative SQLite store,
//! plus the remote "please sync" flag terminals poll.

pub mod auth;
pub mod config;
pub mod error;
pub mod ingest;
pub mod routes;
pub mod store;

pub use auth::AuthContext;
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use routes::build_router;
pub use store::ServerStore;

use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

/// Open the store and serve until `shutdown` resolves.
pub async fn serve(
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let store = ServerStore::open(&config.database_path)?;
    let app = build_router(store, &config);
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "POS sync server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("POS sync server stopped");
    Ok(())
}
