//! POS terminal sync agent
//!
//! Owns the terminal's local store and runs the sync engine against the
//! configured server. Credentials live in the OS credential store.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use pos_offline_sync::api::HttpTransport;
use pos_offline_sync::db::{self, NewOrder, NewPayment};
use pos_offline_sync::diagnostics::{self, LogOptions};
use pos_offline_sync::protocol::{OrderItem, PaymentMethod};
use pos_offline_sync::storage::{self, TerminalCredentials};
use pos_offline_sync::sync::{RoundKind, SyncEvent};
use pos_offline_sync::{DbState, SyncConfig, SyncEngine, SyncHandle, TerminalSession};

#[derive(Parser)]
#[command(name = "pos-terminal", version, about = "POS terminal offline sync agent")]
struct Cli {
    /// Directory holding the local database and logs
    #[arg(long, env = "POS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, env = "POS_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store server URL, terminal id and API token (or a connection string)
    Configure {
        /// API token or connection string
        #[arg(long, env = "POS_API_KEY")]
        key: String,
        #[arg(long, env = "POS_SERVER_URL")]
        server_url: Option<String>,
        #[arg(long, env = "POS_TERMINAL_ID")]
        terminal_id: Option<String>,
    },
    /// Run the sync engine until Ctrl-C
    Run,
    /// Run a single sync round and exit
    SyncOnce,
    /// Print the local sync backlog
    Status,
    /// Record a completed cash sale of one catalog product
    Sell {
        #[arg(long)]
        product: String,
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(1..))]
        quantity: i64,
        #[arg(long, default_value = "cashier")]
        cashier: String,
    },
    /// Forget the API token, keeping the terminal identity
    Logout,
    /// Delete every stored credential
    FactoryReset,
}

fn open_store(data_dir: &std::path::Path) -> anyhow::Result<Arc<DbState>> {
    let db = db::init(data_dir).context("opening local store")?;
    Ok(Arc::new(db))
}

fn configured_session() -> anyhow::Result<TerminalSession> {
    match storage::load_session() {
        Some(session) => Ok(session),
        None => bail!("terminal is not configured; run `pos-terminal configure` first"),
    }
}

fn build_engine(db: Arc<DbState>, session: TerminalSession) -> anyhow::Result<Arc<SyncEngine>> {
    let config = SyncConfig::default();
    let transport = HttpTransport::new(&config)?;
    Ok(Arc::new(SyncEngine::new(
        db,
        Arc::new(session),
        Arc::new(transport),
        config,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(diagnostics::default_data_dir);

    let log_opts = LogOptions::console()
        .with_file(data_dir.join("logs"), "pos-terminal")
        .with_json(cli.json_logs);
    let _log_guard = diagnostics::init_tracing(&log_opts);

    match cli.command {
        Command::Configure {
            key,
            server_url,
            terminal_id,
        } => {
            let resolved = storage::save_terminal_credentials(&TerminalCredentials {
                server_url,
                terminal_id,
                api_key: key,
            })?;
            let db = open_store(&data_dir)?;
            db.set_terminal_id(&resolved.terminal_id)?;
            println!(
                "terminal {} configured for {}",
                resolved.terminal_id, resolved.server_url
            );
        }
        Command::Run => {
            let about = diagnostics::get_about_info();
            info!(
                version = %about.version,
                git_sha = %about.git_sha,
                built = %about.build_timestamp,
                "Starting POS terminal sync agent"
            );
            let db = open_store(&data_dir)?;
            let engine = build_engine(db, configured_session()?)?;
            let handle = SyncHandle::start(engine)?;
            let mut events = handle.subscribe();
            let mut fatal = None;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown requested");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(SyncEvent::StatusChanged(status)) => {
                            info!(
                                state = ?status.state,
                                pending = status.pending,
                                error = status.error,
                                badge = status.badge_count(),
                                "Sync status"
                            );
                        }
                        Ok(SyncEvent::Fatal(message)) => {
                            error!(%message, "Local store failure, stopping");
                            fatal = Some(message);
                            break;
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(skipped = n, "status events lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            handle.shutdown().await;
            if let Some(message) = fatal {
                bail!("local store failure: {message}");
            }
        }
        Command::SyncOnce => {
            let db = open_store(&data_dir)?;
            let engine = build_engine(db, configured_session()?)?;
            engine.recover()?;
            let outcome = engine.run_round(RoundKind::Manual).await?;
            println!("{outcome:?}");
        }
        Command::Status => {
            let db = open_store(&data_dir)?;
            let health = diagnostics::get_sync_health(&db)?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Sell {
            product,
            quantity,
            cashier,
        } => {
            let db = open_store(&data_dir)?;
            let session = configured_session()?;
            let Some(item) = db.get_product(&product)? else {
                bail!("product {product} is not in the local catalog; sync first");
            };
            let order = db.create_order(&NewOrder {
                terminal_id: session.terminal_id().to_string(),
                cashier_id: cashier,
                items: vec![OrderItem {
                    product_id: item.id,
                    sku: item.sku,
                    name: item.name,
                    quantity,
                    unit_price: item.price,
                    tax_rate: item.tax_rate,
                    discount_amount: 0.0,
                }],
                complete: true,
            })?;
            db.record_payment(&NewPayment {
                order_local_id: order.local_id.clone(),
                method: PaymentMethod::Cash,
                amount: order.total_amount,
                reference: None,
            })?;
            println!("order {} total {:.2}", order.local_id, order.total_amount);
        }
        Command::Logout => {
            storage::clear_api_key()?;
            println!("API token removed");
        }
        Command::FactoryReset => {
            storage::factory_reset()?;
            println!("all credentials removed");
        }
    }

    Ok(())
}
