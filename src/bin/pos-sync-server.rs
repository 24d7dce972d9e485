//! POS sync server
//!
//! Serves the terminal sync endpoint and offers a few admin helpers for
//! seeding a store by hand.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use pos_offline_sync::api::encode_connection_string;
use pos_offline_sync::diagnostics::{self, LogOptions};
use pos_offline_sync::protocol::CatalogProduct;
use pos_offline_sync::server::{self, ServerConfig, ServerStore};

#[derive(Parser)]
#[command(name = "pos-sync-server", version, about = "POS offline sync ingestion server")]
struct Cli {
    /// Path to the server database
    #[arg(short, long, env = "POS_SYNC_DATABASE", default_value = "pos-sync-server.db")]
    database: PathBuf,

    /// Write daily rolling log files to this directory
    #[arg(long, env = "POS_SYNC_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, env = "POS_SYNC_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server until Ctrl-C
    Serve {
        #[arg(short, long, env = "POS_SYNC_LISTEN", default_value = "127.0.0.1:8787")]
        listen: String,
        /// Request body limit in bytes
        #[arg(long, env = "POS_SYNC_MAX_BODY_BYTES")]
        max_body_bytes: Option<usize>,
    },
    /// Register a terminal (creating the organization if needed) and print
    /// its API token
    RegisterTerminal {
        #[arg(long)]
        org: String,
        #[arg(long)]
        org_name: Option<String>,
        #[arg(long)]
        terminal: String,
        #[arg(long, default_value = "Terminal")]
        name: String,
        /// Also print a connection string for this server URL
        #[arg(long)]
        server_url: Option<String>,
    },
    /// Create or update a catalog product
    SeedProduct {
        #[arg(long)]
        org: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        sku: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        price: f64,
        /// Fraction, e.g. 0.2 for 20 %
        #[arg(long, default_value_t = 0.0)]
        tax_rate: f64,
        #[arg(long, default_value_t = 0)]
        stock: i64,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        barcode: Option<String>,
        #[arg(long)]
        inactive: bool,
    },
    /// Ask a terminal to sync at its next flag poll
    RequestSync {
        #[arg(long)]
        terminal: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_opts = LogOptions::console().with_json(cli.json_logs);
    if let Some(dir) = &cli.log_dir {
        log_opts = log_opts.with_file(dir, "pos-sync-server");
    }
    let _log_guard = diagnostics::init_tracing(&log_opts);

    match cli.command {
        Command::Serve {
            listen,
            max_body_bytes,
        } => {
            let about = diagnostics::get_about_info();
            info!(
                version = %about.version,
                git_sha = %about.git_sha,
                built = %about.build_timestamp,
                "Starting POS sync server"
            );
            let mut config = ServerConfig::default()
                .with_listen_addr(listen)
                .with_database_path(cli.database);
            if let Some(max) = max_body_bytes {
                config = config.with_max_body_bytes(max);
            }
            server::serve(config, async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            })
            .await?;
        }
        Command::RegisterTerminal {
            org,
            org_name,
            terminal,
            name,
            server_url,
        } => {
            let store = ServerStore::open(&cli.database)?;
            store.ensure_organization(&org, org_name.as_deref().unwrap_or(&org))?;
            let token = store
                .register_terminal(&org, &terminal, &name)
                .with_context(|| format!("registering terminal {terminal}"))?;
            println!("token: {token}");
            if let Some(url) = server_url {
                println!(
                    "connection string: {}",
                    encode_connection_string(&url, &token, &terminal)
                );
            }
        }
        Command::SeedProduct {
            org,
            id,
            sku,
            name,
            price,
            tax_rate,
            stock,
            category,
            barcode,
            inactive,
        } => {
            let store = ServerStore::open(&cli.database)?;
            store.ensure_organization(&org, &org)?;
            let product = CatalogProduct {
                id,
                sku,
                name,
                description: None,
                category,
                price,
                tax_rate,
                barcode,
                image_url: None,
                is_active: !inactive,
                stock_quantity: Some(stock),
            };
            store.upsert_product(&org, &product)?;
            println!("product {} saved", product.id);
        }
        Command::RequestSync { terminal } => {
            let store = ServerStore::open(&cli.database)?;
            if !store.request_sync(&terminal)? {
                anyhow::bail!("unknown terminal {terminal}");
            }
            println!("sync requested for {terminal}");
        }
    }

    Ok(())
}
