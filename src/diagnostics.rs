//! Diagnostics for the sync subsystem.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Sync health**: outstanding counts, last sync time, recent record errors
//! - **Logging setup**: tracing subscriber with console and rolling file output
//! - **Log rotation helpers**: prune old rolling files

use crate::db::{DbState, StoreResult};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info,pos_offline_sync=debug";

/// Number of record errors included in the health report.
const RECENT_ERROR_LIMIT: i64 = 20;

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    pub version: &'static str,
    pub build_timestamp: &'static str,
    pub git_sha: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
}

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> AboutInfo {
    AboutInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        git_sha: env!("BUILD_GIT_SHA"),
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}

/// `User-Agent` sent by the terminal transport.
pub fn user_agent() -> String {
    let about = get_about_info();
    format!(
        "pos-offline-sync/{} ({}; {}; {})",
        about.version, about.platform, about.arch, about.git_sha
    )
}

// ---------------------------------------------------------------------------
// Sync health
// ---------------------------------------------------------------------------

/// Snapshot of the local sync backlog for the status screen and support
/// bundles.
pub fn get_sync_health(db: &DbState) -> StoreResult<Value> {
    let counts = db.sync_counts()?;
    let last_sync_at = db.get_last_sync_time()?;
    let catalog_updated_at = db.get_catalog_updated_at()?;
    let recent_errors = db.recent_sync_errors(RECENT_ERROR_LIMIT)?;

    Ok(json!({
        "about": get_about_info(),
        "terminalId": db.get_terminal_id()?,
        "lastSyncAt": last_sync_at,
        "catalogUpdatedAt": catalog_updated_at,
        "backlog": {
            "pending": counts.pending,
            "syncing": counts.syncing,
            "error": counts.error,
            "outstanding": counts.outstanding(),
        },
        "recentErrors": recent_errors,
    }))
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Where log output goes.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Directory for daily rolling files; console only when `None`.
    pub log_dir: Option<PathBuf>,
    /// File name prefix for rolling files.
    pub file_prefix: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl LogOptions {
    pub fn console() -> Self {
        Self {
            log_dir: None,
            file_prefix: "pos".into(),
            json: false,
        }
    }

    pub fn with_file(mut self, dir: impl Into<PathBuf>, prefix: &str) -> Self {
        self.log_dir = Some(dir.into());
        self.file_prefix = prefix.to_string();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Install the global tracing subscriber.
///
/// The returned guard flushes the non-blocking file writer on drop; keep it
/// alive for the lifetime of the process.
pub fn init_tracing(opts: &LogOptions) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_layer = if opts.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, guard) = match &opts.log_dir {
        Some(dir) => {
            prune_old_logs(dir, &opts.file_prefix);
            if let Err(e) = fs::create_dir_all(dir) {
                eprintln!("cannot create log dir {}: {e}", dir.display());
            }
            let appender = tracing_appender::rolling::daily(dir, &opts.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if opts.json {
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("tracing subscriber already installed: {e}");
    }

    guard
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Default log directory for the terminal binary.
pub fn get_log_dir() -> PathBuf {
    default_data_dir().join("logs")
}

/// Default data directory (database, logs) for the terminal binary.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.pos-sync")
}

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES` whose name starts with `prefix`.
pub fn prune_old_logs(log_dir: &Path, prefix: &str) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(prefix) {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewOrder, RecordKind};
    use crate::protocol::OrderItem;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = serde_json::to_value(get_about_info()).unwrap();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(user_agent().starts_with("pos-offline-sync/"));
    }

    #[test]
    fn test_log_dir_is_stable() {
        let d1 = get_log_dir();
        let d2 = get_log_dir();
        assert_eq!(d1, d2);
        assert!(d1.to_string_lossy().contains("com.thesmall.pos-sync"));
    }

    #[test]
    fn test_prune_keeps_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(MAX_LOG_FILES + 3) {
            fs::write(dir.path().join(format!("pos.2026-01-{:02}", i + 1)), b"x").unwrap();
        }
        fs::write(dir.path().join("other.txt"), b"keep").unwrap();

        assert_eq!(prune_old_logs(dir.path(), "pos"), 3);
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, MAX_LOG_FILES + 1);
    }

    #[test]
    fn test_sync_health_with_empty_db() {
        let db = DbState::open_in_memory().unwrap();
        let health = get_sync_health(&db).unwrap();
        assert_eq!(health["backlog"]["outstanding"], 0);
        assert!(health["lastSyncAt"].is_null());
        assert_eq!(health["recentErrors"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_sync_health_lists_record_errors() {
        let db = DbState::open_in_memory().unwrap();
        let order = db
            .create_order(&NewOrder {
                terminal_id: "t".into(),
                cashier_id: "c".into(),
                items: vec![OrderItem {
                    product_id: "p".into(),
                    sku: "S".into(),
                    name: "N".into(),
                    quantity: 1,
                    unit_price: 2.0,
                    tax_rate: 0.0,
                    discount_amount: 0.0,
                }],
                complete: true,
            })
            .unwrap();
        db.mark_as_syncing(RecordKind::Order, &[order.local_id.clone()])
            .unwrap();
        db.mark_as_error(RecordKind::Order, &[order.local_id.clone()], "unknown product")
            .unwrap();

        let health = get_sync_health(&db).unwrap();
        assert_eq!(health["backlog"]["error"], 1);
        let errors = health["recentErrors"].as_array().unwrap();
        assert_eq!(errors[0]["posLocalId"], order.local_id);
        assert_eq!(errors[0]["message"], "unknown product");
    }
}
