//! Local SQLite store for the terminal.
//!
//! Uses rusqlite with WAL mode. Holds locally recorded orders and payments,
//! their sync status, the read-only product cache and the small key/value
//! sync metadata table. Every status transition is a guarded `UPDATE` so a
//! record can only move `pending -> syncing -> synced | error` (and
//! `error -> syncing` on retry); `synced` rows are additionally protected by
//! triggers.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{validate_items, CatalogProduct, OrderItem, OrderTotals, PaymentMethod};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const META_TERMINAL_ID: &str = "terminal_id";
const META_LAST_SYNC_AT: &str = "last_sync_at";
const META_CATALOG_UPDATED_AT: &str = "catalog_updated_at";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Durable writes are no longer possible (disk full, read-only media,
    /// unreadable file). Checkout must stop.
    #[error("local storage unavailable: {0}")]
    Fatal(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database lock poisoned")]
    Lock,

    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            match failure.code {
                ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::OutOfMemory => {
                    error!(error = %err, "local storage failure");
                    return StoreError::Fatal(err.to_string());
                }
                _ => {}
            }
        }
        StoreError::Sqlite(err)
    }
}

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Sync lifecycle of a local record, independent of its business status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => Err(StoreError::InvalidInput(format!("sync status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,
    Completed,
    Void,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Void => "VOID",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "VOID" => Ok(OrderStatus::Void),
            other => Err(StoreError::InvalidInput(format!("order status '{other}'"))),
        }
    }
}

/// Which local table a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Order,
    Payment,
}

impl RecordKind {
    fn table(&self) -> &'static str {
        match self {
            RecordKind::Order => "local_orders",
            RecordKind::Payment => "local_payments",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Order => "order",
            RecordKind::Payment => "payment",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalOrder {
    pub local_id: String,
    pub terminal_id: String,
    pub cashier_id: String,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub discount_amount: f64,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub server_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalPayment {
    pub local_id: String,
    pub order_local_id: String,
    pub order_server_id: Option<String>,
    pub terminal_id: String,
    pub method: PaymentMethod,
    /// Negative for refunds.
    pub amount: f64,
    pub reference: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub server_id: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Orders and payments selected for a sync round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncItems {
    pub orders: Vec<LocalOrder>,
    pub payments: Vec<LocalPayment>,
}

impl SyncItems {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.payments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.orders.len() + self.payments.len()
    }
}

/// Per-status record counts used for the UI badge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub pending: i64,
    pub syncing: i64,
    pub error: i64,
}

impl SyncCounts {
    /// Records that still need to reach the server.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.syncing + self.error
    }
}

/// Checkout input for a new order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub terminal_id: String,
    pub cashier_id: String,
    pub items: Vec<OrderItem>,
    /// Create directly as COMPLETED (the usual checkout path) instead of a
    /// PENDING draft.
    pub complete: bool,
}

/// Checkout input for a payment or refund.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_local_id: String,
    pub method: PaymentMethod,
    pub amount: f64,
    pub reference: Option<String>,
}

/// A record currently in `error`, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorEntry {
    pub kind: &'static str,
    pub pos_local_id: String,
    pub message: Option<String>,
    pub updated_at: String,
}

/// Rows removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub orders: usize,
    pub payments: usize,
}

// ---------------------------------------------------------------------------
// Connection management
// ---------------------------------------------------------------------------

/// Handle to the terminal database.
pub struct DbState {
    conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Initialize the database at `{data_dir}/pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas and
/// runs any pending migrations. Unlike a cache, this file holds sales that
/// may not have reached the server yet, so an open failure is surfaced as
/// fatal instead of recreating the file.
pub fn init(data_dir: &Path) -> StoreResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| StoreError::Fatal(format!("create data dir: {e}")))?;
    DbState::open(&data_dir.join("pos.db"))
}

impl DbState {
    pub fn open(path: &Path) -> StoreResult<Self> {
        info!("Opening database at {}", path.display());
        let conn = Connection::open(path).map_err(|e| StoreError::Fatal(format!("sqlite open: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        run_migrations(&conn)?;
        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    /// Reject every write from here on, the way a full or read-only volume
    /// would.
    #[cfg(test)]
    pub(crate) fn set_query_only(&self, on: bool) -> StoreResult<()> {
        self.conn()?.pragma_update(None, "query_only", on)?;
        Ok(())
    }
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: orders, payments, product cache, sync metadata.
fn migrate_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_orders (
            local_id TEXT PRIMARY KEY,
            terminal_id TEXT NOT NULL,
            cashier_id TEXT NOT NULL,
            items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'COMPLETED', 'VOID')),
            sync_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (sync_status IN ('pending', 'syncing', 'synced', 'error')),
            sync_error TEXT,
            server_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            synced_at TEXT
        );

        CREATE TABLE IF NOT EXISTS local_payments (
            local_id TEXT PRIMARY KEY,
            order_local_id TEXT NOT NULL,
            order_server_id TEXT,
            terminal_id TEXT NOT NULL,
            method TEXT NOT NULL,
            amount REAL NOT NULL,
            reference TEXT,
            processed_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (sync_status IN ('pending', 'syncing', 'synced', 'error')),
            sync_error TEXT,
            server_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced_at TEXT,
            FOREIGN KEY(order_local_id) REFERENCES local_orders(local_id)
        );

        CREATE TABLE IF NOT EXISTS product_cache (
            id TEXT PRIMARY KEY,
            sku TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            category TEXT,
            price REAL NOT NULL,
            tax_rate REAL NOT NULL DEFAULT 0,
            barcode TEXT,
            image_url TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            stock_quantity INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_local_orders_sync_status ON local_orders(sync_status);
        CREATE INDEX IF NOT EXISTS idx_local_orders_created_at ON local_orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_local_payments_sync_status ON local_payments(sync_status);
        CREATE INDEX IF NOT EXISTS idx_local_payments_order ON local_payments(order_local_id);
        CREATE INDEX IF NOT EXISTS idx_product_cache_sku ON product_cache(sku);
        CREATE INDEX IF NOT EXISTS idx_product_cache_barcode ON product_cache(barcode);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StoreError::from(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: `synced` is terminal. Reject any update that moves a synced
/// row to another sync status.
fn migrate_v2(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TRIGGER IF NOT EXISTS trg_local_orders_synced_is_final
        BEFORE UPDATE OF sync_status ON local_orders
        WHEN OLD.sync_status = 'synced' AND NEW.sync_status <> 'synced'
        BEGIN
            SELECT RAISE(ABORT, 'synced order cannot change sync status');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_local_payments_synced_is_final
        BEFORE UPDATE OF sync_status ON local_payments
        WHEN OLD.sync_status = 'synced' AND NEW.sync_status <> 'synced'
        BEGIN
            SELECT RAISE(ABORT, 'synced payment cannot change sync status');
        END;

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StoreError::from(e)
    })?;

    info!("Applied migration v2 (sync status triggers)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn conversion_err(idx: usize, err: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| conversion_err(idx, StoreError::InvalidInput(format!("timestamp '{raw}'"))))
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_ts))
}

const ORDER_COLUMNS: &str = "local_id, terminal_id, cashier_id, items, subtotal, tax_amount,
    discount_amount, total_amount, status, sync_status, sync_error, server_id,
    created_at, completed_at, synced_at";

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<LocalOrder> {
    let items_json: String = row.get(3)?;
    let items: Vec<OrderItem> = serde_json::from_str(&items_json)
        .map_err(|e| conversion_err(3, StoreError::Serialization(e)))?;
    let status: String = row.get(8)?;
    let sync_status: String = row.get(9)?;
    Ok(LocalOrder {
        local_id: row.get(0)?,
        terminal_id: row.get(1)?,
        cashier_id: row.get(2)?,
        items,
        subtotal: row.get(4)?,
        tax_amount: row.get(5)?,
        discount_amount: row.get(6)?,
        total_amount: row.get(7)?,
        status: status.parse().map_err(|e| conversion_err(8, e))?,
        sync_status: sync_status.parse().map_err(|e| conversion_err(9, e))?,
        sync_error: row.get(10)?,
        server_id: row.get(11)?,
        created_at: ts_column(row, 12)?,
        completed_at: opt_ts_column(row, 13)?,
        synced_at: opt_ts_column(row, 14)?,
    })
}

const PAYMENT_COLUMNS: &str = "local_id, order_local_id, order_server_id, terminal_id, method,
    amount, reference, processed_at, sync_status, sync_error, server_id, synced_at";

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<LocalPayment> {
    let method: String = row.get(4)?;
    let sync_status: String = row.get(8)?;
    Ok(LocalPayment {
        local_id: row.get(0)?,
        order_local_id: row.get(1)?,
        order_server_id: row.get(2)?,
        terminal_id: row.get(3)?,
        method: PaymentMethod::parse(&method),
        amount: row.get(5)?,
        reference: row.get(6)?,
        processed_at: ts_column(row, 7)?,
        sync_status: sync_status.parse().map_err(|e| conversion_err(8, e))?,
        sync_error: row.get(9)?,
        server_id: row.get(10)?,
        synced_at: opt_ts_column(row, 11)?,
    })
}

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogProduct> {
    Ok(CatalogProduct {
        id: row.get(0)?,
        sku: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        price: row.get(5)?,
        tax_rate: row.get(6)?,
        barcode: row.get(7)?,
        image_url: row.get(8)?,
        is_active: row.get::<_, i64>(9)? != 0,
        stock_quantity: row.get(10)?,
    })
}

/// Payments only leave the terminal once their order is a completed sale.
const PAYMENT_PARENT_COMPLETED: &str = "order_local_id IN (
    SELECT local_id FROM local_orders WHERE status = 'COMPLETED')";

fn query_orders(conn: &Connection, where_clause: &str) -> StoreResult<Vec<LocalOrder>> {
    let sql = format!(
        "SELECT {ORDER_COLUMNS} FROM local_orders WHERE {where_clause} ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], order_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_payments(conn: &Connection, where_clause: &str) -> StoreResult<Vec<LocalPayment>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM local_payments WHERE {where_clause} ORDER BY processed_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], payment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn meta_get(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM sync_metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn meta_set(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, ts(Utc::now())],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Checkout-side writes
// ---------------------------------------------------------------------------

impl DbState {
    /// Record a sale. Totals are always computed here with the canonical
    /// formula; the caller only supplies line items.
    pub fn create_order(&self, new: &NewOrder) -> StoreResult<LocalOrder> {
        validate_items(&new.items).map_err(StoreError::InvalidInput)?;
        if new.terminal_id.trim().is_empty() || new.cashier_id.trim().is_empty() {
            return Err(StoreError::InvalidInput("terminal and cashier are required".into()));
        }

        let totals = OrderTotals::from_items(&new.items);
        let now = Utc::now();
        let local_id = Uuid::new_v4().to_string();
        let status = if new.complete {
            OrderStatus::Completed
        } else {
            OrderStatus::Pending
        };
        let completed_at = new.complete.then_some(now);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO local_orders (
                local_id, terminal_id, cashier_id, items, subtotal, tax_amount,
                discount_amount, total_amount, status, sync_status,
                created_at, updated_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?10, ?11)",
            params![
                local_id,
                new.terminal_id,
                new.cashier_id,
                serde_json::to_string(&new.items)?,
                totals.subtotal,
                totals.tax_amount,
                totals.discount_amount,
                totals.total_amount,
                status.as_str(),
                ts(now),
                completed_at.map(ts),
            ],
        )?;

        info!(
            pos_local_id = %local_id,
            total = totals.total_amount,
            status = status.as_str(),
            "Order recorded locally"
        );

        let order = conn.query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM local_orders WHERE local_id = ?1"),
            params![local_id],
            order_from_row,
        )?;
        Ok(order)
    }

    /// PENDING -> COMPLETED. Makes the order eligible for sync.
    pub fn complete_order(&self, local_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let now = ts(Utc::now());
        let changed = conn.execute(
            "UPDATE local_orders
             SET status = 'COMPLETED', completed_at = ?1, updated_at = ?1
             WHERE local_id = ?2 AND status = 'PENDING'",
            params![now, local_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("pending order {local_id}")));
        }
        Ok(())
    }

    /// PENDING -> VOID. Voided drafts never leave the terminal; a completed
    /// sale is reversed with a negative payment instead.
    pub fn void_order(&self, local_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE local_orders SET status = 'VOID', updated_at = ?1
             WHERE local_id = ?2 AND status = 'PENDING'",
            params![ts(Utc::now()), local_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("pending order {local_id}")));
        }
        Ok(())
    }

    /// Record a payment (or a refund when `amount` is negative) against a
    /// local order.
    pub fn record_payment(&self, new: &NewPayment) -> StoreResult<LocalPayment> {
        if !new.amount.is_finite() || new.amount == 0.0 {
            return Err(StoreError::InvalidInput("payment amount must be non-zero".into()));
        }

        let conn = self.conn()?;
        let parent: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT terminal_id, server_id, status FROM local_orders WHERE local_id = ?1",
                params![new.order_local_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (terminal_id, order_server_id, status) = parent
            .ok_or_else(|| StoreError::NotFound(format!("order {}", new.order_local_id)))?;
        if status == OrderStatus::Void.as_str() {
            return Err(StoreError::InvalidInput(format!(
                "order {} is void",
                new.order_local_id
            )));
        }

        let now = ts(Utc::now());
        let local_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO local_payments (
                local_id, order_local_id, order_server_id, terminal_id, method, amount,
                reference, processed_at, sync_status, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?8, ?8)",
            params![
                local_id,
                new.order_local_id,
                order_server_id,
                terminal_id,
                new.method.as_str(),
                new.amount,
                new.reference,
                now,
            ],
        )?;

        info!(
            pos_local_id = %local_id,
            order_pos_local_id = %new.order_local_id,
            amount = new.amount,
            "Payment recorded locally"
        );

        let payment = conn.query_row(
            &format!("SELECT {PAYMENT_COLUMNS} FROM local_payments WHERE local_id = ?1"),
            params![local_id],
            payment_from_row,
        )?;
        Ok(payment)
    }

    pub fn get_order(&self, local_id: &str) -> StoreResult<LocalOrder> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM local_orders WHERE local_id = ?1"),
            params![local_id],
            order_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("order {local_id}")))
    }

    pub fn get_payment(&self, local_id: &str) -> StoreResult<LocalPayment> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {PAYMENT_COLUMNS} FROM local_payments WHERE local_id = ?1"),
            params![local_id],
            payment_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("payment {local_id}")))
    }
}

// ---------------------------------------------------------------------------
// Sync queue reads and status transitions
// ---------------------------------------------------------------------------

impl DbState {
    /// Completed orders and payments waiting for their first sync attempt.
    pub fn get_pending_sync_items(&self) -> StoreResult<SyncItems> {
        let conn = self.conn()?;
        Ok(SyncItems {
            orders: query_orders(&conn, "sync_status = 'pending' AND status = 'COMPLETED'")?,
            payments: query_payments(
                &conn,
                &format!("sync_status = 'pending' AND {PAYMENT_PARENT_COMPLETED}"),
            )?,
        })
    }

    /// Pending plus previously failed records, across all days.
    pub fn get_failed_and_pending_sync_items(&self) -> StoreResult<SyncItems> {
        let conn = self.conn()?;
        Ok(SyncItems {
            orders: query_orders(
                &conn,
                "sync_status IN ('pending', 'error') AND status = 'COMPLETED'",
            )?,
            payments: query_payments(
                &conn,
                &format!("sync_status IN ('pending', 'error') AND {PAYMENT_PARENT_COMPLETED}"),
            )?,
        })
    }

    /// Number of records the retry sweep should act on: every `error` record
    /// plus `pending` records created before `stale_before`.
    pub fn count_retry_candidates(&self, stale_before: DateTime<Utc>) -> StoreResult<i64> {
        let conn = self.conn()?;
        let cutoff = ts(stale_before);
        let orders: i64 = conn.query_row(
            "SELECT COUNT(*) FROM local_orders
             WHERE status = 'COMPLETED'
               AND (sync_status = 'error' OR (sync_status = 'pending' AND created_at < ?1))",
            params![cutoff],
            |row| row.get(0),
        )?;
        let payments: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM local_payments
                 WHERE (sync_status = 'error' OR (sync_status = 'pending' AND created_at < ?1))
                   AND {PAYMENT_PARENT_COMPLETED}"
            ),
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(orders + payments)
    }

    pub fn sync_counts(&self) -> StoreResult<SyncCounts> {
        let conn = self.conn()?;
        let mut counts = SyncCounts::default();
        let mut stmt = conn.prepare(&format!(
            "SELECT sync_status, COUNT(*) FROM local_orders
             WHERE status = 'COMPLETED' GROUP BY sync_status
             UNION ALL
             SELECT sync_status, COUNT(*) FROM local_payments
             WHERE {PAYMENT_PARENT_COMPLETED} GROUP BY sync_status"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "pending" => counts.pending += n,
                "syncing" => counts.syncing += n,
                "error" => counts.error += n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Most recent records in `error`, newest first.
    pub fn recent_sync_errors(&self, limit: i64) -> StoreResult<Vec<SyncErrorEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT 'order', local_id, sync_error, updated_at FROM local_orders
             WHERE sync_status = 'error'
             UNION ALL
             SELECT 'payment', local_id, sync_error, updated_at FROM local_payments
             WHERE sync_status = 'error'
             ORDER BY 4 DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let kind: String = row.get(0)?;
                Ok(SyncErrorEntry {
                    kind: if kind == "order" {
                        RecordKind::Order.as_str()
                    } else {
                        RecordKind::Payment.as_str()
                    },
                    pos_local_id: row.get(1)?,
                    message: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `pending | error -> syncing`. Returns the ids that actually moved;
    /// anything already syncing or synced is left alone.
    pub fn mark_as_syncing(&self, kind: RecordKind, ids: &[String]) -> StoreResult<Vec<String>> {
        let extra = match kind {
            RecordKind::Order => " AND status = 'COMPLETED'",
            RecordKind::Payment => "",
        };
        let sql = format!(
            "UPDATE {} SET sync_status = 'syncing', updated_at = ?1
             WHERE local_id = ?2 AND sync_status IN ('pending', 'error'){extra}",
            kind.table()
        );
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = ts(Utc::now());
        let mut moved = Vec::with_capacity(ids.len());
        {
            let mut stmt = tx.prepare(&sql)?;
            for id in ids {
                if stmt.execute(params![now, id])? == 1 {
                    moved.push(id.clone());
                }
            }
        }
        tx.commit()?;
        Ok(moved)
    }

    /// `syncing -> synced`, recording the server id when one was returned.
    /// Syncing an order also stamps its server id on the order's payments.
    pub fn mark_as_synced(
        &self,
        kind: RecordKind,
        records: &[(String, Option<String>)],
    ) -> StoreResult<usize> {
        let sql = format!(
            "UPDATE {} SET sync_status = 'synced', sync_error = NULL,
                 server_id = COALESCE(?1, server_id), synced_at = ?2, updated_at = ?2
             WHERE local_id = ?3 AND sync_status = 'syncing'",
            kind.table()
        );
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = ts(Utc::now());
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for (local_id, server_id) in records {
                let n = stmt.execute(params![server_id, now, local_id])?;
                if n == 0 {
                    warn!(kind = kind.as_str(), pos_local_id = %local_id, "Record not in syncing state; skipped synced transition");
                }
                changed += n;
                if kind == RecordKind::Order && n == 1 {
                    if let Some(server_id) = server_id {
                        propagate_order_server_id(&tx, local_id, server_id)?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// `syncing -> error` with a reason kept for diagnostics.
    pub fn mark_as_error(&self, kind: RecordKind, ids: &[String], reason: &str) -> StoreResult<usize> {
        let sql = format!(
            "UPDATE {} SET sync_status = 'error', sync_error = ?1, updated_at = ?2
             WHERE local_id = ?3 AND sync_status = 'syncing'",
            kind.table()
        );
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = ts(Utc::now());
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for id in ids {
                changed += stmt.execute(params![reason, now, id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Move rows stranded in `syncing` by a process that died mid-round to
    /// `error`, so the retry sweep picks them up.
    pub fn recover_interrupted(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let now = ts(Utc::now());
        let mut total = 0;
        for kind in [RecordKind::Order, RecordKind::Payment] {
            total += conn.execute(
                &format!(
                    "UPDATE {} SET sync_status = 'error',
                         sync_error = 'interrupted before completion', updated_at = ?1
                     WHERE sync_status = 'syncing'",
                    kind.table()
                ),
                params![now],
            )?;
        }
        if total > 0 {
            warn!(records = total, "Recovered records stranded in syncing state");
        }
        Ok(total)
    }

    /// Delete synced records whose `synced_at` is older than `older_than_days`.
    /// Orders are kept while any of their payments remain.
    pub fn cleanup_synced(&self, older_than_days: i64) -> StoreResult<CleanupReport> {
        let cutoff = ts(Utc::now() - ChronoDuration::days(older_than_days.max(0)));
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let payments = tx.execute(
            "DELETE FROM local_payments WHERE sync_status = 'synced' AND synced_at < ?1",
            params![cutoff],
        )?;
        let orders = tx.execute(
            "DELETE FROM local_orders
             WHERE sync_status = 'synced' AND synced_at < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM local_payments p WHERE p.order_local_id = local_orders.local_id
               )",
            params![cutoff],
        )?;
        tx.commit()?;
        if orders + payments > 0 {
            info!(orders, payments, "Retention cleanup removed synced records");
        }
        Ok(CleanupReport { orders, payments })
    }
}

fn propagate_order_server_id(tx: &Transaction<'_>, order_local_id: &str, server_id: &str) -> StoreResult<()> {
    tx.execute(
        "UPDATE local_payments SET order_server_id = ?1
         WHERE order_local_id = ?2 AND order_server_id IS NULL",
        params![server_id, order_local_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Catalog cache and metadata
// ---------------------------------------------------------------------------

impl DbState {
    /// Clear and repopulate the product cache in one transaction. Readers see
    /// either the previous full set or the new one.
    pub fn replace_catalog(
        &self,
        products: &[CatalogProduct],
        last_updated: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM product_cache", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO product_cache (
                    id, sku, name, description, category, price, tax_rate,
                    barcode, image_url, is_active, stock_quantity
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for p in products {
                stmt.execute(params![
                    p.id,
                    p.sku,
                    p.name,
                    p.description,
                    p.category,
                    p.price,
                    p.tax_rate,
                    p.barcode,
                    p.image_url,
                    p.is_active as i64,
                    p.stock_quantity,
                ])?;
            }
        }
        meta_set(&tx, META_CATALOG_UPDATED_AT, &ts(last_updated))?;
        tx.commit()?;
        debug!(products = products.len(), "Product cache replaced");
        Ok(())
    }

    pub fn get_catalog(&self) -> StoreResult<Vec<CatalogProduct>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sku, name, description, category, price, tax_rate,
                    barcode, image_url, is_active, stock_quantity
             FROM product_cache ORDER BY name ASC, id ASC",
        )?;
        let products = stmt
            .query_map([], product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    pub fn get_product(&self, id: &str) -> StoreResult<Option<CatalogProduct>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, sku, name, description, category, price, tax_rate,
                        barcode, image_url, is_active, stock_quantity
                 FROM product_cache WHERE id = ?1",
                params![id],
                product_from_row,
            )
            .optional()?)
    }

    pub fn get_catalog_updated_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        Ok(meta_get(&conn, META_CATALOG_UPDATED_AT)?.as_deref().and_then(parse_ts))
    }

    pub fn get_last_sync_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        Ok(meta_get(&conn, META_LAST_SYNC_AT)?.as_deref().and_then(parse_ts))
    }

    pub fn set_last_sync_time(&self, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn()?;
        meta_set(&conn, META_LAST_SYNC_AT, &ts(at))
    }

    pub fn get_terminal_id(&self) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        meta_get(&conn, META_TERMINAL_ID)
    }

    pub fn set_terminal_id(&self, terminal_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        meta_set(&conn, META_TERMINAL_ID, terminal_id)
    }
}
