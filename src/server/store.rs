//! Authoritative server store (SQLite).
//!
//! Holds organizations, terminals, the product catalog, and every ingested
//! order and payment. Each order and payment row keeps the terminal's
//! `pos_local_id` under a UNIQUE index; that column exists only for
//! deduplication and is never used for business logic after ingestion.
//!
//! Every write that ingests a record runs in its own transaction. The
//! idempotency lookup happens inside the same transaction as the insert, so
//! two racing requests for one key can never both create a row.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::AuthContext;
use super::error::{ServerError, ServerResult};
use crate::protocol::{
    CatalogProduct, CatalogSnapshot, OrderDto, OrderTotals, PaymentDto,
};

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Result of an idempotent ingest write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// A new row was created with this server id.
    Created(String),
    /// A row with the same `pos_local_id` already existed.
    Duplicate(String),
}

impl Write {
    pub fn server_id(&self) -> &str {
        match self {
            Write::Created(id) | Write::Duplicate(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOrder {
    pub id: String,
    pub organization_id: String,
    pub terminal_id: String,
    pub cashier_id: String,
    pub order_number: String,
    pub pos_local_id: String,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub discount_amount: f64,
    pub total_amount: f64,
    pub item_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPayment {
    pub id: String,
    pub order_id: String,
    pub pos_local_id: String,
    pub method: String,
    pub amount: f64,
}

/// Thread-safe server store.
#[derive(Clone)]
pub struct ServerStore {
    conn: Arc<Mutex<Connection>>,
}

impl ServerStore {
    pub fn open(path: &Path) -> ServerResult<Self> {
        info!("Opening server database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> ServerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> ServerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ServerError::Internal(format!("store lock poisoned: {e}")))
    }
}

fn run_migrations(conn: &Connection) -> ServerResult<()> {
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
        debug!("Server schema up to date (v{current})");
        return Ok(());
    }
    if current < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

/// Migration v1: tenants, terminals, catalog, ledger.
fn migrate_v1(conn: &Connection) -> ServerResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS terminals (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            name TEXT NOT NULL,
            api_token TEXT NOT NULL UNIQUE,
            sync_requested INTEGER NOT NULL DEFAULT 0,
            last_sync_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            sku TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            category TEXT,
            price REAL NOT NULL,
            tax_rate REAL NOT NULL DEFAULT 0,
            barcode TEXT,
            image_url TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            stock_quantity INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            UNIQUE (organization_id, sku)
        );

        CREATE TABLE IF NOT EXISTS order_counters (
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            day TEXT NOT NULL,
            last_value INTEGER NOT NULL,
            PRIMARY KEY (organization_id, day)
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            terminal_id TEXT NOT NULL,
            cashier_id TEXT NOT NULL,
            order_number TEXT NOT NULL,
            pos_local_id TEXT NOT NULL,
            subtotal REAL NOT NULL,
            tax_amount REAL NOT NULL,
            discount_amount REAL NOT NULL,
            total_amount REAL NOT NULL,
            completed_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (organization_id, order_number)
        );

        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            product_id TEXT NOT NULL REFERENCES products(id),
            sku TEXT NOT NULL,
            name TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            tax_rate REAL NOT NULL,
            discount_amount REAL NOT NULL,
            tax_amount REAL NOT NULL,
            total REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            order_id TEXT NOT NULL REFERENCES orders(id),
            terminal_id TEXT NOT NULL,
            pos_local_id TEXT NOT NULL,
            method TEXT NOT NULL,
            amount REAL NOT NULL,
            reference TEXT,
            processed_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_pos_local_id ON orders(pos_local_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_pos_local_id ON payments(pos_local_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_payments_order ON payments(order_id);
        CREATE INDEX IF NOT EXISTS idx_products_org_active ON products(organization_id, is_active);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    info!("Applied server migration v1");
    Ok(())
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Existing row for `pos_local_id` in `table`, rejecting keys owned by
/// another organization.
fn existing_by_pos_local_id(
    tx: &Transaction<'_>,
    table: &str,
    organization_id: &str,
    pos_local_id: &str,
) -> ServerResult<Option<String>> {
    let sql = format!("SELECT id, organization_id FROM {table} WHERE pos_local_id = ?1");
    let found: Option<(String, String)> = tx
        .query_row(&sql, [pos_local_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;
    match found {
        Some((_, owner)) if owner != organization_id => Err(ServerError::BadRequest(format!(
            "posLocalId {pos_local_id} belongs to another organization"
        ))),
        Some((id, _)) => Ok(Some(id)),
        None => Ok(None),
    }
}

/// Allocate the next `ORD-YYYYMMDD-NNNNN` number for the organization.
fn next_order_number(
    tx: &Transaction<'_>,
    organization_id: &str,
    now: DateTime<Utc>,
) -> ServerResult<String> {
    let day = now.format("%Y%m%d").to_string();
    let seq: i64 = tx.query_row(
        "INSERT INTO order_counters (organization_id, day, last_value) VALUES (?1, ?2, 1)
         ON CONFLICT(organization_id, day) DO UPDATE SET last_value = last_value + 1
         RETURNING last_value",
        params![organization_id, day],
        |row| row.get(0),
    )?;
    Ok(format!("ORD-{day}-{seq:05}"))
}

// ---------------------------------------------------------------------------
// Organizations and terminals
// ---------------------------------------------------------------------------

impl ServerStore {
    /// Create the organization if it does not exist yet.
    pub fn ensure_organization(&self, id: &str, name: &str) -> ServerResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO organizations (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![id, name, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Register (or re-register) a terminal and issue a fresh API token.
    /// Re-registering rotates the token; the previous one stops working.
    pub fn register_terminal(
        &self,
        organization_id: &str,
        terminal_id: &str,
        name: &str,
    ) -> ServerResult<String> {
        let token = format!("pos_{}", Uuid::new_v4().simple());
        let conn = self.conn()?;
        let org_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM organizations WHERE id = ?1)",
            [organization_id],
            |row| row.get(0),
        )?;
        if !org_exists {
            return Err(ServerError::BadRequest(format!(
                "unknown organization {organization_id}"
            )));
        }
        let owner: Option<String> = conn
            .query_row(
                "SELECT organization_id FROM terminals WHERE id = ?1",
                [terminal_id],
                |row| row.get(0),
            )
            .optional()?;
        if owner.is_some_and(|o| o != organization_id) {
            return Err(ServerError::Forbidden(format!(
                "terminal {terminal_id} belongs to another organization"
            )));
        }
        conn.execute(
            "INSERT INTO terminals (id, organization_id, name, api_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, api_token = excluded.api_token",
            params![terminal_id, organization_id, name, token, ts(Utc::now())],
        )?;
        info!(terminal_id, organization_id, "Terminal registered");
        Ok(token)
    }

    /// Resolve a bearer token to its terminal scope.
    pub fn authenticate(&self, token: &str) -> ServerResult<Option<AuthContext>> {
        let conn = self.conn()?;
        let ctx = conn
            .query_row(
                "SELECT organization_id, id FROM terminals WHERE api_token = ?1",
                [token],
                |row| {
                    Ok(AuthContext {
                        organization_id: row.get(0)?,
                        terminal_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(ctx)
    }

    /// Raise the "please sync" flag. Returns false for an unknown terminal.
    pub fn request_sync(&self, terminal_id: &str) -> ServerResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE terminals SET sync_requested = 1 WHERE id = ?1",
            [terminal_id],
        )?;
        Ok(changed > 0)
    }

    pub fn sync_requested(&self, terminal_id: &str) -> ServerResult<bool> {
        let conn = self.conn()?;
        let flag: Option<bool> = conn
            .query_row(
                "SELECT sync_requested FROM terminals WHERE id = ?1",
                [terminal_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    pub fn clear_sync_requested(&self, terminal_id: &str) -> ServerResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE terminals SET sync_requested = 0 WHERE id = ?1",
            [terminal_id],
        )?;
        Ok(())
    }

    pub fn record_terminal_sync(&self, terminal_id: &str, at: DateTime<Utc>) -> ServerResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE terminals SET last_sync_at = ?2 WHERE id = ?1",
            params![terminal_id, ts(at)],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

impl ServerStore {
    pub fn upsert_product(&self, organization_id: &str, product: &CatalogProduct) -> ServerResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO products (
                id, organization_id, sku, name, description, category, price, tax_rate,
                barcode, image_url, is_active, stock_quantity, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                sku = excluded.sku,
                name = excluded.name,
                description = excluded.description,
                category = excluded.category,
                price = excluded.price,
                tax_rate = excluded.tax_rate,
                barcode = excluded.barcode,
                image_url = excluded.image_url,
                is_active = excluded.is_active,
                stock_quantity = excluded.stock_quantity,
                updated_at = excluded.updated_at
             WHERE products.organization_id = excluded.organization_id",
            params![
                product.id,
                organization_id,
                product.sku,
                product.name,
                product.description,
                product.category,
                product.price,
                product.tax_rate,
                product.barcode,
                product.image_url,
                product.is_active,
                product.stock_quantity.unwrap_or(0),
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Every active product of the organization. Always the full set.
    pub fn active_catalog(&self, organization_id: &str) -> ServerResult<CatalogSnapshot> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sku, name, description, category, price, tax_rate, barcode,
                    image_url, is_active, stock_quantity, updated_at
             FROM products
             WHERE organization_id = ?1 AND is_active = 1
             ORDER BY name, id",
        )?;
        let mut last_updated: Option<DateTime<Utc>> = None;
        let rows = stmt.query_map([organization_id], |row| {
            let updated_at: String = row.get(11)?;
            Ok((
                CatalogProduct {
                    id: row.get(0)?,
                    sku: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    category: row.get(4)?,
                    price: row.get(5)?,
                    tax_rate: row.get(6)?,
                    barcode: row.get(7)?,
                    image_url: row.get(8)?,
                    is_active: row.get(9)?,
                    stock_quantity: Some(row.get(10)?),
                },
                updated_at,
            ))
        })?;
        let mut products = Vec::new();
        for row in rows {
            let (product, updated_at) = row?;
            if let Some(at) = parse_ts(&updated_at) {
                last_updated = Some(last_updated.map_or(at, |cur| cur.max(at)));
            }
            products.push(product);
        }
        Ok(CatalogSnapshot {
            products,
            last_updated: last_updated.unwrap_or_else(Utc::now),
        })
    }

    pub fn product_stock(&self, organization_id: &str, product_id: &str) -> ServerResult<Option<i64>> {
        let conn = self.conn()?;
        let stock = conn
            .query_row(
                "SELECT stock_quantity FROM products WHERE id = ?1 AND organization_id = ?2",
                [product_id, organization_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stock)
    }
}

// ---------------------------------------------------------------------------
// Ledger writes
// ---------------------------------------------------------------------------

impl ServerStore {
    /// Idempotently create an order with its items, decrementing stock.
    ///
    /// Runs as one transaction: on any error nothing is written, so a later
    /// retry with the same `pos_local_id` attempts creation again. Stock may
    /// go negative; an offline sale that already happened is never refused
    /// for lack of stock.
    pub fn create_order(
        &self,
        ctx: &AuthContext,
        order: &OrderDto,
        totals: &OrderTotals,
    ) -> ServerResult<Write> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(id) =
            existing_by_pos_local_id(&tx, "orders", &ctx.organization_id, &order.pos_local_id)?
        {
            return Ok(Write::Duplicate(id));
        }

        let now = Utc::now();
        let order_id = new_id();
        let order_number = next_order_number(&tx, &ctx.organization_id, now)?;
        tx.execute(
            "INSERT INTO orders (
                id, organization_id, terminal_id, cashier_id, order_number, pos_local_id,
                subtotal, tax_amount, discount_amount, total_amount, completed_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                order_id,
                ctx.organization_id,
                ctx.terminal_id,
                order.cashier_id,
                order_number,
                order.pos_local_id,
                totals.subtotal,
                totals.tax_amount,
                totals.discount_amount,
                totals.total_amount,
                ts(order.completed_at),
                ts(now),
            ],
        )?;

        for item in &order.items {
            let stock: Option<i64> = tx
                .query_row(
                    "UPDATE products SET stock_quantity = stock_quantity - ?1
                     WHERE id = ?2 AND organization_id = ?3
                     RETURNING stock_quantity",
                    params![item.quantity, item.product_id, ctx.organization_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(stock) = stock else {
                return Err(ServerError::BadRequest(format!(
                    "unknown product {}",
                    item.product_id
                )));
            };
            if stock < 0 {
                warn!(
                    product_id = %item.product_id,
                    stock,
                    order_number = %order_number,
                    "Stock went negative"
                );
            }

            let line = item.totals();
            tx.execute(
                "INSERT INTO order_items (
                    id, order_id, product_id, sku, name, quantity, unit_price, tax_rate,
                    discount_amount, tax_amount, total
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new_id(),
                    order_id,
                    item.product_id,
                    item.sku,
                    item.name,
                    item.quantity,
                    item.unit_price,
                    item.tax_rate,
                    line.discount,
                    line.tax,
                    line.total,
                ],
            )?;
        }

        tx.commit()?;
        info!(
            pos_local_id = %order.pos_local_id,
            order_number = %order_number,
            terminal_id = %ctx.terminal_id,
            "Order ingested"
        );
        Ok(Write::Created(order_id))
    }

    /// Idempotently create a payment. The owning order is resolved by server
    /// id first, then by the order's `pos_local_id`, both within the
    /// caller's organization.
    pub fn create_payment(&self, ctx: &AuthContext, payment: &PaymentDto) -> ServerResult<Write> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(id) =
            existing_by_pos_local_id(&tx, "payments", &ctx.organization_id, &payment.pos_local_id)?
        {
            return Ok(Write::Duplicate(id));
        }

        let by_server_id = match payment.order_id.as_deref() {
            Some(order_id) => tx
                .query_row(
                    "SELECT id FROM orders WHERE id = ?1 AND organization_id = ?2",
                    [order_id, ctx.organization_id.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?,
            None => None,
        };
        let order_id = match (by_server_id, payment.order_pos_local_id.as_deref()) {
            (Some(id), _) => Some(id),
            (None, Some(local)) => tx
                .query_row(
                    "SELECT id FROM orders WHERE pos_local_id = ?1 AND organization_id = ?2",
                    [local, ctx.organization_id.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?,
            (None, None) => None,
        };
        let Some(order_id) = order_id else {
            return Err(ServerError::BadRequest(format!(
                "order not found for payment {}",
                payment.pos_local_id
            )));
        };

        let payment_id = new_id();
        tx.execute(
            "INSERT INTO payments (
                id, organization_id, order_id, terminal_id, pos_local_id, method, amount,
                reference, processed_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                payment_id,
                ctx.organization_id,
                order_id,
                ctx.terminal_id,
                payment.pos_local_id,
                payment.method.as_str(),
                payment.amount,
                payment.reference,
                ts(payment.processed_at),
                ts(Utc::now()),
            ],
        )?;
        tx.commit()?;
        debug!(pos_local_id = %payment.pos_local_id, order_id = %order_id, "Payment ingested");
        Ok(Write::Created(payment_id))
    }
}

// ---------------------------------------------------------------------------
// Ledger reads
// ---------------------------------------------------------------------------

impl ServerStore {
    pub fn order_by_pos_local_id(&self, pos_local_id: &str) -> ServerResult<Option<ServerOrder>> {
        let conn = self.conn()?;
        let order = conn
            .query_row(
                "SELECT o.id, o.organization_id, o.terminal_id, o.cashier_id, o.order_number,
                        o.pos_local_id, o.subtotal, o.tax_amount, o.discount_amount,
                        o.total_amount,
                        (SELECT COUNT(*) FROM order_items i WHERE i.order_id = o.id)
                 FROM orders o WHERE o.pos_local_id = ?1",
                [pos_local_id],
                |row| {
                    Ok(ServerOrder {
                        id: row.get(0)?,
                        organization_id: row.get(1)?,
                        terminal_id: row.get(2)?,
                        cashier_id: row.get(3)?,
                        order_number: row.get(4)?,
                        pos_local_id: row.get(5)?,
                        subtotal: row.get(6)?,
                        tax_amount: row.get(7)?,
                        discount_amount: row.get(8)?,
                        total_amount: row.get(9)?,
                        item_count: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(order)
    }

    pub fn payments_for_order(&self, order_id: &str) -> ServerResult<Vec<ServerPayment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, order_id, pos_local_id, method, amount
             FROM payments WHERE order_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([order_id], |row| {
            Ok(ServerPayment {
                id: row.get(0)?,
                order_id: row.get(1)?,
                pos_local_id: row.get(2)?,
                method: row.get(3)?,
                amount: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_orders(&self, organization_id: &str) -> ServerResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE organization_id = ?1",
            [organization_id],
            |row| row.get(0),
        )?)
    }

    pub fn count_payments(&self, organization_id: &str) -> ServerResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM payments WHERE organization_id = ?1",
            [organization_id],
            |row| row.get(0),
        )?)
    }
}
