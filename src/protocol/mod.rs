//! Sync wire protocol shared by the terminal engine and the ingestion server.
//!
//! One request/response pair per sync round: the terminal posts its batch of
//! unsynced orders and payments, the server answers with a per-record outcome
//! manifest and a full catalog snapshot. Field names are camelCase on the wire.
//!
//! The `posLocalId` on every order and payment is the idempotency key for the
//! whole protocol. The server never creates a second row for a key it has
//! already accepted; it answers `DUPLICATE` instead.

pub mod pricing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use pricing::{round2, LineTotals, OrderTotals};

/// Sync endpoint (terminal -> server).
pub const SYNC_PATH: &str = "/api/pos/sync";
/// Remote "please sync" flag for the calling terminal.
pub const SYNC_REQUESTED_PATH: &str = "/api/pos/terminals/sync-requested";
/// Clears the remote "please sync" flag for the calling terminal.
pub const SYNC_REQUESTED_CLEAR_PATH: &str = "/api/pos/terminals/sync-requested/clear";
/// Lightweight health check used as the connectivity probe.
pub const HEALTH_PATH: &str = "/api/health";
/// Header carrying the terminal id alongside the bearer token.
pub const TERMINAL_ID_HEADER: &str = "x-terminal-id";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Batch sent by a terminal in one sync round. An empty batch is valid and
/// still returns a catalog snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub terminal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub orders: Vec<OrderDto>,
    #[serde(default)]
    pub payments: Vec<PaymentDto>,
}

impl SyncRequest {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.payments.is_empty()
    }
}

/// A completed sale as recorded by the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDto {
    pub pos_local_id: String,
    pub terminal_id: String,
    pub cashier_id: String,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub discount_amount: f64,
    pub total_amount: f64,
    pub completed_at: DateTime<Utc>,
}

impl OrderDto {
    /// Totals recomputed from the line items with the canonical formula.
    pub fn computed_totals(&self) -> OrderTotals {
        OrderTotals::from_items(&self.items)
    }

    /// Totals as reported by the terminal.
    pub fn reported_totals(&self) -> OrderTotals {
        OrderTotals {
            subtotal: self.subtotal,
            discount_amount: self.discount_amount,
            tax_amount: self.tax_amount,
            total_amount: self.total_amount,
        }
    }
}

/// One order line. Also the shape persisted in the terminal's order rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
    /// Fraction, e.g. `0.2` for 20 %.
    pub tax_rate: f64,
    #[serde(default)]
    pub discount_amount: f64,
}

impl OrderItem {
    pub fn totals(&self) -> LineTotals {
        LineTotals::compute(
            self.quantity,
            self.unit_price,
            self.tax_rate,
            self.discount_amount,
        )
    }

    /// Line rules shared by checkout and ingestion. Returns are recorded as
    /// negative payments, never as negative lines.
    pub fn validate(&self) -> Result<(), String> {
        if self.quantity <= 0 {
            return Err(format!(
                "invalid quantity {} for {}",
                self.quantity, self.product_id
            ));
        }
        if !self.unit_price.is_finite() || self.unit_price < 0.0 {
            return Err(format!("invalid price for {}", self.product_id));
        }
        if !self.tax_rate.is_finite() || self.tax_rate < 0.0 {
            return Err(format!("invalid tax rate for {}", self.product_id));
        }
        if !self.discount_amount.is_finite() || self.discount_amount < 0.0 {
            return Err(format!("invalid discount for {}", self.product_id));
        }
        Ok(())
    }
}

/// An order needs at least one line and every line must pass
/// [`OrderItem::validate`].
pub fn validate_items(items: &[OrderItem]) -> Result<(), String> {
    if items.is_empty() {
        return Err("order has no items".to_string());
    }
    items.iter().try_for_each(OrderItem::validate)
}

/// A tender (or refund, when `amount` is negative) against an order.
///
/// The owning order is referenced by server id when the terminal already
/// knows it, and always by the order's `posLocalId` so the server can resolve
/// orders submitted in the same batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDto {
    pub pos_local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_pos_local_id: Option<String>,
    pub terminal_id: String,
    pub method: PaymentMethod,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Mobile,
    Voucher,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Mobile => "mobile",
            PaymentMethod::Voucher => "voucher",
            PaymentMethod::Other => "other",
        }
    }

    /// Lenient parse used when reading stored rows. Unknown methods map to
    /// `Other` rather than failing the whole row.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cash" => PaymentMethod::Cash,
            "card" | "credit_card" | "debit_card" => PaymentMethod::Card,
            "mobile" | "wallet" => PaymentMethod::Mobile,
            "voucher" | "gift_card" => PaymentMethod::Voucher,
            _ => PaymentMethod::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
}

/// Server reply to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub status: ResponseStatus,
    pub synced_at: DateTime<Utc>,
    pub results: SyncResults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResults {
    #[serde(default)]
    pub orders: Vec<RecordResult>,
    #[serde(default)]
    pub payments: Vec<RecordResult>,
}

/// Outcome of ingesting one order or payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordOutcome {
    /// Created by this request.
    Success,
    /// Already present upstream under the same `posLocalId`.
    Duplicate,
    /// Not applied; the record may be retried with the same key.
    Error,
}

impl RecordOutcome {
    /// `SUCCESS` and `DUPLICATE` both prove the record exists upstream.
    pub fn is_reconciled(&self) -> bool {
        matches!(self, RecordOutcome::Success | RecordOutcome::Duplicate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    pub pos_local_id: String,
    pub status: RecordOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RecordResult {
    pub fn success(pos_local_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            pos_local_id: pos_local_id.into(),
            status: RecordOutcome::Success,
            server_id: Some(server_id.into()),
            message: None,
        }
    }

    pub fn duplicate(pos_local_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            pos_local_id: pos_local_id.into(),
            status: RecordOutcome::Duplicate,
            server_id: Some(server_id.into()),
            message: None,
        }
    }

    pub fn error(pos_local_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pos_local_id: pos_local_id.into(),
            status: RecordOutcome::Error,
            server_id: None,
            message: Some(message.into()),
        }
    }
}

/// Full set of active products for the terminal's organization. Replaces the
/// terminal cache wholesale; it is never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub products: Vec<CatalogProduct>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProduct {
    pub id: String,
    pub sku: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub price: f64,
    pub tax_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_quantity: Option<i64>,
}

/// Body of `GET /api/pos/terminals/sync-requested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestedFlag {
    pub sync_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(quantity: i64, unit_price: f64) -> OrderItem {
        OrderItem {
            product_id: "p-1".into(),
            sku: "SKU-1".into(),
            name: "Item".into(),
            quantity,
            unit_price,
            tax_rate: 0.2,
            discount_amount: 0.0,
        }
    }

    #[test]
    fn test_line_validation() {
        assert!(validate_items(&[line(1, 0.0), line(3, 2.5)]).is_ok());
        assert!(validate_items(&[]).is_err());

        let err = validate_items(&[line(1, 1.0), line(-1, 3.0)]).unwrap_err();
        assert_eq!(err, "invalid quantity -1 for p-1");
        assert!(line(0, 1.0).validate().is_err());
        assert!(line(1, -0.01).validate().is_err());
        assert!(line(1, f64::NAN).validate().is_err());

        let mut taxed = line(1, 1.0);
        taxed.tax_rate = f64::INFINITY;
        assert!(taxed.validate().is_err());
        let mut discounted = line(1, 1.0);
        discounted.discount_amount = -0.5;
        assert!(discounted.validate().is_err());
    }

    #[test]
    fn test_request_uses_camel_case_and_omits_absent_fields() {
        let req = SyncRequest {
            terminal_id: "term-1".into(),
            last_sync_at: None,
            orders: vec![],
            payments: vec![PaymentDto {
                pos_local_id: "pay-1".into(),
                order_id: None,
                order_pos_local_id: Some("ord-1".into()),
                terminal_id: "term-1".into(),
                method: PaymentMethod::Cash,
                amount: 12.5,
                reference: None,
                processed_at: "2026-03-01T10:00:00Z".parse().unwrap(),
            }],
        };

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["terminalId"], "term-1");
        assert!(value.get("lastSyncAt").is_none());
        let payment = &value["payments"][0];
        assert_eq!(payment["posLocalId"], "pay-1");
        assert_eq!(payment["orderPosLocalId"], "ord-1");
        assert_eq!(payment["method"], "cash");
        assert!(payment.get("orderId").is_none());
        assert!(payment.get("reference").is_none());
    }

    #[test]
    fn test_response_parses_outcomes_and_optional_catalog() {
        let raw = json!({
            "status": "SUCCESS",
            "syncedAt": "2026-03-01T10:00:05Z",
            "results": {
                "orders": [
                    { "posLocalId": "a", "status": "SUCCESS", "serverId": "srv-a" },
                    { "posLocalId": "b", "status": "DUPLICATE", "serverId": "srv-b" },
                    { "posLocalId": "c", "status": "ERROR", "message": "boom" }
                ]
            }
        });

        let resp: SyncResponse = serde_json::from_value(raw).unwrap();
        assert!(resp.catalog.is_none());
        assert!(resp.results.payments.is_empty());
        let outcomes: Vec<RecordOutcome> =
            resp.results.orders.iter().map(|r| r.status).collect();
        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::Success,
                RecordOutcome::Duplicate,
                RecordOutcome::Error
            ]
        );
        assert!(outcomes[0].is_reconciled());
        assert!(outcomes[1].is_reconciled());
        assert!(!outcomes[2].is_reconciled());
        assert_eq!(resp.results.orders[2].message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_payment_method_parse_is_lenient() {
        assert_eq!(PaymentMethod::parse(" CASH "), PaymentMethod::Cash);
        assert_eq!(PaymentMethod::parse("credit_card"), PaymentMethod::Card);
        assert_eq!(PaymentMethod::parse("crypto"), PaymentMethod::Other);
        assert_eq!(PaymentMethod::parse(PaymentMethod::Voucher.as_str()), PaymentMethod::Voucher);
    }

    #[test]
    fn test_empty_request_detection() {
        let req: SyncRequest = serde_json::from_value(json!({ "terminalId": "t" })).unwrap();
        assert!(req.is_empty());
    }
}
