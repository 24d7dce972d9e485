//! Server ingestion: turns one terminal batch into ledger rows and a
//! per-record outcome manifest.
//!
//! Orders are processed before payments so a payment can resolve an order
//! created earlier in the same batch by its `posLocalId`. Each record is
//! written in its own transaction; one record failing never affects another.
//! Synchronous: callers on the async runtime go through `spawn_blocking`.

use chrono::Utc;
use tracing::{info, warn};

use super::auth::AuthContext;
use super::error::ServerResult;
use super::store::{ServerStore, Write};
use crate::protocol::{
    validate_items, OrderDto, PaymentDto, RecordResult, ResponseStatus, SyncRequest,
    SyncResponse, SyncResults,
};

/// Process a whole sync batch.
///
/// Only request-level problems (wrong terminal, database unavailable for the
/// catalog) fail the call; record problems are reported in the manifest.
pub fn ingest_batch(
    store: &ServerStore,
    ctx: &AuthContext,
    request: &SyncRequest,
) -> ServerResult<SyncResponse> {
    ctx.ensure_terminal(&request.terminal_id)?;

    let orders: Vec<RecordResult> = request
        .orders
        .iter()
        .map(|order| ingest_order(store, ctx, order))
        .collect();
    let payments: Vec<RecordResult> = request
        .payments
        .iter()
        .map(|payment| ingest_payment(store, ctx, payment))
        .collect();

    let synced_at = Utc::now();
    let catalog = store.active_catalog(&ctx.organization_id)?;
    if let Err(e) = store.record_terminal_sync(&ctx.terminal_id, synced_at) {
        warn!(terminal_id = %ctx.terminal_id, error = %e, "failed to record terminal sync time");
    }

    let failed = orders
        .iter()
        .chain(payments.iter())
        .filter(|r| !r.status.is_reconciled())
        .count();
    info!(
        terminal_id = %ctx.terminal_id,
        orders = orders.len(),
        payments = payments.len(),
        failed,
        catalog_products = catalog.products.len(),
        "Sync batch processed"
    );

    Ok(SyncResponse {
        status: ResponseStatus::Success,
        synced_at,
        results: SyncResults { orders, payments },
        catalog: Some(catalog),
    })
}

fn validate_order(ctx: &AuthContext, order: &OrderDto) -> Result<(), String> {
    if order.pos_local_id.trim().is_empty() {
        return Err("posLocalId is required".to_string());
    }
    if order.terminal_id != ctx.terminal_id {
        return Err(format!(
            "order belongs to terminal {}, not {}",
            order.terminal_id, ctx.terminal_id
        ));
    }
    validate_items(&order.items)
}

/// Gate, then create. Totals are recomputed with the canonical formula and
/// the recomputed values are what gets stored.
pub fn ingest_order(store: &ServerStore, ctx: &AuthContext, order: &OrderDto) -> RecordResult {
    if let Err(message) = validate_order(ctx, order) {
        warn!(pos_local_id = %order.pos_local_id, %message, "Order rejected");
        return RecordResult::error(&order.pos_local_id, message);
    }

    let totals = order.computed_totals();
    if !totals.matches(&order.reported_totals()) {
        warn!(
            pos_local_id = %order.pos_local_id,
            reported = order.total_amount,
            computed = totals.total_amount,
            "Order totals differ from line items, storing recomputed totals"
        );
    }

    match store.create_order(ctx, order, &totals) {
        Ok(Write::Created(id)) => RecordResult::success(&order.pos_local_id, id),
        Ok(Write::Duplicate(id)) => {
            info!(pos_local_id = %order.pos_local_id, "Duplicate order ignored");
            RecordResult::duplicate(&order.pos_local_id, id)
        }
        Err(e) => {
            warn!(pos_local_id = %order.pos_local_id, error = %e, "Order ingest failed");
            RecordResult::error(&order.pos_local_id, e.to_string())
        }
    }
}

pub fn ingest_payment(
    store: &ServerStore,
    ctx: &AuthContext,
    payment: &PaymentDto,
) -> RecordResult {
    if payment.pos_local_id.trim().is_empty() {
        return RecordResult::error(&payment.pos_local_id, "posLocalId is required");
    }
    if !payment.amount.is_finite() {
        return RecordResult::error(&payment.pos_local_id, "invalid payment amount");
    }

    match store.create_payment(ctx, payment) {
        Ok(Write::Created(id)) => RecordResult::success(&payment.pos_local_id, id),
        Ok(Write::Duplicate(id)) => RecordResult::duplicate(&payment.pos_local_id, id),
        Err(e) => {
            warn!(pos_local_id = %payment.pos_local_id, error = %e, "Payment ingest failed");
            RecordResult::error(&payment.pos_local_id, e.to_string())
        }
    }
}
