//! Terminal engine against the real ingestion service, wired in-process.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pos_offline_sync::api::ApiError;
use pos_offline_sync::db::{DbState, LocalOrder, NewOrder, NewPayment, SyncStatus};
use pos_offline_sync::protocol::{
    CatalogProduct, OrderDto, OrderItem, PaymentMethod, RecordOutcome, SyncRequest, SyncResponse,
};
use pos_offline_sync::server::{ingest, AuthContext, ServerError, ServerStore};
use pos_offline_sync::sync::{RoundKind, RoundOutcome, SkipReason};
use pos_offline_sync::{SyncConfig, SyncEngine, SyncTransport, TerminalSession};

const ORG: &str = "org-e2e";
const TERMINAL: &str = "term-e2e";

/// Calls the ingestion service directly, authenticating the way the HTTP
/// middleware does.
struct InProcessTransport {
    store: ServerStore,
    online: AtomicBool,
    /// Apply the batch server-side, then report a timeout to the terminal.
    lose_next_response: AtomicBool,
}

impl InProcessTransport {
    fn new(store: ServerStore) -> Self {
        Self {
            store,
            online: AtomicBool::new(true),
            lose_next_response: AtomicBool::new(false),
        }
    }

    fn auth(&self, session: &TerminalSession) -> Result<AuthContext, ApiError> {
        let token = session
            .token()
            .ok_or_else(|| ApiError::Unauthorized("no token".into()))?;
        let ctx = self
            .store
            .authenticate(token.as_str())
            .map_err(|e| ApiError::Network(e.to_string()))?
            .ok_or_else(|| ApiError::Unauthorized("API key is invalid or expired".into()))?;
        ctx.ensure_terminal(session.terminal_id())
            .map_err(|e| ApiError::Status {
                status: 403,
                message: e.to_string(),
            })?;
        Ok(ctx)
    }
}

fn to_api_error(e: ServerError) -> ApiError {
    ApiError::Status {
        status: e.status_code().as_u16(),
        message: e.to_string(),
    }
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn is_online(&self, _session: &TerminalSession) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn sync(
        &self,
        session: &TerminalSession,
        request: &SyncRequest,
    ) -> Result<SyncResponse, ApiError> {
        let ctx = self.auth(session)?;
        // Round-trip through JSON so wire naming is exercised too.
        let wire = serde_json::to_vec(request).map_err(|e| ApiError::Decode(e.to_string()))?;
        let decoded: SyncRequest =
            serde_json::from_slice(&wire).map_err(|e| ApiError::Decode(e.to_string()))?;
        let response = ingest::ingest_batch(&self.store, &ctx, &decoded).map_err(to_api_error)?;
        if self.lose_next_response.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Timeout("Connection timeout".into()));
        }
        Ok(response)
    }

    async fn sync_requested(&self, session: &TerminalSession) -> Result<bool, ApiError> {
        let ctx = self.auth(session)?;
        self.store.sync_requested(&ctx.terminal_id).map_err(to_api_error)
    }

    async fn clear_sync_requested(&self, session: &TerminalSession) -> Result<(), ApiError> {
        let ctx = self.auth(session)?;
        self.store
            .clear_sync_requested(&ctx.terminal_id)
            .map_err(to_api_error)
    }
}

fn product(id: &str, price: f64, stock: i64) -> CatalogProduct {
    CatalogProduct {
        id: id.into(),
        sku: format!("SKU-{id}"),
        name: format!("Product {id}"),
        description: None,
        category: Some("general".into()),
        price,
        tax_rate: 0.1,
        barcode: None,
        image_url: None,
        is_active: true,
        stock_quantity: Some(stock),
    }
}

struct Harness {
    store: ServerStore,
    transport: Arc<InProcessTransport>,
    db: Arc<DbState>,
    engine: SyncEngine,
}

fn harness() -> Harness {
    let store = ServerStore::in_memory().unwrap();
    store.ensure_organization(ORG, "E2E").unwrap();
    let token = store.register_terminal(ORG, TERMINAL, "Till 1").unwrap();
    store.upsert_product(ORG, &product("coffee", 3.0, 100)).unwrap();
    store.upsert_product(ORG, &product("bagel", 2.5, 3)).unwrap();

    let transport = Arc::new(InProcessTransport::new(store.clone()));
    let db = Arc::new(DbState::open_in_memory().unwrap());
    let session = Arc::new(TerminalSession::new(
        "http://localhost:8787",
        TERMINAL,
        Some(token),
    ));
    let engine = SyncEngine::new(
        db.clone(),
        session,
        transport.clone(),
        SyncConfig::default(),
    );
    Harness {
        store,
        transport,
        db,
        engine,
    }
}

fn sell(db: &DbState, product_id: &str, quantity: i64, unit_price: f64) -> LocalOrder {
    let order = db
        .create_order(&NewOrder {
            terminal_id: TERMINAL.into(),
            cashier_id: "cashier-1".into(),
            items: vec![OrderItem {
                product_id: product_id.into(),
                sku: format!("SKU-{product_id}"),
                name: product_id.into(),
                quantity,
                unit_price,
                tax_rate: 0.1,
                discount_amount: 0.0,
            }],
            complete: true,
        })
        .unwrap();
    db.record_payment(&NewPayment {
        order_local_id: order.local_id.clone(),
        method: PaymentMethod::Card,
        amount: order.total_amount,
        reference: None,
    })
    .unwrap();
    order
}

fn completed(outcome: RoundOutcome) -> pos_offline_sync::sync::RoundReport {
    match outcome {
        RoundOutcome::Completed(report) => report,
        other => panic!("expected a completed round, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offline_backlog_drains_in_one_round() {
    let h = harness();
    h.transport.online.store(false, Ordering::SeqCst);

    let orders: Vec<LocalOrder> = (0..50).map(|_| sell(&h.db, "coffee", 1, 3.0)).collect();
    assert_eq!(
        h.engine.run_round(RoundKind::Scheduled).await.unwrap(),
        RoundOutcome::Skipped(SkipReason::Offline)
    );
    assert_eq!(h.db.sync_counts().unwrap().pending, 100);

    h.transport.online.store(true, Ordering::SeqCst);
    let report = completed(h.engine.run_round(RoundKind::Scheduled).await.unwrap());
    assert_eq!(report.orders_sent, 50);
    assert_eq!(report.payments_sent, 50);
    assert_eq!(report.synced, 100);
    assert_eq!(report.failed, 0);

    assert_eq!(h.store.count_orders(ORG).unwrap(), 50);
    assert_eq!(h.store.count_payments(ORG).unwrap(), 50);
    assert_eq!(h.store.product_stock(ORG, "coffee").unwrap(), Some(50));
    assert_eq!(h.db.sync_counts().unwrap().outstanding(), 0);

    // Same-batch payments resolved to the order created moments earlier.
    let local = h.db.get_order(&orders[7].local_id).unwrap();
    let server_order = h
        .store
        .order_by_pos_local_id(&local.local_id)
        .unwrap()
        .unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.server_id.as_deref(), Some(server_order.id.as_str()));
    assert_eq!(h.store.payments_for_order(&server_order.id).unwrap().len(), 1);
    assert_eq!(server_order.total_amount, local.total_amount);

    // The catalog came back with current server values.
    let cached = h.db.get_product("coffee").unwrap().unwrap();
    assert_eq!(cached.stock_quantity, Some(50));
    assert_eq!(h.db.get_catalog().unwrap().len(), 2);
    assert_eq!(h.db.get_last_sync_time().unwrap(), Some(report.synced_at));
}

#[tokio::test]
async fn test_lost_response_is_reconciled_as_duplicate() {
    let h = harness();
    let order = sell(&h.db, "coffee", 2, 3.0);

    h.transport.lose_next_response.store(true, Ordering::SeqCst);
    let outcome = h.engine.run_round(RoundKind::Scheduled).await.unwrap();
    assert!(matches!(outcome, RoundOutcome::Failed(_)));
    assert_eq!(h.db.get_order(&order.local_id).unwrap().sync_status, SyncStatus::Error);
    // The server did apply it.
    assert_eq!(h.store.count_orders(ORG).unwrap(), 1);

    let report = completed(h.engine.run_round(RoundKind::Retry).await.unwrap());
    assert_eq!(report.synced, 2);
    assert_eq!(h.db.get_order(&order.local_id).unwrap().sync_status, SyncStatus::Synced);
    assert_eq!(h.store.count_orders(ORG).unwrap(), 1);
    assert_eq!(h.store.count_payments(ORG).unwrap(), 1);
    assert_eq!(h.store.product_stock(ORG, "coffee").unwrap(), Some(98));
}

#[tokio::test]
async fn test_rejected_order_is_isolated_and_retried_later() {
    let h = harness();
    let good = sell(&h.db, "coffee", 1, 3.0);
    let bad = sell(&h.db, "muffin", 1, 4.0);

    let report = completed(h.engine.run_round(RoundKind::Scheduled).await.unwrap());
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 2);

    assert_eq!(h.db.get_order(&good.local_id).unwrap().sync_status, SyncStatus::Synced);
    let rejected = h.db.get_order(&bad.local_id).unwrap();
    assert_eq!(rejected.sync_status, SyncStatus::Error);
    assert!(rejected.sync_error.as_deref().unwrap().contains("muffin"));
    assert_eq!(h.store.count_orders(ORG).unwrap(), 1);

    // A plain round leaves error records alone; a retry round picks them up.
    h.store.upsert_product(ORG, &product("muffin", 4.0, 10)).unwrap();
    let report = completed(h.engine.run_round(RoundKind::Scheduled).await.unwrap());
    assert_eq!(report.orders_sent, 0);
    let report = completed(h.engine.run_round(RoundKind::Retry).await.unwrap());
    assert_eq!(report.synced, 2);
    assert_eq!(h.db.get_order(&bad.local_id).unwrap().sync_status, SyncStatus::Synced);
    assert_eq!(h.store.count_orders(ORG).unwrap(), 2);
}

#[tokio::test]
async fn test_offline_oversell_is_accepted_with_negative_stock() {
    let h = harness();
    sell(&h.db, "bagel", 5, 2.5);

    let report = completed(h.engine.run_round(RoundKind::Scheduled).await.unwrap());
    assert_eq!(report.failed, 0);
    assert_eq!(h.store.product_stock(ORG, "bagel").unwrap(), Some(-2));
    assert_eq!(
        h.db.get_product("bagel").unwrap().unwrap().stock_quantity,
        Some(-2)
    );
}

#[tokio::test]
async fn test_refund_syncs_after_its_order() {
    let h = harness();
    let order = sell(&h.db, "coffee", 1, 3.0);
    completed(h.engine.run_round(RoundKind::Scheduled).await.unwrap());

    let refund = h
        .db
        .record_payment(&NewPayment {
            order_local_id: order.local_id.clone(),
            method: PaymentMethod::Card,
            amount: -order.total_amount,
            reference: Some("refund".into()),
        })
        .unwrap();
    let report = completed(h.engine.run_round(RoundKind::Scheduled).await.unwrap());
    assert_eq!(report.payments_sent, 1);
    assert_eq!(report.synced, 1);

    let server_order = h
        .store
        .order_by_pos_local_id(&order.local_id)
        .unwrap()
        .unwrap();
    let payments = h.store.payments_for_order(&server_order.id).unwrap();
    assert_eq!(payments.len(), 2);
    assert!(payments.iter().any(|p| p.pos_local_id == refund.local_id && p.amount < 0.0));
}

#[tokio::test]
async fn test_remote_request_flag_is_cleared_by_a_round() {
    let h = harness();
    assert!(h.store.request_sync(TERMINAL).unwrap());
    let outcome = h.engine.poll_remote_request().await.unwrap();
    assert!(matches!(outcome, Some(RoundOutcome::Completed(_))));
    assert!(!h.store.sync_requested(TERMINAL).unwrap());
}

#[tokio::test]
async fn test_both_sides_refuse_the_same_order_lines() {
    let h = harness();
    let line = |quantity: i64, unit_price: f64| OrderItem {
        product_id: "coffee".into(),
        sku: "SKU-coffee".into(),
        name: "coffee".into(),
        quantity,
        unit_price,
        tax_rate: 0.1,
        discount_amount: 0.0,
    };
    let mut nan_tax = line(1, 3.0);
    nan_tax.tax_rate = f64::NAN;
    let mut negative_discount = line(1, 3.0);
    negative_discount.discount_amount = -1.0;
    let refused = [
        line(-1, 3.0),
        line(0, 3.0),
        line(1, -3.0),
        line(1, f64::INFINITY),
        nan_tax,
        negative_discount,
    ];

    let ctx = AuthContext {
        organization_id: ORG.into(),
        terminal_id: TERMINAL.into(),
    };
    for (n, item) in refused.iter().enumerate() {
        let local = h.db.create_order(&NewOrder {
            terminal_id: TERMINAL.into(),
            cashier_id: "cashier-1".into(),
            items: vec![item.clone()],
            complete: true,
        });
        assert!(local.is_err(), "checkout accepted {item:?}");

        // A terminal that skipped the check still gets a per-record error.
        let request = SyncRequest {
            terminal_id: TERMINAL.into(),
            last_sync_at: None,
            orders: vec![OrderDto {
                pos_local_id: format!("raw-{n}"),
                terminal_id: TERMINAL.into(),
                cashier_id: "cashier-1".into(),
                items: vec![item.clone()],
                subtotal: 0.0,
                tax_amount: 0.0,
                discount_amount: 0.0,
                total_amount: 0.0,
                completed_at: chrono::Utc::now(),
            }],
            payments: vec![],
        };
        let response = ingest::ingest_batch(&h.store, &ctx, &request).unwrap();
        assert_eq!(response.results.orders[0].status, RecordOutcome::Error, "{item:?}");
    }
    assert_eq!(h.store.count_orders(ORG).unwrap(), 0);

    // A return goes through as a negative payment and everything reconciles.
    let order = sell(&h.db, "coffee", 1, 3.0);
    h.db.record_payment(&NewPayment {
        order_local_id: order.local_id.clone(),
        method: PaymentMethod::Card,
        amount: -order.total_amount,
        reference: Some("return".into()),
    })
    .unwrap();
    let report = completed(h.engine.run_round(RoundKind::Scheduled).await.unwrap());
    assert_eq!(report.failed, 0);
    assert_eq!(report.synced, 3);
    assert_eq!(h.db.sync_counts().unwrap().outstanding(), 0);
    assert!(!h.engine.sweep().unwrap());
}
