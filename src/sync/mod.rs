//! Terminal sync engine.
//!
//! One [`SyncEngine`] per terminal session. It converges every completed
//! local order and payment to `synced` by running sync rounds against a
//! [`SyncTransport`], and mirrors the server catalog into the local cache.
//!
//! The engine never blocks checkout: rounds only touch records through the
//! store's guarded status transitions, and transport or per-record failures
//! are absorbed into record status. Only local storage failures escape.
//! Timers live in [`scheduler`]; the engine itself is driven by plain method
//! calls, which keeps it easy to test.

pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::ApiError;
use crate::config::SyncConfig;
use crate::db::{DbState, LocalOrder, LocalPayment, RecordKind, StoreError, SyncItems};
use crate::protocol::{OrderDto, PaymentDto, RecordResult, SyncRequest, SyncResponse};
use crate::session::TerminalSession;

pub use scheduler::SyncHandle;
pub use state::{EngineEvent, EngineState};

/// Message stored on records the server response did not mention.
pub const MISSING_RESULT_MESSAGE: &str = "no result returned by server";

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// How the engine reaches the ingestion server. The HTTP implementation is
/// [`crate::api::HttpTransport`]; tests plug in an in-process one.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Cheap reachability probe.
    async fn is_online(&self, session: &TerminalSession) -> bool;

    async fn sync(
        &self,
        session: &TerminalSession,
        request: &SyncRequest,
    ) -> Result<SyncResponse, ApiError>;

    /// Whether an administrator asked this terminal to sync now.
    async fn sync_requested(&self, session: &TerminalSession) -> Result<bool, ApiError>;

    async fn clear_sync_requested(&self, session: &TerminalSession) -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(#[from] ApiError),
    #[error("store: {0}")]
    Store(StoreError),
    /// Local storage can no longer be written. Checkout must stop.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("sync engine stopped")]
    Stopped,
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Fatal(msg) => SyncError::Fatal(msg),
            other => SyncError::Store(other),
        }
    }
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_))
    }
}

/// What triggered a round. Retry rounds also pick up records in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    Scheduled,
    Manual,
    RemoteRequest,
    Retry,
}

impl RoundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundKind::Scheduled => "scheduled",
            RoundKind::Manual => "manual",
            RoundKind::RemoteRequest => "remote_request",
            RoundKind::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
    NoCredential,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub kind: RoundKind,
    pub orders_sent: usize,
    pub payments_sent: usize,
    pub synced: usize,
    pub failed: usize,
    /// Products in the catalog snapshot, when one was returned.
    pub catalog_products: Option<usize>,
    pub synced_at: DateTime<Utc>,
}

impl RoundReport {
    pub fn is_catalog_only(&self) -> bool {
        self.orders_sent == 0 && self.payments_sent == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Deferred, not a failure.
    Skipped(SkipReason),
    Completed(RoundReport),
    /// Transport failure; every record of the round is back in `error`.
    Failed(String),
}

/// Badge/status snapshot for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: EngineState,
    pub is_online: bool,
    pub pending: i64,
    pub syncing: i64,
    pub error: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Count shown on the badge.
    pub fn badge_count(&self) -> i64 {
        self.pending + self.syncing + self.error
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    /// Local storage failure that the operator must see.
    Fatal(String),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    db: Arc<DbState>,
    session: Arc<TerminalSession>,
    transport: Arc<dyn SyncTransport>,
    config: SyncConfig,
    state: Mutex<EngineState>,
    online: AtomicBool,
    last_error: Mutex<Option<String>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        db: Arc<DbState>,
        session: Arc<TerminalSession>,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            session,
            transport,
            config,
            state: Mutex::new(EngineState::Idle),
            online: AtomicBool::new(false),
            last_error: Mutex::new(None),
            events,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn session(&self) -> &TerminalSession {
        &self.session
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> EngineState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Feed an event through the transition table. Returns the new state, or
    /// `None` when the event is not allowed in the current one.
    fn apply(&self, event: EngineEvent) -> Option<EngineState> {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let from = *guard;
        let to = from.on(event)?;
        if from != to {
            debug!(?from, ?to, ?event, "sync engine transition");
        }
        *guard = to;
        Some(to)
    }

    fn set_last_error(&self, message: Option<String>) {
        let mut guard = match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = message;
    }

    /// Move records stranded in `syncing` by a previous process to `error`.
    /// Call once before the first round.
    pub fn recover(&self) -> Result<usize, SyncError> {
        Ok(self.db.recover_interrupted()?)
    }

    /// Stop the engine. Any later round is skipped.
    pub fn stop(&self) {
        if self.apply(EngineEvent::Shutdown).is_some() {
            info!(terminal_id = %self.session.terminal_id(), "sync engine stopped");
            self.publish_status();
        }
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let counts = self.db.sync_counts()?;
        let last_error = match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Ok(SyncStatus {
            state: self.state(),
            is_online: self.online.load(Ordering::SeqCst),
            pending: counts.pending,
            syncing: counts.syncing,
            error: counts.error,
            last_sync_at: self.db.get_last_sync_time()?,
            last_error,
        })
    }

    fn publish_status(&self) {
        match self.status() {
            Ok(status) => {
                // No receivers is fine.
                let _ = self.events.send(SyncEvent::StatusChanged(status));
            }
            Err(e) => self.report(&e),
        }
    }

    fn report(&self, err: &SyncError) {
        if let SyncError::Fatal(msg) = err {
            error!(error = %msg, "local storage failure; checkout must stop");
            let _ = self.events.send(SyncEvent::Fatal(msg.clone()));
        } else {
            warn!(error = %err, "sync engine error");
        }
    }

    // -----------------------------------------------------------------------
    // Rounds
    // -----------------------------------------------------------------------

    /// Run one sync round. Transport and per-record failures are absorbed
    /// into record status; the returned error is always a local store
    /// problem.
    pub async fn run_round(&self, kind: RoundKind) -> Result<RoundOutcome, SyncError> {
        let current = self.state();
        if current.is_stopped() {
            return Ok(RoundOutcome::Skipped(SkipReason::Stopped));
        }
        if current.is_syncing() {
            debug!(kind = kind.as_str(), "sync already in progress");
            return Ok(RoundOutcome::Skipped(SkipReason::AlreadySyncing));
        }
        if !self.session.has_credential() {
            debug!(kind = kind.as_str(), "no credential; skipping sync round");
            return Ok(RoundOutcome::Skipped(SkipReason::NoCredential));
        }

        let online = self.transport.is_online(&self.session).await;
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if !online {
            if was_online {
                info!("Network offline; deferring sync and keeping records pending");
            }
            self.publish_status();
            return Ok(RoundOutcome::Skipped(SkipReason::Offline));
        }
        if !was_online {
            info!("Network available; resuming sync");
        }

        // Claim the round. Losing the race to another caller is a skip.
        match self.apply(EngineEvent::RoundStarted) {
            Some(_) => {}
            None if self.state().is_stopped() => {
                return Ok(RoundOutcome::Skipped(SkipReason::Stopped))
            }
            None => return Ok(RoundOutcome::Skipped(SkipReason::AlreadySyncing)),
        }

        let result = self.execute_round(kind).await;
        if let Err(e) = &result {
            // Nothing else writes sync status while this engine holds the
            // round, so any syncing rows are ours.
            if !e.is_fatal() {
                if let Err(revert) = self.db.recover_interrupted() {
                    warn!(error = %revert, "failed to release records after round error");
                }
            }
            self.report(e);
        }
        self.apply(EngineEvent::RoundFinished);
        self.publish_status();
        result
    }

    async fn execute_round(&self, kind: RoundKind) -> Result<RoundOutcome, SyncError> {
        let items = match kind {
            RoundKind::Retry => self.db.get_failed_and_pending_sync_items()?,
            _ => self.db.get_pending_sync_items()?,
        };

        let order_ids: Vec<String> = items.orders.iter().map(|o| o.local_id.clone()).collect();
        let payment_ids: Vec<String> = items.payments.iter().map(|p| p.local_id.clone()).collect();
        let claimed_orders = self.db.mark_as_syncing(RecordKind::Order, &order_ids)?;
        let claimed_payments = self.db.mark_as_syncing(RecordKind::Payment, &payment_ids)?;
        let batch = retain_claimed(items, &claimed_orders, &claimed_payments);

        let request = build_request(
            self.session.terminal_id(),
            self.db.get_last_sync_time()?,
            &batch,
        );
        if request.is_empty() {
            debug!(kind = kind.as_str(), "catalog-only sync round");
        } else {
            info!(
                kind = kind.as_str(),
                orders = request.orders.len(),
                payments = request.payments.len(),
                "Starting sync round"
            );
        }

        let response = match self.transport.sync(&self.session, &request).await {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                warn!(kind = kind.as_str(), error = %message, "Sync round failed");
                self.db
                    .mark_as_error(RecordKind::Order, &claimed_orders, &message)?;
                self.db
                    .mark_as_error(RecordKind::Payment, &claimed_payments, &message)?;
                self.set_last_error(Some(message.clone()));
                return Ok(RoundOutcome::Failed(message));
            }
        };

        let (orders_synced, orders_failed) =
            self.reconcile(RecordKind::Order, &claimed_orders, &response.results.orders)?;
        let (payments_synced, payments_failed) =
            self.reconcile(RecordKind::Payment, &claimed_payments, &response.results.payments)?;

        let catalog_products = match &response.catalog {
            Some(catalog) => {
                self.db
                    .replace_catalog(&catalog.products, catalog.last_updated)?;
                Some(catalog.products.len())
            }
            None => None,
        };
        self.db.set_last_sync_time(response.synced_at)?;
        self.set_last_error(None);

        if let Err(e) = self.transport.clear_sync_requested(&self.session).await {
            warn!(error = %e, "could not clear remote sync request");
        }

        let report = RoundReport {
            kind,
            orders_sent: claimed_orders.len(),
            payments_sent: claimed_payments.len(),
            synced: orders_synced + payments_synced,
            failed: orders_failed + payments_failed,
            catalog_products,
            synced_at: response.synced_at,
        };
        if report.is_catalog_only() {
            debug!(catalog_products = ?report.catalog_products, "Catalog refreshed");
        } else {
            info!(
                kind = kind.as_str(),
                synced = report.synced,
                failed = report.failed,
                catalog_products = ?report.catalog_products,
                "Sync round complete"
            );
        }
        Ok(RoundOutcome::Completed(report))
    }

    /// Apply the server manifest for one record kind. Returns
    /// `(synced, failed)` counts.
    fn reconcile(
        &self,
        kind: RecordKind,
        sent: &[String],
        results: &[RecordResult],
    ) -> Result<(usize, usize), SyncError> {
        let sent_set: HashSet<&str> = sent.iter().map(String::as_str).collect();
        let mut synced: Vec<(String, Option<String>)> = Vec::new();
        let mut failed: HashMap<String, Vec<String>> = HashMap::new();
        let mut answered: HashSet<&str> = HashSet::new();

        for result in results {
            let id = result.pos_local_id.as_str();
            if !sent_set.contains(id) {
                warn!(kind = kind.as_str(), pos_local_id = %id, "server returned a result for a record not in this round");
                continue;
            }
            if !answered.insert(id) {
                continue;
            }
            if result.status.is_reconciled() {
                synced.push((id.to_string(), result.server_id.clone()));
            } else {
                let message = result
                    .message
                    .clone()
                    .unwrap_or_else(|| "rejected by server".to_string());
                warn!(kind = kind.as_str(), pos_local_id = %id, error = %message, "Record rejected by server");
                failed.entry(message).or_default().push(id.to_string());
            }
        }

        let missing: Vec<String> = sent
            .iter()
            .filter(|id| !answered.contains(id.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            warn!(kind = kind.as_str(), count = missing.len(), "server response missing records");
            failed
                .entry(MISSING_RESULT_MESSAGE.to_string())
                .or_default()
                .extend(missing);
        }

        let synced_count = self.db.mark_as_synced(kind, &synced)?;
        let mut failed_count = 0;
        for (message, ids) in &failed {
            failed_count += self.db.mark_as_error(kind, ids, message)?;
        }
        Ok((synced_count, failed_count))
    }

    // -----------------------------------------------------------------------
    // Timer actions
    // -----------------------------------------------------------------------

    /// Fast sweep: arm the retry loop when error / stale pending records
    /// exist, disarm it when none are left. Returns whether the retry loop is
    /// armed afterwards.
    pub fn sweep(&self) -> Result<bool, SyncError> {
        let stale = chrono::Duration::from_std(self.config.stale_pending_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        let candidates = self
            .db
            .count_retry_candidates(Utc::now() - stale)
            .map_err(SyncError::from)
            .inspect_err(|e| self.report(e))?;
        let before = self.state();
        let event = if candidates > 0 {
            EngineEvent::RetryWorkFound
        } else {
            EngineEvent::RetryDrained
        };
        let after = self.apply(event).unwrap_or(before);
        if !before.is_retry_active() && after.is_retry_active() {
            info!(candidates, "Retry loop armed");
        } else if before.is_retry_active() && !after.is_retry_active() {
            info!("All records reconciled; retry loop disarmed");
        }
        Ok(after.is_retry_active())
    }

    /// Slow retry tick. Runs a retry round only while the loop is armed.
    pub async fn retry_tick(&self) -> Result<Option<RoundOutcome>, SyncError> {
        if !self.state().is_retry_active() {
            return Ok(None);
        }
        self.run_round(RoundKind::Retry).await.map(Some)
    }

    /// Poll the remote "sync requested" flag and run a round if set.
    pub async fn poll_remote_request(&self) -> Result<Option<RoundOutcome>, SyncError> {
        if self.state().is_stopped() || !self.session.has_credential() {
            return Ok(None);
        }
        match self.transport.sync_requested(&self.session).await {
            Ok(true) => {
                info!("Sync requested by administrator");
                self.run_round(RoundKind::RemoteRequest).await.map(Some)
            }
            Ok(false) => Ok(None),
            Err(e) => {
                debug!(error = %e, "sync-requested poll failed");
                Ok(None)
            }
        }
    }

    /// Remove synced records past the retention window.
    pub fn cleanup(&self) -> Result<usize, SyncError> {
        let report = self
            .db
            .cleanup_synced(self.config.retention_days)
            .map_err(SyncError::from)
            .inspect_err(|e| self.report(e))?;
        Ok(report.orders + report.payments)
    }

    /// Outstanding records, used to pick the flag poll interval.
    pub fn outstanding(&self) -> Result<i64, SyncError> {
        Ok(self.db.sync_counts()?.outstanding())
    }
}

// ---------------------------------------------------------------------------
// Wire translation
// ---------------------------------------------------------------------------

fn retain_claimed(items: SyncItems, orders: &[String], payments: &[String]) -> SyncItems {
    let orders: HashSet<&str> = orders.iter().map(String::as_str).collect();
    let payments: HashSet<&str> = payments.iter().map(String::as_str).collect();
    SyncItems {
        orders: items
            .orders
            .into_iter()
            .filter(|o| orders.contains(o.local_id.as_str()))
            .collect(),
        payments: items
            .payments
            .into_iter()
            .filter(|p| payments.contains(p.local_id.as_str()))
            .collect(),
    }
}

pub fn order_to_dto(order: &LocalOrder) -> OrderDto {
    OrderDto {
        pos_local_id: order.local_id.clone(),
        terminal_id: order.terminal_id.clone(),
        cashier_id: order.cashier_id.clone(),
        items: order.items.clone(),
        subtotal: order.subtotal,
        tax_amount: order.tax_amount,
        discount_amount: order.discount_amount,
        total_amount: order.total_amount,
        completed_at: order.completed_at.unwrap_or(order.created_at),
    }
}

pub fn payment_to_dto(payment: &LocalPayment) -> PaymentDto {
    PaymentDto {
        pos_local_id: payment.local_id.clone(),
        order_id: payment.order_server_id.clone(),
        order_pos_local_id: Some(payment.order_local_id.clone()),
        terminal_id: payment.terminal_id.clone(),
        method: payment.method,
        amount: payment.amount,
        reference: payment.reference.clone(),
        processed_at: payment.processed_at,
    }
}

pub fn build_request(
    terminal_id: &str,
    last_sync_at: Option<DateTime<Utc>>,
    batch: &SyncItems,
) -> SyncRequest {
    SyncRequest {
        terminal_id: terminal_id.to_string(),
        last_sync_at,
        orders: batch.orders.iter().map(order_to_dto).collect(),
        payments: batch.payments.iter().map(payment_to_dto).collect(),
    }
}
