//! Timer scheduling for the sync engine.
//!
//! Every timer is its own task holding a child [`CancellationToken`]; all of
//! them feed ticks into one channel consumed by a single loop, which is the
//! only place engine actions run. A round therefore never overlaps another
//! action, and cancelling the parent token (or dropping the handle) tears
//! everything down deterministically.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RoundKind, RoundOutcome, SyncEngine, SyncError, SyncEvent};

const TICK_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
enum Tick {
    Periodic,
    Sweep,
    Retry,
    Poll,
    Retention,
    Manual(oneshot::Sender<Result<RoundOutcome, SyncError>>),
}

/// Running engine plus its timers.
pub struct SyncHandle {
    engine: Arc<SyncEngine>,
    ticks: mpsc::Sender<Tick>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Recover interrupted records, then start the loop and all timers.
    pub fn start(engine: Arc<SyncEngine>) -> Result<Self, SyncError> {
        let recovered = engine.recover()?;
        if recovered > 0 {
            info!(recovered, "records from an interrupted round queued for retry");
        }

        let cfg = engine.config().clone();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let initial_poll = cfg.poll_interval_for(engine.outstanding().unwrap_or(0));
        let (poll_tx, poll_rx) = watch::channel(initial_poll);

        let mut tasks = vec![tokio::spawn(run_loop(
            engine.clone(),
            rx,
            poll_tx,
            cancel.child_token(),
        ))];
        tasks.push(spawn_interval(cfg.sync_interval, || Tick::Periodic, &tx, &cancel));
        tasks.push(spawn_interval(cfg.sweep_interval, || Tick::Sweep, &tx, &cancel));
        tasks.push(spawn_interval(cfg.retry_interval, || Tick::Retry, &tx, &cancel));
        tasks.push(spawn_interval(cfg.retention_interval, || Tick::Retention, &tx, &cancel));
        tasks.push(spawn_adaptive_poll(poll_rx, &tx, cancel.child_token()));

        // Sweep right away so records recovered above arm the retry loop.
        if tx.try_send(Tick::Sweep).is_err() {
            debug!("initial sweep not queued");
        }

        info!(
            terminal_id = %engine.session().terminal_id(),
            sync_secs = cfg.sync_interval.as_secs(),
            sweep_secs = cfg.sweep_interval.as_secs(),
            retry_secs = cfg.retry_interval.as_secs(),
            "Sync scheduler started"
        );

        Ok(Self {
            engine,
            ticks: tx,
            cancel,
            tasks,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    /// Run a manual round through the scheduler loop and wait for it.
    pub async fn trigger(&self) -> Result<RoundOutcome, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ticks
            .send(Tick::Manual(reply_tx))
            .await
            .map_err(|_| SyncError::Stopped)?;
        reply_rx.await.map_err(|_| SyncError::Stopped)?
    }

    /// Sign the session out and stop syncing.
    pub async fn logout(self) {
        self.engine.session().logout();
        self.shutdown().await;
    }

    /// Cancel every timer, wait for the loop to finish any in-flight round,
    /// and stop the engine.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        self.engine.stop();
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_interval(
    period: Duration,
    tick: fn() -> Tick,
    tx: &mpsc::Sender<Tick>,
    parent: &CancellationToken,
) -> JoinHandle<()> {
    let tx = tx.clone();
    let token = parent.child_token();
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if tx.send(tick()).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Flag poll whose period follows the watch channel, so it can speed up as
/// soon as work appears and back off when everything is reconciled.
fn spawn_adaptive_poll(
    mut period_rx: watch::Receiver<Duration>,
    tx: &mpsc::Sender<Tick>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let tx = tx.clone();
    tokio::spawn(async move {
        loop {
            let period = *period_rx.borrow_and_update();
            tokio::select! {
                _ = token.cancelled() => break,
                changed = period_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(period) => {
                    if tx.send(Tick::Poll).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    mut rx: mpsc::Receiver<Tick>,
    poll_period: watch::Sender<Duration>,
    token: CancellationToken,
) {
    loop {
        let tick = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            tick = rx.recv() => match tick {
                Some(tick) => tick,
                None => break,
            },
        };

        let result = match tick {
            Tick::Periodic => engine.run_round(RoundKind::Scheduled).await.map(|_| ()),
            Tick::Sweep => engine.sweep().map(|_| ()),
            Tick::Retry => engine.retry_tick().await.map(|_| ()),
            Tick::Poll => engine.poll_remote_request().await.map(|_| ()),
            Tick::Retention => engine.cleanup().map(|_| ()),
            Tick::Manual(reply) => {
                let outcome = engine.run_round(RoundKind::Manual).await;
                let fatal = matches!(&outcome, Err(e) if e.is_fatal());
                // The caller may have given up waiting.
                let _ = reply.send(outcome);
                if fatal {
                    Err(SyncError::Fatal("local storage failure".into()))
                } else {
                    Ok(())
                }
            }
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!(error = %e, "stopping sync scheduler after local storage failure");
                break;
            }
            Err(e) => warn!(error = %e, "sync action failed"),
        }

        if let Ok(outstanding) = engine.outstanding() {
            let next = engine.config().poll_interval_for(outstanding);
            poll_period.send_if_modified(|current| {
                if *current != next {
                    debug!(poll_secs = next.as_secs(), outstanding, "adjusting sync-request poll interval");
                    *current = next;
                    true
                } else {
                    false
                }
            });
        }
    }
    engine.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::{DbState, NewOrder, SyncStatus as RecordStatus};
    use crate::protocol::OrderItem;
    use crate::session::TerminalSession;
    use crate::sync::mock::MockTransport;
    use crate::api::ApiError;
    use crate::sync::{EngineState, SkipReason};

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_sync_interval(Duration::from_secs(60))
            .with_sweep_interval(Duration::from_secs(30))
            .with_retry_interval(Duration::from_secs(120))
            .with_poll_intervals(Duration::from_secs(30), Duration::from_secs(300))
            .with_stale_pending_after(Duration::from_secs(120))
    }

    fn engine(transport: Arc<MockTransport>) -> Arc<SyncEngine> {
        engine_with(transport, config())
    }

    fn engine_with(transport: Arc<MockTransport>, cfg: SyncConfig) -> Arc<SyncEngine> {
        let db = Arc::new(DbState::open_in_memory().unwrap());
        let session = Arc::new(TerminalSession::new(
            "http://localhost:9",
            "term-1",
            Some("tok".into()),
        ));
        Arc::new(SyncEngine::new(db, session, transport, cfg))
    }

    fn sale(engine: &SyncEngine) -> String {
        engine
            .db()
            .create_order(&NewOrder {
                terminal_id: "term-1".into(),
                cashier_id: "c".into(),
                items: vec![OrderItem {
                    product_id: "p".into(),
                    sku: "S".into(),
                    name: "N".into(),
                    quantity: 1,
                    unit_price: 5.0,
                    tax_rate: 0.0,
                    discount_amount: 0.0,
                }],
                complete: true,
            })
            .unwrap()
            .local_id
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_runs_rounds() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine(transport.clone());
        let id = sale(&engine);
        let handle = SyncHandle::start(engine.clone()).unwrap();

        sleep(Duration::from_secs(59)).await;
        assert_eq!(transport.requests().len(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(
            engine.db().get_order(&id).unwrap().sync_status,
            RecordStatus::Synced
        );

        // Idle rounds keep refreshing the catalog.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.requests().len(), 2);
        assert!(transport.requests()[1].is_empty());

        handle.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_loop_converges_after_outage() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine(transport.clone());
        let id = sale(&engine);
        transport.fail_next(ApiError::Network("unreachable".into()));
        let handle = SyncHandle::start(engine.clone()).unwrap();

        let outcome = handle.trigger().await.unwrap();
        assert_eq!(outcome, RoundOutcome::Failed("unreachable".into()));

        // Next sweep (t=30s) arms the retry loop.
        sleep(Duration::from_secs(31)).await;
        assert!(engine.state().is_retry_active());

        // Periodic rounds skip error records; the retry tick (t=120s) picks
        // the order up.
        sleep(Duration::from_secs(90)).await;
        assert_eq!(
            engine.db().get_order(&id).unwrap().sync_status,
            RecordStatus::Synced
        );

        // Next sweep finds nothing and disarms.
        sleep(Duration::from_secs(30)).await;
        assert_eq!(engine.state(), EngineState::Idle);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flag_poll_speeds_up_with_backlog() {
        let transport = Arc::new(MockTransport::new());
        let cfg = config()
            .with_sync_interval(Duration::from_secs(100))
            .with_sweep_interval(Duration::from_secs(1000))
            .with_retry_interval(Duration::from_secs(1000));
        let engine = engine_with(transport.clone(), cfg);
        let handle = SyncHandle::start(engine.clone()).unwrap();

        // Nothing outstanding: idle poll interval (300s).
        sleep(Duration::from_secs(50)).await;
        assert_eq!(transport.poll_calls(), 0);

        // A backlog appears while offline. The t=100 periodic tick notices it
        // and switches to the active interval, so the next poll is at t=130.
        transport.set_online(false);
        sale(&engine);
        sleep(Duration::from_secs(90)).await;
        assert_eq!(transport.poll_calls(), 1);

        // Back online with an admin request: the t=160 poll runs the round.
        transport.set_online(true);
        transport.request_sync();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.poll_calls(), 2);
        assert_eq!(engine.outstanding().unwrap(), 0);
        assert!(!transport.sync_flag());

        // Reconciled: back to the idle interval, next poll not before t=460.
        sleep(Duration::from_secs(250)).await;
        assert_eq!(transport.poll_calls(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_request_runs_round() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine(transport.clone());
        let id = sale(&engine);
        transport.request_sync();
        let handle = SyncHandle::start(engine.clone()).unwrap();

        // Backlog present, so the first poll lands at t=30, before any
        // periodic round.
        sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.requests().len(), 1);
        assert!(!transport.sync_flag());
        assert_eq!(
            engine.db().get_order(&id).unwrap().sync_status,
            RecordStatus::Synced
        );

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_after_shutdown_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine(transport.clone());
        let handle = SyncHandle::start(engine.clone()).unwrap();
        let report = handle.trigger().await.unwrap();
        assert!(matches!(report, RoundOutcome::Completed(_)));

        handle.shutdown().await;
        assert_eq!(
            engine.run_round(RoundKind::Manual).await.unwrap(),
            RoundOutcome::Skipped(SkipReason::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_recovers_interrupted_records() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine(transport.clone());
        let id = sale(&engine);
        engine
            .db()
            .mark_as_syncing(crate::db::RecordKind::Order, &[id.clone()])
            .unwrap();

        let handle = SyncHandle::start(engine.clone()).unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            engine.db().get_order(&id).unwrap().sync_status,
            RecordStatus::Error
        );
        // The immediate sweep armed the retry loop.
        assert!(engine.state().is_retry_active());

        handle.logout().await;
        assert!(!engine.session().has_credential());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_outside_a_round_is_broadcast() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine_with(
            transport.clone(),
            config().with_retention(30, Duration::from_secs(10)),
        );
        let handle = SyncHandle::start(engine.clone()).unwrap();
        let mut events = handle.subscribe();
        engine.db().set_query_only(true).unwrap();

        // Retention cleanup (t=10s) is the first write and fails.
        let message = tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                match events.recv().await {
                    Ok(SyncEvent::Fatal(message)) => break message,
                    Ok(SyncEvent::StatusChanged(_)) => continue,
                    Err(e) => panic!("event stream ended: {e:?}"),
                }
            }
        })
        .await
        .expect("fatal event");
        assert!(!message.is_empty());
        assert!(transport.requests().is_empty());

        sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.state(), EngineState::Stopped);
        handle.shutdown().await;
    }
}
