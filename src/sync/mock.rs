//! Scriptable in-memory transport for engine and scheduler tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::SyncTransport;
use crate::api::ApiError;
use crate::protocol::{
    CatalogProduct, CatalogSnapshot, RecordResult, ResponseStatus, SyncRequest, SyncResponse,
    SyncResults,
};
use crate::session::TerminalSession;

#[derive(Clone, Copy)]
enum Script {
    Duplicate,
    Omit,
}

pub struct MockTransport {
    online: AtomicBool,
    sync_flag: AtomicBool,
    clear_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    fail_next: Mutex<Option<ApiError>>,
    rejections: Mutex<HashMap<String, String>>,
    scripts: Mutex<HashMap<String, Script>>,
    catalog: Mutex<Vec<CatalogProduct>>,
    requests: Mutex<Vec<SyncRequest>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            sync_flag: AtomicBool::new(false),
            clear_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
            rejections: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            catalog: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_catalog(&self, products: Vec<CatalogProduct>) {
        *self.catalog.lock().unwrap() = products;
    }

    pub fn fail_next(&self, err: ApiError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn reject(&self, pos_local_id: &str, message: &str) {
        self.rejections
            .lock()
            .unwrap()
            .insert(pos_local_id.to_string(), message.to_string());
    }

    pub fn duplicate(&self, pos_local_id: &str) {
        self.scripts
            .lock()
            .unwrap()
            .insert(pos_local_id.to_string(), Script::Duplicate);
    }

    pub fn omit(&self, pos_local_id: &str) {
        self.scripts
            .lock()
            .unwrap()
            .insert(pos_local_id.to_string(), Script::Omit);
    }

    /// Park every `sync` call until the returned notify fires.
    pub fn hold_sync(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn request_sync(&self) {
        self.sync_flag.store(true, Ordering::SeqCst);
    }

    pub fn sync_flag(&self) -> bool {
        self.sync_flag.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn result_for(&self, pos_local_id: &str) -> Option<RecordResult> {
        if let Some(message) = self.rejections.lock().unwrap().get(pos_local_id) {
            return Some(RecordResult::error(pos_local_id, message.clone()));
        }
        let server_id = format!("srv-{pos_local_id}");
        match self.scripts.lock().unwrap().get(pos_local_id).copied() {
            Some(Script::Omit) => None,
            Some(Script::Duplicate) => Some(RecordResult::duplicate(pos_local_id, server_id)),
            None => Some(RecordResult::success(pos_local_id, server_id)),
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn is_online(&self, _session: &TerminalSession) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn sync(
        &self,
        _session: &TerminalSession,
        request: &SyncRequest,
    ) -> Result<SyncResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }

        let mut seen = HashSet::new();
        let orders = request
            .orders
            .iter()
            .filter(|o| seen.insert(o.pos_local_id.clone()))
            .filter_map(|o| self.result_for(&o.pos_local_id))
            .collect();
        let payments = request
            .payments
            .iter()
            .filter_map(|p| self.result_for(&p.pos_local_id))
            .collect();

        Ok(SyncResponse {
            status: ResponseStatus::Success,
            synced_at: Utc::now(),
            results: SyncResults { orders, payments },
            catalog: Some(CatalogSnapshot {
                products: self.catalog.lock().unwrap().clone(),
                last_updated: Utc::now(),
            }),
        })
    }

    async fn sync_requested(&self, _session: &TerminalSession) -> Result<bool, ApiError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sync_flag.load(Ordering::SeqCst))
    }

    async fn clear_sync_requested(&self, _session: &TerminalSession) -> Result<(), ApiError> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        self.sync_flag.store(false, Ordering::SeqCst);
        Ok(())
    }
}
