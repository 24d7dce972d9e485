//! Terminal sync engine configuration.

use std::time::Duration;

/// Timers and limits for one terminal sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Periodic sync round, also the catalog refresh cadence when idle.
    pub sync_interval: Duration,
    /// Fast sweep looking for `error` / stale `pending` records.
    pub sweep_interval: Duration,
    /// Slow retry loop, only active while the sweep finds work.
    pub retry_interval: Duration,
    /// Remote "sync requested" poll while local records are outstanding.
    pub poll_interval_active: Duration,
    /// Remote "sync requested" poll when fully reconciled.
    pub poll_interval_idle: Duration,
    pub request_timeout: Duration,
    pub connectivity_timeout: Duration,
    /// A `pending` record older than this is picked up by the retry sweep.
    pub stale_pending_after: Duration,
    /// Synced records older than this many days are deleted locally.
    pub retention_days: i64,
    pub retention_interval: Duration,
    /// Request bodies above this size are zstd-compressed.
    pub compress_threshold_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            retry_interval: Duration::from_secs(120),
            poll_interval_active: Duration::from_secs(30),
            poll_interval_idle: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            connectivity_timeout: Duration::from_secs(5),
            stale_pending_after: Duration::from_secs(120),
            retention_days: 30,
            retention_interval: Duration::from_secs(3600),
            compress_threshold_bytes: 16 * 1024,
        }
    }
}

impl SyncConfig {
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_poll_intervals(mut self, active: Duration, idle: Duration) -> Self {
        self.poll_interval_active = active;
        self.poll_interval_idle = idle;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connectivity_timeout(mut self, timeout: Duration) -> Self {
        self.connectivity_timeout = timeout;
        self
    }

    pub fn with_stale_pending_after(mut self, age: Duration) -> Self {
        self.stale_pending_after = age;
        self
    }

    pub fn with_retention(mut self, days: i64, interval: Duration) -> Self {
        self.retention_days = days;
        self.retention_interval = interval;
        self
    }

    pub fn with_compress_threshold(mut self, bytes: usize) -> Self {
        self.compress_threshold_bytes = bytes;
        self
    }

    /// Poll interval for the remote sync flag given the outstanding backlog.
    pub fn poll_interval_for(&self, outstanding: i64) -> Duration {
        if outstanding > 0 {
            self.poll_interval_active
        } else {
            self.poll_interval_idle
        }
    }
}
