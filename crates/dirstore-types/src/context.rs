//! Per-instance context threaded through every component.
//!
//! There is no process-global state: each component receives an
//! `Arc<CoreContext>` at construction carrying the configuration snapshot,
//! the metrics sink, and the crash-test fault injector.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::error;

use crate::config::StoreConfig;

/// Running counters exposed for tests and operators.
#[derive(Debug, Default)]
pub struct Metrics {
    pub ops_submitted: AtomicU64,
    pub bytes_submitted: AtomicU64,
    pub ops_applied: AtomicU64,
    pub commits: AtomicU64,
    pub journal_records_replayed: AtomicU64,
    pub throttle_waits: AtomicU64,
}

impl Metrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, v: u64) {
        counter.fetch_add(v, Ordering::Relaxed);
    }
}

/// Configuration snapshot plus cross-cutting facilities.
#[derive(Debug)]
pub struct CoreContext {
    config: StoreConfig,
    metrics: Metrics,
    /// Remaining injection points before the process exits; 0 disables.
    kill_countdown: AtomicU64,
}

impl CoreContext {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let kill = config.kill_at;
        Self {
            config,
            metrics: Metrics::default(),
            kill_countdown: AtomicU64::new(kill),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Crash-test hook: decrement the kill counter; when it reaches zero the
    /// process exits immediately without cleanup, simulating a crash at this
    /// point.
    pub fn inject_failure(&self, point: &'static str) {
        // Fast path: disabled.
        if self.kill_countdown.load(Ordering::Relaxed) == 0 {
            return;
        }
        let prev = self.kill_countdown.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            error!(point, "fault injection reached zero, killing process");
            std::process::exit(1);
        }
    }

    /// True if a `kill_at` budget is armed (used to keep injection points
    /// cheap in the common case).
    #[must_use]
    pub fn faults_armed(&self) -> bool {
        self.kill_countdown.load(Ordering::Relaxed) > 0
    }
}
