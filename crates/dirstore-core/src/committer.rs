//! The commit coordinator: apply fencing, the periodic sync loop, the
//! commit watchdog, and snapshot retention.
//!
//! A commit cycle fences apply (no op may be between submission and
//! completion while the consistent point is captured), persists the
//! committed sequence, performs the durability step (snapshot of `current/`
//! when snapshot commits are on, whole-filesystem sync otherwise), advances
//! the journal trim point, and prunes old snapshots. A watchdog aborts the
//! process if a cycle stalls past the configured timeout.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dirstore_fs::portable;
use dirstore_types::context::Metrics;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::completion::Done;
use crate::store::StoreInner;

// ---------------------------------------------------------------------------
// Apply gate
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GateState {
    /// Submissions are held while a consistent point is being captured.
    blocked: bool,
    /// Ops submitted but not yet fully applied.
    inflight: BTreeSet<u64>,
    /// Highest sequence ever submitted.
    submitted_max: u64,
    /// Every op at or below this sequence has fully applied.
    applied_floor: u64,
}

/// Tracks ops between submission and apply completion, and lets the
/// committer fence the window shut to capture a consistent point.
#[derive(Debug, Default)]
pub(crate) struct ApplyGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ApplyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize both watermarks after mount/replay.
    pub fn set_floor(&self, seq: u64) {
        let mut st = self.state.lock();
        st.submitted_max = seq;
        st.applied_floor = seq;
    }

    /// Register a submitted op. Blocks while a commit is capturing its
    /// consistent point.
    pub fn op_submit(&self, seq: u64) {
        let mut st = self.state.lock();
        while st.blocked {
            self.cond.wait(&mut st);
        }
        st.inflight.insert(seq);
        st.submitted_max = st.submitted_max.max(seq);
    }

    /// Mark an op fully applied.
    pub fn op_applied(&self, seq: u64) {
        let mut st = self.state.lock();
        st.inflight.remove(&seq);
        st.applied_floor = st
            .inflight
            .first()
            .map_or(st.submitted_max, |min| min.saturating_sub(1));
        self.cond.notify_all();
    }

    /// Fence submissions and wait for in-flight ops to drain. Returns the
    /// consistent applied point.
    pub fn commit_start(&self) -> u64 {
        let mut st = self.state.lock();
        st.blocked = true;
        while !st.inflight.is_empty() {
            self.cond.wait(&mut st);
        }
        st.applied_floor
    }

    /// Lift the fence (the consistent point has been captured durably
    /// enough for the mode in play).
    pub fn commit_started(&self) {
        let mut st = self.state.lock();
        st.blocked = false;
        self.cond.notify_all();
    }

    /// Wait until nothing is between submission and apply.
    pub fn wait_drained(&self) {
        let mut st = self.state.lock();
        while !st.inflight.is_empty() {
            self.cond.wait(&mut st);
        }
    }

    pub fn applied_floor(&self) -> u64 {
        self.state.lock().applied_floor
    }
}

// ---------------------------------------------------------------------------
// Commit watchdog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct WatchdogState {
    deadline: Option<Instant>,
    stop: bool,
}

/// Aborts the process when an armed commit cycle overruns its deadline.
/// Crash-only discipline: a wedged durability step must not linger.
pub(crate) struct CommitWatchdog {
    shared: Arc<(Mutex<WatchdogState>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl CommitWatchdog {
    pub fn start() -> Self {
        let shared = Arc::new((Mutex::new(WatchdogState::default()), Condvar::new()));
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("dirstore-commit-watchdog".to_owned())
            .spawn(move || {
                let (lock, cond) = &*thread_shared;
                let mut st = lock.lock();
                loop {
                    if st.stop {
                        return;
                    }
                    match st.deadline {
                        None => {
                            cond.wait(&mut st);
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                error!("commit watchdog fired, aborting");
                                std::process::abort();
                            }
                            let _ = cond.wait_for(&mut st, deadline - now);
                        }
                    }
                }
            })
            .expect("spawn commit watchdog");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn arm(&self, timeout: Duration) {
        let (lock, cond) = &*self.shared;
        lock.lock().deadline = Some(Instant::now() + timeout);
        cond.notify_all();
    }

    pub fn disarm(&self) {
        let (lock, cond) = &*self.shared;
        lock.lock().deadline = None;
        cond.notify_all();
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (lock, cond) = &*self.shared;
        {
            let mut st = lock.lock();
            st.deadline = None;
            st.stop = true;
        }
        cond.notify_all();
        if let Some(h) = self.handle.take() {
            drop(h.join());
        }
    }
}

impl Drop for CommitWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Sync loop state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SyncFlags {
    force: bool,
    stop: bool,
    waiters: Vec<Done>,
}

/// Wake-up channel between the rest of the store and the sync thread.
#[derive(Default)]
pub(crate) struct SyncState {
    flags: Mutex<SyncFlags>,
    cond: Condvar,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nudge the committer (STARTSYNC, flush, shutdown paths).
    pub fn force_sync(&self) {
        let mut st = self.flags.lock();
        st.force = true;
        self.cond.notify_all();
    }

    /// Register a completion to fire after the next commit, and nudge.
    pub fn add_waiter(&self, done: Done) {
        let mut st = self.flags.lock();
        st.waiters.push(done);
        st.force = true;
        self.cond.notify_all();
    }

    pub fn request_stop(&self) {
        let mut st = self.flags.lock();
        st.stop = true;
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// The sync thread body
// ---------------------------------------------------------------------------

impl StoreInner {
    /// Periodic commit loop; runs on a dedicated thread from mount to
    /// umount.
    pub(crate) fn sync_entry(&self) {
        let min_interval = self.cx.config().min_sync_interval;
        let max_interval = self.cx.config().max_sync_interval;
        loop {
            let (waiters, stop) = {
                let wait_start = Instant::now();
                let mut st = self.sync_state.flags.lock();
                if !st.force && !st.stop {
                    let _ = self.sync_state.cond.wait_for(&mut st, max_interval);
                }
                if st.force {
                    st.force = false;
                } else if !st.stop {
                    // Pace commits: even an early wake-up respects the
                    // minimum interval.
                    let woke = wait_start.elapsed();
                    if woke < min_interval {
                        let _ = self.sync_state.cond.wait_for(&mut st, min_interval - woke);
                        st.force = false;
                    }
                }
                (std::mem::take(&mut st.waiters), st.stop)
            };

            self.commit_cycle();

            for w in waiters {
                self.fin_ondisk.queue(w, 0);
            }
            if stop {
                debug!("sync thread stopping");
                return;
            }
        }
    }

    /// One commit cycle. Structural failures here abort the process: a
    /// partially-durable commit must never look complete.
    fn commit_cycle(&self) {
        let committed = self.committed_seq.load(Ordering::Acquire);
        let cp = self.gate.commit_start();
        if cp <= committed {
            self.gate.commit_started();
            return;
        }

        let start = Instant::now();
        self.throttle.set_committing(true);
        self.watchdog.arm(self.cx.config().commit_timeout);
        // New epoch: deferred flushes for data this sync covers are moot.
        let epoch = self.flusher.advance_epoch();
        self.committing_seq.store(cp, Ordering::Release);
        debug!(committing = cp, epoch, "commit cycle starting");
        self.cx.inject_failure("commit.start");

        let result = self.commit_durable(cp);
        match result {
            Ok(()) => {}
            Err(e) => {
                error!(error = %e, committing = cp, "commit cycle failed");
                std::process::abort();
            }
        }

        self.committed_seq.store(cp, Ordering::Release);
        if let Err(e) = self.journal.committed_thru(cp) {
            error!(error = %e, "journal trim failed");
            std::process::abort();
        }

        if self.stable_snapshots {
            self.prune_snapshots();
        }

        self.watchdog.disarm();
        self.throttle.set_committing(false);
        Metrics::inc(&self.cx.metrics().commits);
        info!(
            committed = cp,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "commit cycle done"
        );
    }

    fn commit_durable(&self, cp: u64) -> dirstore_error::Result<()> {
        portable::write_file_durable(&self.layout.op_seq_file(), format!("{cp}\n").as_bytes())?;
        self.omap.sync_all()?;
        self.cx.inject_failure("commit.seq_written");

        if self.stable_snapshots {
            // The snapshot must complete while apply is fenced; it *is* the
            // durability step.
            let snap = self.layout.snap_dir(cp);
            portable::snapshot_dir(&self.layout.current(), &snap)?;
            self.snaps.lock().push(cp);
            self.gate.commit_started();
        } else {
            // Apply may resume before the sync: anything newer that sneaks
            // into the flush has seq > cp and replays fine.
            self.gate.commit_started();
            if self.cx.config().fsync_flushes_data {
                // Only sound where fsync drags file data through the
                // filesystem journal.
                let f = std::fs::File::open(self.layout.op_seq_file())?;
                f.sync_all()?;
            } else {
                portable::sync_filesystem(self.layout.base())?;
            }
        }
        self.cx.inject_failure("commit.durable");
        Ok(())
    }

    fn prune_snapshots(&self) {
        let mut snaps = self.snaps.lock();
        while snaps.len() > 2 {
            let old = snaps.remove(0);
            let dir = self.layout.snap_dir(old);
            debug!(snap = old, "pruning old commit snapshot");
            if let Err(e) = portable::destroy_dir(&dir) {
                warn!(error = %e, snap = old, "failed to remove old snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_floor_tracks_contiguous_applies() {
        let gate = ApplyGate::new();
        gate.set_floor(10);
        assert_eq!(gate.applied_floor(), 10);

        gate.op_submit(11);
        gate.op_submit(12);
        gate.op_submit(13);
        // Out-of-order completion: floor only moves past contiguous work.
        gate.op_applied(12);
        assert_eq!(gate.applied_floor(), 10);
        gate.op_applied(11);
        assert_eq!(gate.applied_floor(), 12);
        gate.op_applied(13);
        assert_eq!(gate.applied_floor(), 13);
    }

    #[test]
    fn test_commit_start_waits_for_drain() {
        let gate = Arc::new(ApplyGate::new());
        gate.op_submit(1);

        let g2 = Arc::clone(&gate);
        let committer = std::thread::spawn(move || g2.commit_start());

        std::thread::sleep(Duration::from_millis(50));
        assert!(!committer.is_finished(), "commit must wait for in-flight op");
        gate.op_applied(1);
        assert_eq!(committer.join().unwrap(), 1);
        gate.commit_started();
    }

    #[test]
    fn test_fence_blocks_new_submissions() {
        let gate = Arc::new(ApplyGate::new());
        gate.op_submit(1);
        gate.op_applied(1);

        let cp = gate.commit_start();
        assert_eq!(cp, 1);

        let g2 = Arc::clone(&gate);
        let submitter = std::thread::spawn(move || {
            g2.op_submit(2);
            g2.op_applied(2);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished(), "submission must wait out the fence");

        gate.commit_started();
        submitter.join().unwrap();
        assert_eq!(gate.applied_floor(), 2);
    }

    #[test]
    fn test_watchdog_arm_disarm() {
        let wd = CommitWatchdog::start();
        // Generous deadline, disarmed long before it could fire.
        wd.arm(Duration::from_secs(600));
        wd.disarm();
        wd.arm(Duration::from_secs(600));
        wd.disarm();
        wd.stop();
    }

    #[test]
    fn test_sync_state_collects_waiters() {
        let st = SyncState::new();
        let (done, wait) = crate::completion::pair();
        st.add_waiter(done);
        let mut flags = st.flags.lock();
        assert!(flags.force);
        assert_eq!(flags.waiters.len(), 1);
        for w in std::mem::take(&mut flags.waiters) {
            w.complete(0);
        }
        drop(flags);
        assert_eq!(wait.wait(), 0);
    }
}
