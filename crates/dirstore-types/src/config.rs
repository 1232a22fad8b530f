//! Store configuration.

use std::time::Duration;

/// How the journal couples to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Pick at mount: `Parallel` when snapshot commits are available,
    /// `WriteAhead` otherwise.
    Auto,
    /// Journal durably records the transaction before it is queued for
    /// apply. Crash survival relies on replay.
    WriteAhead,
    /// Journal write and apply proceed concurrently; requires snapshot
    /// commits so recovery can roll back to a consistent point.
    Parallel,
    /// Apply first, journal after. Only when filesystem atomicity is
    /// trusted.
    Trailing,
}

/// Tunables, captured once at construction and carried by the context.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Width of the apply worker pool.
    pub op_threads: usize,
    /// Admission limit on queued (submitted, un-applied) ops.
    pub queue_max_ops: u64,
    /// Admission limit on queued bytes.
    pub queue_max_bytes: u64,
    /// Extra op allowance while a commit is in flight.
    pub queue_committing_max_ops: u64,
    /// Extra byte allowance while a commit is in flight.
    pub queue_committing_max_bytes: u64,
    /// Lower bound between commit cycles.
    pub min_sync_interval: Duration,
    /// Upper bound between commit cycles.
    pub max_sync_interval: Duration,
    /// Watchdog: a commit cycle exceeding this aborts the process.
    pub commit_timeout: Duration,
    pub journal_mode: JournalMode,
    /// Use filesystem snapshots of `current/` as the durability step.
    pub snapshot_commits: bool,
    /// Commit durability via fsync of the seq file alone. Only safe on
    /// filesystems that journal data on fsync; otherwise the cycle uses a
    /// whole-filesystem sync.
    pub fsync_flushes_data: bool,
    /// Hand large writes to the background flusher thread.
    pub flusher: bool,
    /// Writes at least this large are queued for deferred flushing.
    pub flush_min: usize,
    /// Flusher queue bound; beyond it writes skip the deferred flush.
    pub flusher_max_queue: usize,
    /// Permit rollback to a snapshot older than un-snapshotted data.
    pub use_stale_snap: bool,
    /// Roll back to this operator-named snapshot at mount.
    pub rollback_to_cluster_snap: Option<String>,
    /// Send large/overflowing attribute values to the object map.
    pub prefer_omap: bool,
    /// Largest value stored as an inline xattr when `prefer_omap` is set.
    pub max_inline_xattr_size: usize,
    /// Most inline xattrs per object when `prefer_omap` is set.
    pub max_inline_xattrs: usize,
    /// Chunk size for splitting large values across underlying xattrs.
    pub xattr_chunk_size: usize,
    /// Object count at which an index directory splits.
    pub split_threshold: usize,
    /// Fault injection: exit the process at the Nth injection point
    /// (0 disables).
    pub kill_at: u64,
    /// Allow mounting a store with an older on-disk version stamp.
    pub do_update: bool,
    /// Expected identity; mount fails if the stored fsid differs.
    pub expected_fsid: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            op_threads: 2,
            queue_max_ops: 500,
            queue_max_bytes: 100 << 20,
            queue_committing_max_ops: 500,
            queue_committing_max_bytes: 100 << 20,
            min_sync_interval: Duration::from_millis(10),
            max_sync_interval: Duration::from_secs(5),
            commit_timeout: Duration::from_secs(600),
            journal_mode: JournalMode::Auto,
            snapshot_commits: false,
            fsync_flushes_data: false,
            flusher: true,
            flush_min: 65536,
            flusher_max_queue: 512,
            use_stale_snap: false,
            rollback_to_cluster_snap: None,
            prefer_omap: false,
            max_inline_xattr_size: 512,
            max_inline_xattrs: 10,
            xattr_chunk_size: 2048,
            split_threshold: 320,
            kill_at: 0,
            do_update: false,
            expected_fsid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let c = StoreConfig::default();
        assert!(c.op_threads >= 1);
        assert!(c.min_sync_interval < c.max_sync_interval);
        assert_eq!(c.kill_at, 0);
        assert!(matches!(c.journal_mode, JournalMode::Auto));
    }
}
