//! The `DirStore` engine: mount and recovery, the submit path for all three
//! journal modes, and the read-side API.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dirstore_error::{Result, StoreError};
use dirstore_fs::{portable, FsCapabilities};
use dirstore_journal::{FileJournal, Journal};
use dirstore_omap::{FileObjectMap, ObjectMap};
use dirstore_types::context::Metrics;
use dirstore_types::txn::{decode_batch, encode_batch};
use dirstore_types::{Cid, CoreContext, JournalMode, Oid, StoreConfig, Transaction};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::attrs::AttrStore;
use crate::committer::{ApplyGate, CommitWatchdog, SyncState};
use crate::completion::{self, Done, Finisher, FinisherHandle, Wait};
use crate::flusher::{Flusher, FlusherThread};
use crate::guard::ReplayGuard;
use crate::index::{IndexManager, IndexedPath, PathIndex};
use crate::layout::{Layout, STORE_VERSION};
use crate::sequencer::{ApplyPool, OpBatch, OpSequencer, Sequencer, WorkQueue};
use crate::throttle::Throttle;

/// Minimal object metadata returned by [`DirStore::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub nlink: u64,
}

#[derive(Debug)]
struct SubmitState {
    next_seq: u64,
}

pub(crate) struct StoreInner {
    pub(crate) cx: Arc<CoreContext>,
    pub(crate) layout: Layout,
    pub(crate) caps: FsCapabilities,
    pub(crate) mode: JournalMode,
    pub(crate) stable_snapshots: bool,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) omap: Arc<dyn ObjectMap>,
    pub(crate) attrs: AttrStore,
    pub(crate) guard: ReplayGuard,
    pub(crate) indexes: IndexManager,
    pub(crate) replaying: AtomicBool,
    submit: Mutex<SubmitState>,
    pub(crate) gate: ApplyGate,
    pub(crate) throttle: Throttle,
    pub(crate) work: Arc<WorkQueue>,
    pub(crate) sync_state: SyncState,
    pub(crate) committed_seq: AtomicU64,
    pub(crate) committing_seq: AtomicU64,
    pub(crate) snaps: Mutex<Vec<u64>>,
    pub(crate) fin_applied: FinisherHandle,
    pub(crate) fin_ondisk: FinisherHandle,
    pub(crate) watchdog: CommitWatchdog,
    pub(crate) flusher: Flusher,
    /// Keeps the exclusive advisory lock on `fsid` for the whole mount.
    _fsid_lock: File,
}

struct Mounted {
    inner: Arc<StoreInner>,
    pool: Option<ApplyPool>,
    sync_thread: Option<JoinHandle<()>>,
    fin_applied: Option<Finisher>,
    fin_ondisk: Option<Finisher>,
    flusher_thread: Option<FlusherThread>,
    default_seq: Sequencer,
}

/// A local object store over a POSIX directory tree.
pub struct DirStore {
    cx: Arc<CoreContext>,
    layout: Layout,
    mounted: Option<Mounted>,
}

impl DirStore {
    #[must_use]
    pub fn new(base: &Path, config: StoreConfig) -> Self {
        Self {
            cx: Arc::new(CoreContext::new(config)),
            layout: Layout::new(base),
            mounted: None,
        }
    }

    fn inner(&self) -> Result<&Arc<StoreInner>> {
        self.mounted
            .as_ref()
            .map(|m| &m.inner)
            .ok_or(StoreError::NotMounted)
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    // -----------------------------------------------------------------------
    // mkfs / mkjournal
    // -----------------------------------------------------------------------

    /// Initialize the on-disk layout: identity, version stamp, `current/`,
    /// the object map, and the journal.
    pub fn mkfs(&self) -> Result<()> {
        let base = self.layout.base();
        fs::create_dir_all(base)?;
        info!(base = %base.display(), "mkfs");

        let fsid_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.layout.fsid_file())?;
        portable::lock_file_exclusive(&fsid_file, &self.layout.fsid_file())?;

        let fsid = match read_fsid(&self.layout.fsid_file()) {
            Ok(existing) => {
                if let Some(expected) = &self.cx.config().expected_fsid {
                    if expected.as_bytes() != existing.as_slice() {
                        return Err(StoreError::IdentityMismatch {
                            found: String::from_utf8_lossy(&existing).into_owned(),
                            expected: expected.clone(),
                        });
                    }
                }
                debug!("mkfs: fsid already set");
                existing
            }
            Err(_) => {
                let fsid = generate_fsid();
                let mut contents = fsid.to_vec();
                contents.push(b'\n');
                portable::write_file_durable(&self.layout.fsid_file(), &contents)?;
                info!(fsid = %String::from_utf8_lossy(&fsid), "mkfs generated fsid");
                fsid
            }
        };

        portable::write_file_durable(&self.layout.version_file(), &STORE_VERSION.to_le_bytes())?;

        if !self.layout.current().is_dir() {
            fs::create_dir(self.layout.current())?;
        }
        if read_op_seq(&self.layout.op_seq_file()).unwrap_or(0) == 0 {
            portable::write_file_durable(&self.layout.op_seq_file(), b"1\n")?;
        }

        // Object map directory.
        drop(FileObjectMap::open(&self.layout.omap_dir())?);

        // Journal.
        if !self.layout.journal_file().exists() {
            drop(FileJournal::create(&self.layout.journal_file(), fsid)?);
        }

        // Snapshot commits get a baseline snapshot to roll back to.
        if self.cx.config().snapshot_commits && !self.layout.snap_dir(1).exists() {
            portable::snapshot_dir(&self.layout.current(), &self.layout.snap_dir(1))?;
        }

        info!(base = %base.display(), "mkfs done");
        Ok(())
    }

    /// Create (or re-create after validation failure) the journal.
    pub fn mkjournal(&self) -> Result<()> {
        let fsid = read_fsid(&self.layout.fsid_file())?;
        let path = self.layout.journal_file();
        if path.exists() && FileJournal::check(&path, fsid).is_ok() {
            return Ok(());
        }
        drop(FileJournal::create(&path, fsid)?);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // mount / umount
    // -----------------------------------------------------------------------

    /// Lock the store, pick a consistent starting point, replay the
    /// journal, and start the pipeline threads.
    #[allow(clippy::too_many_lines)]
    pub fn mount(&mut self) -> Result<()> {
        if self.mounted.is_some() {
            return Ok(());
        }
        let cfg = self.cx.config().clone();
        let base = self.layout.base();
        info!(base = %base.display(), "mounting");

        // Identity: exclusive advisory lock held for the whole mount.
        let fsid_lock = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.layout.fsid_file())?;
        portable::lock_file_exclusive(&fsid_lock, &self.layout.fsid_file())?;
        let fsid = read_fsid(&self.layout.fsid_file())?;
        if let Some(expected) = &cfg.expected_fsid {
            if expected.as_bytes() != fsid.as_slice() {
                return Err(StoreError::IdentityMismatch {
                    found: String::from_utf8_lossy(&fsid).into_owned(),
                    expected: expected.clone(),
                });
            }
        }

        // Version stamp.
        let version = read_version(&self.layout.version_file())?;
        if version != STORE_VERSION {
            if cfg.do_update {
                warn!(version, "stale version stamp, upgrading on request");
                portable::write_file_durable(
                    &self.layout.version_file(),
                    &STORE_VERSION.to_le_bytes(),
                )?;
            } else {
                return Err(StoreError::VersionMismatch {
                    found: version,
                    supported: STORE_VERSION,
                });
            }
        }

        let caps = FsCapabilities::detect(base)?;
        let stable_snapshots = cfg.snapshot_commits;

        // Snapshot inventory.
        let (mut snaps, cluster_snaps) = scan_snapshots(&self.layout)?;
        if !snaps.is_empty() {
            info!(?snaps, "found commit snapshots");
        }
        if let Some(name) = &cfg.rollback_to_cluster_snap {
            if !cluster_snaps.contains(name) {
                return Err(StoreError::NotFound {
                    what: format!("cluster snapshot '{name}'"),
                });
            }
        }

        if stable_snapshots {
            self.roll_back_current(&cfg, &snaps)?;
            if self.layout.nosnap_file().exists() {
                fs::remove_file(self.layout.nosnap_file())?;
            }
        } else {
            // Mark current/ so a later snapshot-mode mount cannot silently
            // roll back past data written now.
            if !self.layout.nosnap_file().exists() {
                portable::write_file_durable(&self.layout.nosnap_file(), b"")?;
            }
            snaps.clear();
        }

        let committed = read_op_seq(&self.layout.op_seq_file())?;
        if committed == 0 {
            return Err(StoreError::Corrupt {
                detail: "committed sequence is zero; mkfs incomplete?".to_owned(),
            });
        }
        info!(committed, "mount read committed seq");

        // External stores.
        let omap: Arc<dyn ObjectMap> = Arc::new(FileObjectMap::open(&self.layout.omap_dir())?);
        omap.check()?;
        let journal: Arc<dyn Journal> =
            Arc::new(FileJournal::open(&self.layout.journal_file(), fsid)?);

        // Resolve the journal coupling mode.
        let mode = match cfg.journal_mode {
            JournalMode::Auto => {
                if stable_snapshots {
                    info!("mount: enabling PARALLEL journal mode (snapshot commits available)");
                    JournalMode::Parallel
                } else {
                    info!("mount: enabling WRITEAHEAD journal mode");
                    JournalMode::WriteAhead
                }
            }
            JournalMode::Parallel if !stable_snapshots => {
                warn!("PARALLEL journal mode needs snapshot commits; using WRITEAHEAD");
                JournalMode::WriteAhead
            }
            explicit => {
                info!(?explicit, "mount: journal mode explicitly configured");
                explicit
            }
        };

        let (fin_applied, fin_applied_handle) = Finisher::start("applied");
        let (fin_ondisk, fin_ondisk_handle) = Finisher::start("ondisk");
        let (flusher_thread, flusher) = Flusher::start(cfg.flusher_max_queue);

        let inner = Arc::new(StoreInner {
            cx: Arc::clone(&self.cx),
            layout: self.layout.clone(),
            caps,
            mode,
            stable_snapshots,
            journal,
            omap: Arc::clone(&omap),
            attrs: AttrStore::new(Arc::clone(&self.cx), Arc::clone(&omap)),
            guard: ReplayGuard::new(Arc::clone(&self.cx), omap, stable_snapshots),
            indexes: IndexManager::new(Arc::clone(&self.cx)),
            replaying: AtomicBool::new(false),
            submit: Mutex::new(SubmitState {
                next_seq: committed + 1,
            }),
            gate: ApplyGate::new(),
            throttle: Throttle::new(Arc::clone(&self.cx)),
            work: WorkQueue::new(),
            sync_state: SyncState::new(),
            committed_seq: AtomicU64::new(committed),
            committing_seq: AtomicU64::new(committed),
            snaps: Mutex::new(snaps),
            fin_applied: fin_applied_handle,
            fin_ondisk: fin_ondisk_handle,
            watchdog: CommitWatchdog::start(),
            flusher,
            _fsid_lock: fsid_lock,
        });

        // Finish interrupted index splits before anything touches paths.
        for cid in self.scan_collections()? {
            inner.coll_index(&cid).cleanup()?;
        }

        // Replay: everything the journal holds past the committed point.
        let last_replayed = inner.journal_replay(committed)?;
        let floor = committed.max(last_replayed);
        inner.gate.set_floor(floor);
        inner.submit.lock().next_seq = floor + 1;

        // Threads.
        let pool_inner = Arc::clone(&inner);
        let pool = ApplyPool::start(cfg.op_threads, &inner.work, move |osr| {
            pool_inner.run_sequencer(osr);
        });
        let sync_inner = Arc::clone(&inner);
        let sync_thread = std::thread::Builder::new()
            .name("dirstore-sync".to_owned())
            .spawn(move || sync_inner.sync_entry())
            .expect("spawn sync thread");

        self.mounted = Some(Mounted {
            inner,
            pool: Some(pool),
            sync_thread: Some(sync_thread),
            fin_applied: Some(fin_applied),
            fin_ondisk: Some(fin_ondisk),
            flusher_thread: Some(flusher_thread),
            default_seq: Sequencer::default(),
        });
        info!(floor, "mount complete");
        Ok(())
    }

    /// Roll `current/` back to the newest usable snapshot.
    fn roll_back_current(&self, cfg: &StoreConfig, snaps: &[u64]) -> Result<()> {
        let src = if let Some(name) = &cfg.rollback_to_cluster_snap {
            warn!(name, "rolling back to operator snapshot");
            self.layout.cluster_snap_dir(name)
        } else {
            let Some(&latest) = snaps.last() else {
                warn!("no consistent snapshots found; store may be inconsistent");
                return Ok(());
            };
            self.layout.snap_dir(latest)
        };

        if self.layout.nosnap_file().exists() {
            if !cfg.use_stale_snap {
                error!(
                    "current/ is not snapshotted; refusing rollback that would lose new data"
                );
                return Err(StoreError::StaleSnapshot);
            }
            warn!("forcing use of stale snapshot data on operator request");
        }

        let cur_seq = read_op_seq(&self.layout.op_seq_file()).unwrap_or(0);
        info!(from = cur_seq, snap = %src.display(), "rolling current/ back");
        fs::remove_dir_all(self.layout.current())?;
        portable::snapshot_dir(&src, &self.layout.current())?;
        Ok(())
    }

    /// Drain, final-sync, stop threads, release locks.
    pub fn umount(&mut self) -> Result<()> {
        let Some(mut m) = self.mounted.take() else {
            return Ok(());
        };
        info!("unmounting");

        // Everything submitted must apply, then a final commit covers it.
        m.inner.gate.wait_drained();
        let (done, wait) = completion::pair();
        m.inner.sync_state.add_waiter(done);
        let _ = wait.wait();

        m.inner.sync_state.request_stop();
        if let Some(h) = m.sync_thread.take() {
            drop(h.join());
        }
        m.inner.work.shutdown();
        if let Some(pool) = m.pool.take() {
            pool.join();
        }
        if let Some(f) = m.fin_applied.take() {
            f.stop();
        }
        if let Some(f) = m.fin_ondisk.take() {
            f.stop();
        }
        if let Some(f) = m.flusher_thread.take() {
            f.stop();
        }
        // Dropping the inner arc stops the watchdog and releases the fsid
        // lock.
        drop(m);
        info!("unmounted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Admit, journal, queue for apply, and arrange notifications for a
    /// batch of transactions on one sequencer stream.
    pub fn queue_transactions(
        &self,
        osr: &Sequencer,
        txns: Vec<Transaction>,
        on_applied: Option<Done>,
        on_committed: Option<Done>,
    ) -> Result<()> {
        let inner = self.inner()?;
        for t in &txns {
            if t.has_deprecated_op() {
                return Err(StoreError::DeprecatedOp { op: "coll_move" });
            }
        }

        let ops: u64 = txns.iter().map(Transaction::num_ops).sum();
        let bytes: u64 = txns.iter().map(Transaction::num_bytes).sum();
        inner.throttle.reserve(ops, bytes);
        Metrics::add(&inner.cx.metrics().ops_submitted, ops);
        Metrics::add(&inner.cx.metrics().bytes_submitted, bytes);

        match inner.mode {
            JournalMode::Trailing => {
                self.queue_trailing(inner, osr, txns, ops, bytes, on_applied, on_committed)
            }
            _ => self.queue_journaled(inner, osr, txns, on_applied, on_committed),
        }
    }

    /// WRITEAHEAD and PARALLEL submission.
    fn queue_journaled(
        &self,
        inner: &Arc<StoreInner>,
        osr: &Sequencer,
        txns: Vec<Transaction>,
        on_applied: Option<Done>,
        on_committed: Option<Done>,
    ) -> Result<()> {
        let parallel = matches!(inner.mode, JournalMode::Parallel);

        let batch = {
            let mut sub = inner.submit.lock();
            let seq = sub.next_seq;
            sub.next_seq += 1;
            // Registers the op with the commit fence; may pause here while a
            // consistent point is captured.
            inner.gate.op_submit(seq);

            let payload = encode_batch(&txns);
            inner.journal_write(seq, &payload);

            let batch = OpBatch::new(seq, txns, on_applied);
            if parallel {
                // Apply is allowed ahead of journal durability: recovery
                // rolls back to a snapshot.
                batch.mark_journaled();
            }
            // Queue now, under the submit lock, to pin stream order.
            osr.inner.queue(Arc::clone(&batch));
            if parallel {
                inner.work.queue(Arc::clone(&osr.inner));
            }
            batch
        };

        debug!(seq = batch.seq, mode = ?inner.mode, stream = osr.name(), "queued transactions");

        // Durable journal ack, outside the submit lock.
        inner.journal_flush();
        if !parallel {
            batch.mark_journaled();
            inner.work.queue(Arc::clone(&osr.inner));
        }
        // On-disk durability achieved (write-ahead): fire on_commit.
        inner.fin_ondisk.queue_opt(on_committed, 0);
        Ok(())
    }

    /// TRAILING submission: apply first, journal after.
    #[allow(clippy::too_many_arguments)]
    fn queue_trailing(
        &self,
        inner: &Arc<StoreInner>,
        osr: &Sequencer,
        txns: Vec<Transaction>,
        ops: u64,
        bytes: u64,
        on_applied: Option<Done>,
        on_committed: Option<Done>,
    ) -> Result<()> {
        // The whole apply-then-journal section is serialized: trailing
        // records must land in the journal in sequence order.
        let (seq, status) = {
            let mut sub = inner.submit.lock();
            let seq = sub.next_seq;
            sub.next_seq += 1;
            inner.gate.op_submit(seq);
            debug!(seq, stream = osr.name(), "applying transactions (trailing journal)");

            let status = {
                let _stream = osr.inner.apply_lock.lock();
                inner.apply_batch(seq, &txns)
            };
            let payload = encode_batch(&txns);
            inner.journal_write(seq, &payload);
            (seq, status)
        };
        inner.journal_flush();

        inner.gate.op_applied(seq);
        inner.throttle.release(ops, bytes);
        inner.fin_applied.queue_opt(on_applied, status);
        inner.fin_ondisk.queue_opt(on_committed, 0);
        Ok(())
    }

    /// Synchronous convenience: submit on the default stream and wait for
    /// apply.
    pub fn apply_transaction(&self, txn: Transaction) -> Result<i32> {
        let default_seq = self
            .mounted
            .as_ref()
            .map(|m| m.default_seq.clone())
            .ok_or(StoreError::NotMounted)?;
        let (done, wait) = completion::pair();
        self.queue_transactions(&default_seq, vec![txn], Some(done), None)?;
        Ok(wait.wait())
    }

    /// Submit and return both completion waiters.
    pub fn queue_with_waiters(
        &self,
        osr: &Sequencer,
        txns: Vec<Transaction>,
    ) -> Result<(Wait, Wait)> {
        let (applied_done, applied_wait) = completion::pair();
        let (commit_done, commit_wait) = completion::pair();
        self.queue_transactions(osr, txns, Some(applied_done), Some(commit_done))?;
        Ok((applied_wait, commit_wait))
    }

    // -----------------------------------------------------------------------
    // Sync / flush / snapshots
    // -----------------------------------------------------------------------

    /// Force a commit cycle and wait for it.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner()?;
        let (done, wait) = completion::pair();
        inner.sync_state.add_waiter(done);
        let _ = wait.wait();
        Ok(())
    }

    /// Wait until every submitted op has applied.
    pub fn flush(&self) -> Result<()> {
        self.inner()?.gate.wait_drained();
        Ok(())
    }

    pub fn sync_and_flush(&self) -> Result<()> {
        self.flush()?;
        self.sync()
    }

    /// Take an operator-named snapshot of `current/`.
    pub fn snapshot(&self, name: &str) -> Result<()> {
        let inner = self.inner()?;
        if !inner.stable_snapshots {
            warn!(name, "snapshot requested without snapshot commits; contents are fuzzy");
        }
        let dst = self.layout.cluster_snap_dir(name);
        // Quiesce apply so the copy observes a consistent tree.
        inner.gate.commit_start();
        let r = portable::snapshot_dir(&self.layout.current(), &dst);
        inner.gate.commit_started();
        r
    }

    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.inner()
            .map(|i| i.committed_seq.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn applied_seq(&self) -> u64 {
        self.inner().map(|i| i.gate.applied_floor()).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn exists(&self, cid: &Cid, oid: &Oid) -> bool {
        self.stat(cid, oid).is_ok()
    }

    pub fn stat(&self, cid: &Cid, oid: &Oid) -> Result<Stat> {
        use std::os::unix::fs::MetadataExt;
        let inner = self.inner()?;
        let path = inner.object_path(cid, oid)?;
        let meta = fs::metadata(path.path())?;
        Ok(Stat {
            size: meta.len(),
            nlink: meta.nlink(),
        })
    }

    /// Read up to `len` bytes at `offset`; short at end of object.
    pub fn read(&self, cid: &Cid, oid: &Oid, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let inner = self.inner()?;
        let path = inner.object_path(cid, oid)?;
        let file = File::open(path.path())?;
        let mut buf = vec![0_u8; len];
        let mut total = 0_usize;
        while total < len {
            let n = file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    /// Extent map for a byte range. Portable fallback: one extent clipped
    /// to the object size.
    pub fn fiemap(&self, cid: &Cid, oid: &Oid, offset: u64, len: u64) -> Result<Vec<(u64, u64)>> {
        let st = self.stat(cid, oid)?;
        if offset >= st.size {
            return Ok(Vec::new());
        }
        let end = (offset + len).min(st.size);
        Ok(vec![(offset, end - offset)])
    }

    pub fn getattr(&self, cid: &Cid, oid: &Oid, name: &str) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        let path = inner.object_path(cid, oid)?;
        inner.attrs.get(&path.path(), Some(oid), name)
    }

    pub fn getattrs(&self, cid: &Cid, oid: &Oid) -> Result<BTreeMap<String, Vec<u8>>> {
        let inner = self.inner()?;
        let path = inner.object_path(cid, oid)?;
        inner.attrs.get_all(&path.path(), Some(oid))
    }

    pub fn collection_getattr(&self, cid: &Cid, name: &str) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        inner.attrs.get(&self.layout.coll_dir(cid), None, name)
    }

    pub fn collection_getattrs(&self, cid: &Cid) -> Result<BTreeMap<String, Vec<u8>>> {
        let inner = self.inner()?;
        inner.attrs.get_all(&self.layout.coll_dir(cid), None)
    }

    pub fn list_collections(&self) -> Result<Vec<Cid>> {
        self.inner()?;
        let mut out = self.scan_collections()?;
        out.sort_unstable();
        Ok(out)
    }

    fn scan_collections(&self) -> Result<Vec<Cid>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.layout.current())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(cid) = Layout::parse_coll_name(&entry.file_name().to_string_lossy()) {
                out.push(cid);
            }
        }
        Ok(out)
    }

    #[must_use]
    pub fn collection_exists(&self, cid: &Cid) -> bool {
        self.layout.coll_dir(cid).is_dir()
    }

    /// True iff the collection holds no objects.
    pub fn collection_empty(&self, cid: &Cid) -> Result<bool> {
        let inner = self.inner()?;
        inner.coll_index(cid).is_empty()
    }

    pub fn collection_list(&self, cid: &Cid) -> Result<Vec<Oid>> {
        let inner = self.inner()?;
        inner.coll_index(cid).list_all()
    }

    /// Paginated listing in hash order with a restartable cursor.
    pub fn collection_list_partial(
        &self,
        cid: &Cid,
        start: Option<&Oid>,
        min: usize,
        max: usize,
    ) -> Result<(Vec<Oid>, Option<Oid>)> {
        let inner = self.inner()?;
        inner.coll_index(cid).list_partial(start, min, max)
    }

    pub fn omap_get(&self, cid: &Cid, oid: &Oid) -> Result<(Vec<u8>, BTreeMap<String, Vec<u8>>)> {
        let inner = self.inner()?;
        inner.object_path(cid, oid)?;
        inner.omap.get(oid)
    }

    pub fn omap_get_header(&self, cid: &Cid, oid: &Oid) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        inner.object_path(cid, oid)?;
        inner.omap.get_header(oid)
    }

    pub fn omap_get_keys(&self, cid: &Cid, oid: &Oid) -> Result<std::collections::BTreeSet<String>> {
        let inner = self.inner()?;
        inner.object_path(cid, oid)?;
        inner.omap.get_keys(oid)
    }

    pub fn omap_get_values(
        &self,
        cid: &Cid,
        oid: &Oid,
        keys: &std::collections::BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let inner = self.inner()?;
        inner.object_path(cid, oid)?;
        inner.omap.get_values(oid, keys)
    }

    pub fn omap_check_keys(
        &self,
        cid: &Cid,
        oid: &Oid,
        keys: &std::collections::BTreeSet<String>,
    ) -> Result<std::collections::BTreeSet<String>> {
        let inner = self.inner()?;
        inner.object_path(cid, oid)?;
        inner.omap.check_keys(oid, keys)
    }

    /// Ordered omap pairs after `after` (exclusive), the iterator surface.
    pub fn omap_iter(
        &self,
        cid: &Cid,
        oid: &Oid,
        after: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner()?;
        inner.object_path(cid, oid)?;
        inner.omap.iter_after(oid, after)
    }
}

impl Drop for DirStore {
    fn drop(&mut self) {
        if self.mounted.is_some() {
            // Best-effort clean shutdown; crash-style exits simply skip this.
            drop(self.umount());
        }
    }
}

// ---------------------------------------------------------------------------
// StoreInner plumbing
// ---------------------------------------------------------------------------

impl StoreInner {
    pub(crate) fn coll_index(&self, cid: &Cid) -> PathIndex {
        self.indexes.index(&self.layout.coll_dir(cid))
    }

    pub(crate) fn object_path(&self, cid: &Cid, oid: &Oid) -> Result<IndexedPath> {
        self.coll_index(cid)
            .lookup(oid)?
            .ok_or_else(|| StoreError::NotFound {
                what: format!("{cid}/{oid}"),
            })
    }

    pub(crate) fn open_object(
        &self,
        cid: &Cid,
        oid: &Oid,
        create: bool,
    ) -> Result<(File, IndexedPath)> {
        let index = self.coll_index(cid);
        if create {
            let slot = index.prepare_create(oid)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(slot.path())?;
            index.created(oid, &slot)?;
            Ok((file, slot))
        } else {
            let path = index.lookup(oid)?.ok_or_else(|| StoreError::NotFound {
                what: format!("{cid}/{oid}"),
            })?;
            let file = OpenOptions::new().read(true).write(true).open(path.path())?;
            Ok((file, path))
        }
    }

    pub(crate) fn open_object_trunc(&self, cid: &Cid, oid: &Oid) -> Result<(File, IndexedPath)> {
        let index = self.coll_index(cid);
        let slot = index.prepare_create(oid)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(slot.path())?;
        index.created(oid, &slot)?;
        Ok((file, slot))
    }

    /// Journal failures are structural: the pipeline cannot continue with a
    /// batch half-recorded.
    pub(crate) fn journal_write(&self, seq: u64, payload: &[u8]) {
        if let Err(e) = self.journal.submit_record(seq, payload) {
            error!(error = %e, seq, "journal write failed");
            std::process::abort();
        }
    }

    pub(crate) fn journal_flush(&self) {
        if let Err(e) = self.journal.flush() {
            error!(error = %e, "journal flush failed");
            std::process::abort();
        }
    }

    /// Apply worker body: one batch from one sequencer, in stream order.
    pub(crate) fn run_sequencer(&self, osr: &Arc<OpSequencer>) {
        let batch = {
            let _stream = osr.apply_lock.lock();
            let Some(batch) = osr.peek_ready() else {
                return;
            };
            let status = self.apply_batch(batch.seq, &batch.txns);
            osr.dequeue();
            let done = batch.on_applied.lock().take();
            self.fin_applied.queue_opt(done, status);
            batch
        };
        self.gate.op_applied(batch.seq);
        self.throttle.release(batch.ops, batch.bytes);
        // The next batch may already be journaled and waiting.
        if osr.peek_ready().is_some() {
            self.work.queue(Arc::clone(osr));
        }
    }

    /// Replay journaled batches newer than `committed`. Returns the highest
    /// sequence replayed.
    pub(crate) fn journal_replay(&self, committed: u64) -> Result<u64> {
        let records = self.journal.replay()?;
        let mut last = 0_u64;
        if records.is_empty() {
            debug!("journal replay: nothing to do");
            return Ok(last);
        }
        self.replaying.store(true, Ordering::Release);
        info!(records = records.len(), committed, "journal replay starting");
        for rec in records {
            if rec.seq <= committed {
                continue;
            }
            let txns = decode_batch(&rec.payload).map_err(|e| {
                error!(seq = rec.seq, error = %e, "journal record failed to decode");
                StoreError::Corrupt {
                    detail: format!("journal record {}: {e}", rec.seq),
                }
            })?;
            let status = self.apply_batch(rec.seq, &txns);
            debug!(seq = rec.seq, status, "replayed journal record");
            Metrics::inc(&self.cx.metrics().journal_records_replayed);
            last = rec.seq;
        }
        self.replaying.store(false, Ordering::Release);
        info!(last, "journal replay finished");
        Ok(last)
    }
}

// ---------------------------------------------------------------------------
// Identity helpers
// ---------------------------------------------------------------------------

/// Fill `buf` with random bytes: /dev/urandom, with a deterministic
/// xorshift fallback for hermetic environments.
fn random_bytes(buf: &mut [u8]) {
    use std::sync::atomic::AtomicU64 as Counter;
    static FALLBACK_SEQ: Counter = Counter::new(0);

    if let Ok(mut f) = File::open("/dev/urandom") {
        if f.read_exact(buf).is_ok() {
            return;
        }
    }

    let seq = FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15 ^ seq.wrapping_mul(0x5DEE_CE66_D1A4_F681);
    for chunk in buf.chunks_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        for (dst, src) in chunk.iter_mut().zip(state.to_le_bytes()) {
            *dst = src;
        }
    }
}

/// Generate a fresh store identity: a version-4 uuid in its 36-byte text
/// form.
fn generate_fsid() -> [u8; 36] {
    let mut raw = [0_u8; 16];
    random_bytes(&mut raw);
    raw[6] = (raw[6] & 0x0f) | 0x40;
    raw[8] = (raw[8] & 0x3f) | 0x80;

    let hex: Vec<u8> = raw.iter().flat_map(|b| format!("{b:02x}").into_bytes()).collect();
    let mut out = [0_u8; 36];
    let groups = [(0_usize, 8_usize), (8, 4), (12, 4), (16, 4), (20, 12)];
    let mut pos = 0;
    for (i, (start, len)) in groups.into_iter().enumerate() {
        if i > 0 {
            out[pos] = b'-';
            pos += 1;
        }
        out[pos..pos + len].copy_from_slice(&hex[start..start + len]);
        pos += len;
    }
    out
}

fn read_fsid(path: &Path) -> Result<[u8; 36]> {
    let raw = fs::read(path)?;
    if raw.len() < 36 {
        return Err(StoreError::Corrupt {
            detail: format!("fsid file holds {} bytes, want 36", raw.len()),
        });
    }
    let mut out = [0_u8; 36];
    out.copy_from_slice(&raw[..36]);
    Ok(out)
}

fn read_version(path: &Path) -> Result<u32> {
    let raw = fs::read(path)?;
    if raw.len() < 4 {
        return Err(StoreError::Corrupt {
            detail: "short store_version file".to_owned(),
        });
    }
    Ok(u32::from_le_bytes(raw[..4].try_into().expect("4 bytes")))
}

fn read_op_seq(path: &Path) -> Result<u64> {
    let raw = fs::read_to_string(path)?;
    raw.trim().parse().map_err(|_| StoreError::Corrupt {
        detail: format!("unparseable committed seq: {raw:?}"),
    })
}

fn scan_snapshots(layout: &Layout) -> Result<(Vec<u64>, Vec<String>)> {
    let mut snaps = Vec::new();
    let mut cluster = Vec::new();
    for entry in fs::read_dir(layout.base())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(seq) = Layout::parse_snap_name(&name) {
            snaps.push(seq);
        } else if let Some(n) = Layout::parse_cluster_snap_name(&name) {
            cluster.push(n);
        }
    }
    snaps.sort_unstable();
    Ok((snaps, cluster))
}
