//! Sequencer streams and the apply worker pool.
//!
//! A sequencer is a named FIFO of in-flight batches. Workers take a
//! *sequencer reference* off the ready queue, hold that sequencer's apply
//! mutex for exactly one batch, and run the store's apply function, so order
//! within a stream is strict while independent streams apply in parallel.
//!
//! In write-ahead mode a batch is enqueued (to pin its place in the stream)
//! before the journal acknowledges it; the `journaled` flag keeps workers
//! off it until the ack lands.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dirstore_types::Transaction;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::completion::Done;

/// One submitted batch travelling through journal and apply.
pub(crate) struct OpBatch {
    pub seq: u64,
    pub txns: Vec<Transaction>,
    pub ops: u64,
    pub bytes: u64,
    /// Write-ahead gate: workers skip the batch until the journal ack.
    journaled: AtomicBool,
    pub on_applied: Mutex<Option<Done>>,
}

impl OpBatch {
    pub fn new(seq: u64, txns: Vec<Transaction>, on_applied: Option<Done>) -> Arc<Self> {
        let ops = txns.iter().map(Transaction::num_ops).sum();
        let bytes = txns.iter().map(Transaction::num_bytes).sum();
        Arc::new(Self {
            seq,
            txns,
            ops,
            bytes,
            journaled: AtomicBool::new(false),
            on_applied: Mutex::new(on_applied),
        })
    }

    pub fn mark_journaled(&self) {
        self.journaled.store(true, Ordering::Release);
    }

    pub fn is_journaled(&self) -> bool {
        self.journaled.load(Ordering::Acquire)
    }
}

/// Per-stream state. One exists per live [`Sequencer`] handle.
pub(crate) struct OpSequencer {
    pub name: String,
    q: Mutex<VecDeque<Arc<OpBatch>>>,
    /// Held by a worker for the duration of one batch's apply.
    pub apply_lock: Mutex<()>,
}

impl OpSequencer {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            q: Mutex::new(VecDeque::new()),
            apply_lock: Mutex::new(()),
        })
    }

    pub fn queue(&self, batch: Arc<OpBatch>) {
        self.q.lock().push_back(batch);
    }

    /// Head batch if it is ready to apply.
    pub fn peek_ready(&self) -> Option<Arc<OpBatch>> {
        let q = self.q.lock();
        q.front().filter(|b| b.is_journaled()).cloned()
    }

    pub fn dequeue(&self) -> Option<Arc<OpBatch>> {
        self.q.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }
}

/// Public handle naming a stream. Cheap to clone; all clones share the
/// stream's FIFO.
#[derive(Clone)]
pub struct Sequencer {
    pub(crate) inner: Arc<OpSequencer>,
}

impl Sequencer {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: OpSequencer::new(name.into()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new("default")
    }
}

// ---------------------------------------------------------------------------
// Ready queue + worker pool
// ---------------------------------------------------------------------------

/// FIFO of sequencers with ready work.
pub(crate) struct WorkQueue {
    ready: Mutex<VecDeque<Arc<OpSequencer>>>,
    cond: Condvar,
    stop: AtomicBool,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
        })
    }

    pub fn queue(&self, osr: Arc<OpSequencer>) {
        self.ready.lock().push_back(osr);
        self.cond.notify_one();
    }

    /// Next sequencer with work, or `None` once stopped and drained.
    fn take(&self) -> Option<Arc<OpSequencer>> {
        let mut ready = self.ready.lock();
        loop {
            if let Some(osr) = ready.pop_front() {
                return Some(osr);
            }
            if self.stop.load(Ordering::Acquire) {
                return None;
            }
            self.cond.wait(&mut ready);
        }
    }

    /// Stop workers after the queue drains.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ready.lock().len()
    }
}

/// Fixed-width apply thread pool.
pub(crate) struct ApplyPool {
    handles: Vec<JoinHandle<()>>,
}

impl ApplyPool {
    /// Start `width` workers draining `wq` through `work`.
    pub fn start<F>(width: usize, wq: &Arc<WorkQueue>, work: F) -> Self
    where
        F: Fn(&Arc<OpSequencer>) + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(width);
        for i in 0..width.max(1) {
            let wq = Arc::clone(wq);
            let work = Arc::clone(&work);
            let handle = std::thread::Builder::new()
                .name(format!("dirstore-apply-{i}"))
                .spawn(move || {
                    while let Some(osr) = wq.take() {
                        work(&osr);
                    }
                    debug!(worker = i, "apply worker exiting");
                })
                .expect("spawn apply worker");
            handles.push(handle);
        }
        Self { handles }
    }

    /// Join every worker. Call [`WorkQueue::shutdown`] first.
    pub fn join(self) {
        for h in self.handles {
            drop(h.join());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn batch(seq: u64) -> Arc<OpBatch> {
        OpBatch::new(seq, vec![Transaction::new()], None)
    }

    #[test]
    fn test_batch_accounting() {
        let mut t = Transaction::new();
        t.write(
            dirstore_types::Cid::new("c"),
            dirstore_types::Oid::new("o"),
            0,
            vec![0; 7],
        );
        let b = OpBatch::new(1, vec![t, Transaction::new()], None);
        assert_eq!(b.ops, 1);
        assert_eq!(b.bytes, 7);
    }

    #[test]
    fn test_peek_respects_journal_gate() {
        let s = Sequencer::new("s");
        let b = batch(1);
        s.inner.queue(Arc::clone(&b));
        assert!(s.inner.peek_ready().is_none(), "unjournaled head is not ready");
        b.mark_journaled();
        assert_eq!(s.inner.peek_ready().unwrap().seq, 1);
    }

    #[test]
    fn test_pool_preserves_stream_order() {
        let wq = WorkQueue::new();
        let applied: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));

        let applied2 = Arc::clone(&applied);
        let pool = ApplyPool::start(4, &wq, move |osr| {
            let _guard = osr.apply_lock.lock();
            let Some(b) = osr.peek_ready() else { return };
            // Jitter to tempt reordering.
            std::thread::sleep(Duration::from_millis(b.seq % 3));
            applied2.lock().push((osr.name.clone(), b.seq));
            osr.dequeue();
        });

        let streams: Vec<Sequencer> = (0..3).map(|i| Sequencer::new(format!("s{i}"))).collect();
        let mut seq = 0_u64;
        for round in 0..10 {
            for s in &streams {
                seq += 1;
                let b = batch(seq);
                b.mark_journaled();
                s.inner.queue(Arc::clone(&b));
                wq.queue(Arc::clone(&s.inner));
                let _ = round;
            }
        }

        // Let the pool drain, then stop it.
        while streams.iter().any(|s| !s.inner.is_empty()) {
            std::thread::sleep(Duration::from_millis(10));
        }
        wq.shutdown();
        pool.join();

        let log = applied.lock();
        for s in &streams {
            let seqs: Vec<u64> = log
                .iter()
                .filter(|(name, _)| name == s.name())
                .map(|(_, q)| *q)
                .collect();
            let mut sorted = seqs.clone();
            sorted.sort_unstable();
            assert_eq!(seqs, sorted, "stream {} applied out of order", s.name());
        }
        assert_eq!(log.len(), 30);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let wq = WorkQueue::new();
        let count = Arc::new(Mutex::new(0_usize));
        let count2 = Arc::clone(&count);
        let pool = ApplyPool::start(2, &wq, move |_osr| {
            *count2.lock() += 1;
        });
        for _ in 0..5 {
            wq.queue(OpSequencer::new("x".to_owned()));
        }
        wq.shutdown();
        pool.join();
        assert_eq!(*count.lock(), 5, "queued refs must be drained before exit");
        assert_eq!(wq.len(), 0);
    }
}
