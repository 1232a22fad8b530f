//! Deferred write-out of large writes.
//!
//! Big writes hand their descriptor to a background thread that starts
//! page write-out early (`sync_file_range`), so the commit cycle's
//! filesystem sync finds less dirty data. Entries are tagged with the sync
//! epoch at queue time; the committer bumps the epoch when a cycle starts,
//! which cancels flushes for data the imminent sync will cover anyway.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dirstore_error::StoreError;
use dirstore_fs::portable;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

struct FlushItem {
    file: File,
    offset: u64,
    len: u64,
    epoch: u64,
}

struct Shared {
    queue: Mutex<VecDeque<FlushItem>>,
    cond: Condvar,
    epoch: AtomicU64,
    stop: AtomicBool,
    max_queue: usize,
}

/// Queueing handle shared with the write path and the committer.
#[derive(Clone)]
pub(crate) struct Flusher {
    shared: Arc<Shared>,
}

pub(crate) struct FlusherThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    pub fn start(max_queue: usize) -> (FlusherThread, Self) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            epoch: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            max_queue: max_queue.max(1),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("dirstore-flusher".to_owned())
            .spawn(move || flusher_entry(&thread_shared))
            .expect("spawn flusher thread");
        (
            FlusherThread {
                shared: Arc::clone(&shared),
                handle: Some(handle),
            },
            Self { shared },
        )
    }

    /// Queue a range for deferred write-out. Returns false (and does
    /// nothing) when the queue is full; the commit-time sync covers the
    /// range regardless.
    pub fn queue(&self, file: File, offset: u64, len: u64) -> bool {
        let mut q = self.shared.queue.lock();
        if q.len() >= self.shared.max_queue {
            return false;
        }
        q.push_back(FlushItem {
            file,
            offset,
            len,
            epoch: self.shared.epoch.load(Ordering::Acquire),
        });
        self.shared.cond.notify_one();
        true
    }

    /// New sync epoch: pending flushes queued under older epochs are
    /// dropped when popped, since the imminent filesystem sync covers them.
    pub fn advance_epoch(&self) -> u64 {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl FlusherThread {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        if let Some(h) = self.handle.take() {
            drop(h.join());
        }
    }
}

impl Drop for FlusherThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flusher_entry(shared: &Shared) {
    let mut q = shared.queue.lock();
    loop {
        while let Some(item) = q.pop_front() {
            drop(q);
            if item.epoch == shared.epoch.load(Ordering::Acquire) {
                match portable::sync_file_range_write(&item.file, item.offset, item.len) {
                    Ok(()) | Err(StoreError::Unsupported) => {}
                    Err(e) => debug!(error = %e, "deferred flush failed"),
                }
            }
            q = shared.queue.lock();
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        shared.cond.wait(&mut q);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch(dir: &std::path::Path) -> File {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(dir.join("f"))
            .unwrap();
        f.write_all(&[0xaa; 8192]).unwrap();
        f
    }

    #[test]
    fn test_queue_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        let (thread, flusher) = Flusher::start(16);
        for _ in 0..8 {
            let f = scratch(dir.path());
            assert!(flusher.queue(f, 0, 8192));
        }
        // Queue drains without the committer's help.
        for _ in 0..100 {
            if flusher.shared.queue.lock().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(flusher.shared.queue.lock().is_empty());
        thread.stop();
    }

    #[test]
    fn test_queue_bound() {
        let dir = tempfile::tempdir().unwrap();
        let (thread, flusher) = Flusher::start(1);
        // Park the thread by filling while it sleeps; at least one entry
        // must be refused at bound 1 when pushed back-to-back.
        let a = scratch(dir.path());
        let b = scratch(dir.path());
        let first = flusher.queue(a, 0, 8192);
        let second = flusher.queue(b, 0, 8192);
        assert!(first);
        // Either the thread already drained the first entry (second fits)
        // or the bound rejected it; both are legal, never a block.
        let _ = second;
        thread.stop();
    }

    #[test]
    fn test_epoch_advances() {
        let (thread, flusher) = Flusher::start(4);
        let e1 = flusher.advance_epoch();
        let e2 = flusher.advance_epoch();
        assert!(e2 > e1);
        thread.stop();
    }
}
