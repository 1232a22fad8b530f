//! One-shot completion channels and the finisher threads that fire them.
//!
//! Submitters receive typed channel halves instead of registering callbacks:
//! the store fires the send half with an integer status, the submitter waits
//! on the receive half. Dedicated finisher threads do the firing so a slow
//! consumer can never stall an apply worker or the journal ack path.

use std::sync::mpsc;
use std::thread::JoinHandle;

use tracing::debug;

/// Send half of a one-shot completion. Firing never blocks.
#[derive(Debug)]
pub struct Done(mpsc::SyncSender<i32>);

/// Receive half of a one-shot completion.
#[derive(Debug)]
pub struct Wait(mpsc::Receiver<i32>);

/// Create a connected completion pair.
#[must_use]
pub fn pair() -> (Done, Wait) {
    // Buffer of one: `complete` succeeds even if nobody is waiting yet.
    let (tx, rx) = mpsc::sync_channel(1);
    (Done(tx), Wait(rx))
}

impl Done {
    /// Fire the completion. A dropped waiter is fine.
    pub fn complete(self, status: i32) {
        drop(self.0.try_send(status));
    }
}

impl Wait {
    /// Block until the completion fires. A store that dropped the send half
    /// without firing reports `-EIO`.
    #[must_use]
    pub fn wait(self) -> i32 {
        self.0.recv().unwrap_or(-5)
    }

    /// Non-blocking poll.
    #[must_use]
    pub fn try_wait(&self) -> Option<i32> {
        self.0.try_recv().ok()
    }
}

enum Item {
    Fire(Done, i32),
    Stop,
}

/// A thread that fires queued completions in order.
pub(crate) struct Finisher {
    tx: mpsc::Sender<Item>,
    handle: Option<JoinHandle<()>>,
    name: &'static str,
}

/// Cloneable queueing handle for a [`Finisher`].
#[derive(Clone)]
pub(crate) struct FinisherHandle {
    tx: mpsc::Sender<Item>,
}

impl FinisherHandle {
    /// Queue a completion; fired asynchronously by the finisher thread.
    pub fn queue(&self, done: Done, status: i32) {
        if let Err(mpsc::SendError(Item::Fire(done, status))) =
            self.tx.send(Item::Fire(done, status))
        {
            // Finisher already stopped (shutdown path): fire inline.
            debug!("finisher stopped, completing inline");
            done.complete(status);
        }
    }

    pub fn queue_opt(&self, done: Option<Done>, status: i32) {
        if let Some(done) = done {
            self.queue(done, status);
        }
    }
}

impl Finisher {
    pub fn start(name: &'static str) -> (Self, FinisherHandle) {
        let (tx, rx) = mpsc::channel::<Item>();
        let handle = std::thread::Builder::new()
            .name(format!("dirstore-{name}"))
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    match item {
                        Item::Fire(done, status) => done.complete(status),
                        Item::Stop => break,
                    }
                }
            })
            .expect("spawn finisher thread");
        (
            Self {
                tx: tx.clone(),
                handle: Some(handle),
                name,
            },
            FinisherHandle { tx },
        )
    }

    /// Drain and join. Completions queued before the stop still fire, in
    /// order; the sentinel lets the thread exit even while queueing handles
    /// are still held elsewhere.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.tx.send(Item::Stop));
        if let Some(h) = self.handle.take() {
            drop(h.join());
        }
        debug!(name = self.name, "finisher stopped");
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_completes() {
        let (done, wait) = pair();
        done.complete(0);
        assert_eq!(wait.wait(), 0);
    }

    #[test]
    fn test_complete_before_wait_does_not_block() {
        let (done, wait) = pair();
        done.complete(-2);
        // Still delivered after the fact.
        assert_eq!(wait.wait(), -2);
    }

    #[test]
    fn test_dropped_done_reports_eio() {
        let (done, wait) = pair();
        drop(done);
        assert_eq!(wait.wait(), -5);
    }

    #[test]
    fn test_try_wait() {
        let (done, wait) = pair();
        assert_eq!(wait.try_wait(), None);
        done.complete(7);
        assert_eq!(wait.try_wait(), Some(7));
    }

    #[test]
    fn test_finisher_fires_in_order() {
        let (fin, handle) = Finisher::start("test");
        let mut waits = Vec::new();
        for i in 0..10 {
            let (done, wait) = pair();
            handle.queue(done, i);
            waits.push(wait);
        }
        for (i, wait) in waits.into_iter().enumerate() {
            assert_eq!(wait.wait(), i32::try_from(i).unwrap());
        }
        drop(handle);
        fin.stop();
    }
}
