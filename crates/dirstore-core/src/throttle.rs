//! Admission throttle on queued ops and bytes.
//!
//! Waiters are served strictly oldest-first: each reservation takes a ticket
//! and proceeds only when its ticket is at the head and the budgets fit. The
//! budgets grow by the committing allowance while a commit is in flight so
//! the committer can never deadlock against a full queue, and a single op
//! larger than the whole byte budget is admitted once the queue is empty
//! (it would otherwise be unschedulable).

use std::sync::Arc;

use dirstore_types::context::Metrics;
use dirstore_types::CoreContext;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    ops: u64,
    bytes: u64,
    next_ticket: u64,
    serving: u64,
    committing: bool,
}

pub(crate) struct Throttle {
    cx: Arc<CoreContext>,
    state: Mutex<State>,
    cond: Condvar,
}

impl Throttle {
    pub fn new(cx: Arc<CoreContext>) -> Self {
        Self {
            cx,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    fn limits(&self, committing: bool) -> (u64, u64) {
        let cfg = self.cx.config();
        if committing {
            (
                cfg.queue_max_ops + cfg.queue_committing_max_ops,
                cfg.queue_max_bytes + cfg.queue_committing_max_bytes,
            )
        } else {
            (cfg.queue_max_ops, cfg.queue_max_bytes)
        }
    }

    /// Block until `ops`/`bytes` fit, then reserve them.
    pub fn reserve(&self, ops: u64, bytes: u64) {
        let mut st = self.state.lock();
        let ticket = st.next_ticket;
        st.next_ticket += 1;

        let mut waited = false;
        loop {
            let (max_ops, max_bytes) = self.limits(st.committing);
            let ops_fit = max_ops == 0 || st.ops + ops <= max_ops;
            // An oversized op squeaks through while nothing else is queued.
            let bytes_fit = max_bytes == 0 || st.bytes == 0 || st.bytes + bytes <= max_bytes;
            if st.serving == ticket && ops_fit && bytes_fit {
                break;
            }
            if !waited {
                debug!(
                    count = st.ops,
                    bytes = st.bytes,
                    max_ops,
                    max_bytes,
                    "throttle waiting"
                );
                Metrics::inc(&self.cx.metrics().throttle_waits);
                waited = true;
            }
            self.cond.wait(&mut st);
        }

        st.serving += 1;
        st.ops += ops;
        st.bytes += bytes;
        if waited {
            debug!(count = st.ops, bytes = st.bytes, "throttle admitted after wait");
        }
        // Wake the next ticket holder.
        self.cond.notify_all();
    }

    /// Return a reservation.
    pub fn release(&self, ops: u64, bytes: u64) {
        let mut st = self.state.lock();
        st.ops = st.ops.saturating_sub(ops);
        st.bytes = st.bytes.saturating_sub(bytes);
        self.cond.notify_all();
    }

    /// Widen the budgets while a commit is in flight.
    pub fn set_committing(&self, committing: bool) {
        let mut st = self.state.lock();
        st.committing = committing;
        self.cond.notify_all();
    }

    #[cfg(test)]
    fn queued(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.ops, st.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_types::StoreConfig;
    use std::time::Duration;

    fn throttle(max_ops: u64, max_bytes: u64) -> Arc<Throttle> {
        let cfg = StoreConfig {
            queue_max_ops: max_ops,
            queue_max_bytes: max_bytes,
            queue_committing_max_ops: max_ops,
            queue_committing_max_bytes: max_bytes,
            ..StoreConfig::default()
        };
        Arc::new(Throttle::new(Arc::new(CoreContext::new(cfg))))
    }

    #[test]
    fn test_reserve_release() {
        let t = throttle(10, 1000);
        t.reserve(1, 100);
        t.reserve(2, 200);
        assert_eq!(t.queued(), (3, 300));
        t.release(3, 300);
        assert_eq!(t.queued(), (0, 0));
    }

    #[test]
    fn test_blocks_until_release() {
        let t = throttle(2, 0);
        t.reserve(2, 0);

        let t2 = Arc::clone(&t);
        let waiter = std::thread::spawn(move || {
            t2.reserve(1, 0);
            t2.release(1, 0);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished(), "reserve should block while full");
        t.release(2, 0);
        waiter.join().unwrap();
    }

    #[test]
    fn test_oversized_single_op_admitted_when_empty() {
        let t = throttle(0, 100);
        // 500 > 100 but the queue is empty, so it must not deadlock.
        t.reserve(1, 500);
        assert_eq!(t.queued(), (1, 500));
        t.release(1, 500);
    }

    #[test]
    fn test_oversized_waits_behind_queued_bytes() {
        let t = throttle(0, 100);
        t.reserve(1, 50);
        let t2 = Arc::clone(&t);
        let waiter = std::thread::spawn(move || t2.reserve(1, 500));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        t.release(1, 50);
        waiter.join().unwrap();
        assert_eq!(t.queued(), (1, 500));
    }

    #[test]
    fn test_committing_allowance_unblocks() {
        let t = throttle(2, 0);
        t.reserve(2, 0);
        let t2 = Arc::clone(&t);
        let waiter = std::thread::spawn(move || t2.reserve(1, 0));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        // Doubled limit while committing lets the waiter through.
        t.set_committing(true);
        waiter.join().unwrap();
        t.release(3, 0);
    }

    #[test]
    fn test_fifo_order_of_waiters() {
        let t = throttle(1, 0);
        t.reserve(1, 0);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let t2 = Arc::clone(&t);
            let order2 = Arc::clone(&order);
            handles.push(std::thread::spawn(move || {
                t2.reserve(1, 0);
                order2.lock().push(i);
                t2.release(1, 0);
            }));
            // Stagger arrival so ticket order matches spawn order.
            std::thread::sleep(Duration::from_millis(30));
        }

        t.release(1, 0);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
