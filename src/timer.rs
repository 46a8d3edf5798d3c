//! Deadline expiry for suspended waiters.
//!
//! A blocking waiter enforces its own deadline from inside
//! `park_timeout`, but a suspended task has no thread to do that, so
//! finite-deadline async waiters are registered here. One shared driver
//! thread, spawned on first use, sleeps until the earliest registered
//! deadline and resolves expired waiters.
//!
//! The heap holds weak references only: a waiter that was granted (or
//! whose future was dropped) leaves a stale entry behind, which the
//! driver discards when it surfaces. That keeps the common
//! completes-before-deadline case free of any deregistration cost.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use crate::mutex::WaitNode;

struct TimerEntry {
    deadline: Instant,
    /// Tiebreaker so equal deadlines fire in registration order.
    generation: u64,
    node: Weak<WaitNode>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerHeap {
    entries: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

impl TimerHeap {
    fn insert(&mut self, deadline: Instant, node: Weak<WaitNode>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.push(TimerEntry {
            deadline,
            generation,
            node,
        });
    }

    fn peek_deadline(&self) -> Option<Instant> {
        self.entries.peek().map(|entry| entry.deadline)
    }

    /// Drains entries due at `now` into `expired`, skipping waiters that
    /// no longer exist.
    fn pop_expired(&mut self, now: Instant, expired: &mut Vec<Arc<WaitNode>>) {
        while let Some(entry) = self.entries.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.entries.pop() {
                if let Some(node) = entry.node.upgrade() {
                    expired.push(node);
                }
            }
        }
    }
}

struct DriverShared {
    heap: ParkingMutex<TimerHeap>,
    /// Signalled when a registration moves the earliest deadline up.
    tick: Condvar,
}

/// Handle to the shared expiry thread.
pub(crate) struct TimerDriver {
    shared: Arc<DriverShared>,
}

/// The process-wide driver, spawning its thread on first use. The
/// uncontended and infinite-deadline paths never call this.
pub(crate) fn driver() -> &'static TimerDriver {
    static DRIVER: OnceLock<TimerDriver> = OnceLock::new();
    DRIVER.get_or_init(TimerDriver::start)
}

impl TimerDriver {
    fn start() -> Self {
        let shared = Arc::new(DriverShared {
            heap: ParkingMutex::new(TimerHeap::default()),
            tick: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("hybrid-mutex-timer".into())
            .spawn(move || Self::run(&worker))
            .expect("failed to spawn timer thread");
        Self { shared }
    }

    /// Schedules `node` to be expired at `deadline` unless it resolves
    /// first.
    pub(crate) fn register(&self, deadline: Instant, node: &Arc<WaitNode>) {
        let mut heap = self.shared.heap.lock();
        let moved_front = heap.peek_deadline().is_none_or(|front| deadline < front);
        heap.insert(deadline, Arc::downgrade(node));
        drop(heap);
        if moved_front {
            self.shared.tick.notify_one();
        }
    }

    fn run(shared: &DriverShared) {
        let mut expired = Vec::new();
        loop {
            {
                let mut heap = shared.heap.lock();
                heap.pop_expired(Instant::now(), &mut expired);
                if expired.is_empty() {
                    match heap.peek_deadline() {
                        Some(at) => {
                            let _ = shared.tick.wait_until(&mut heap, at);
                        }
                        None => shared.tick.wait(&mut heap),
                    }
                }
            }
            // Expiry takes the waiter's queue lock and invokes its waker;
            // both happen with the heap lock released.
            for node in expired.drain(..) {
                node.expire();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HybridMutex, Timeout};
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll, Waker};
    use std::thread;
    use std::time::Duration;

    fn poll_is_pending(fut: &mut crate::Acquire<'_>) -> bool {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx).is_pending()
    }

    #[test]
    fn heap_orders_by_deadline_then_generation() {
        let mut heap = TimerHeap::default();
        let now = Instant::now();
        heap.insert(now + Duration::from_millis(30), Weak::new());
        heap.insert(now + Duration::from_millis(10), Weak::new());
        heap.insert(now + Duration::from_millis(20), Weak::new());

        assert_eq!(heap.peek_deadline(), Some(now + Duration::from_millis(10)));
    }

    #[test]
    fn pop_expired_drains_due_entries_only() {
        let mut heap = TimerHeap::default();
        let now = Instant::now();
        heap.insert(now, Weak::new());
        heap.insert(now + Duration::from_secs(60), Weak::new());

        let mut expired = Vec::new();
        heap.pop_expired(now, &mut expired);

        // Both dead weak refs are skipped, but only the due entry is popped.
        assert!(expired.is_empty());
        assert_eq!(heap.peek_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn driver_expires_registered_waiter() {
        let mutex = HybridMutex::new(Timeout::Never);
        let held = mutex.try_wait();
        assert!(held.is_valid());

        // Registration happens inside try_wait_async_for.
        let mut fut = mutex.try_wait_async_for(Timeout::After(Duration::from_millis(20)));
        assert!(poll_is_pending(&mut fut));

        thread::sleep(Duration::from_millis(120));
        assert!(fut.is_complete(), "driver should have expired the waiter");
        assert_eq!(mutex.waiters(), 0, "expired waiter unlinked by the driver");
    }

    #[test]
    fn earlier_registration_preempts_later_deadline() {
        let mutex = HybridMutex::new(Timeout::Never);
        let held = mutex.try_wait();

        // A long deadline first, then a short one: the driver must re-arm
        // for the short one instead of sleeping out the long one.
        let mut slow = mutex.try_wait_async_for(Timeout::After(Duration::from_secs(30)));
        let mut fast = mutex.try_wait_async_for(Timeout::After(Duration::from_millis(20)));
        assert!(poll_is_pending(&mut slow));
        assert!(poll_is_pending(&mut fast));

        thread::sleep(Duration::from_millis(150));
        assert!(fast.is_complete(), "short deadline should fire promptly");
        assert!(!slow.is_complete(), "long deadline must still be pending");
        drop(held);
    }
}
