//! Thread parking for blocking waiters.
//!
//! Each blocking waiter owns a [`Parker`]; the releasing side calls
//! [`Parker::unpark`] to deliver exactly one wake permit. A permit
//! delivered before the waiter parks makes the next park return
//! immediately, so an unpark can never be lost to a park/unpark race.
//!
//! Spurious condvar wakeups are permitted here; callers re-check their
//! waiter state in a loop.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct Parker {
    /// Wake permit. Set by `unpark`, consumed by `park`/`park_timeout`.
    notified: AtomicBool,
    mutex: ParkingMutex<()>,
    cvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            mutex: ParkingMutex::new(()),
            cvar: Condvar::new(),
        }
    }

    #[inline]
    fn consume_permit(&self) -> bool {
        self.notified
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Parks the current thread until a permit is delivered.
    pub(crate) fn park(&self) {
        if self.consume_permit() {
            return;
        }
        let mut guard = self.mutex.lock();
        while !self.consume_permit() {
            self.cvar.wait(&mut guard);
        }
    }

    /// Parks the current thread until a permit is delivered or the
    /// duration elapses, whichever comes first.
    pub(crate) fn park_timeout(&self, duration: Duration) {
        if self.consume_permit() {
            return;
        }
        if duration.is_zero() {
            return;
        }
        let mut guard = self.mutex.lock();
        let _ = self
            .cvar
            .wait_while_for(&mut guard, |()| !self.consume_permit(), duration);
    }

    /// Delivers a wake permit, waking the parked thread if there is one.
    ///
    /// Fast path: if a permit is already pending the swap returns `true`
    /// and the mutex and condvar are skipped entirely. Taking the mutex in
    /// the slow path pins the parking thread between its permit check and
    /// its condvar wait, so the notify cannot fall into that window.
    pub(crate) fn unpark(&self) {
        if self.notified.swap(true, Ordering::Release) {
            return;
        }
        let _guard = self.mutex.lock();
        self.cvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn unpark_before_park_returns_immediately() {
        let parker = Parker::new();
        parker.unpark();

        let start = Instant::now();
        parker.park();
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "pre-delivered permit should make park return immediately"
        );
    }

    #[test]
    fn permit_is_consumed_by_park() {
        let parker = Arc::new(Parker::new());
        parker.unpark();
        parker.unpark();

        // First park consumes the single permit.
        parker.park();

        // Second park must block until a fresh unpark.
        let p = Arc::clone(&parker);
        let blocked = Arc::new(AtomicBool::new(true));
        let b = Arc::clone(&blocked);
        let handle = thread::spawn(move || {
            p.park();
            b.store(false, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(
            blocked.load(Ordering::SeqCst),
            "second park should block (permit consumed)"
        );

        parker.unpark();
        handle.join().expect("parked thread should complete");
    }

    #[test]
    fn park_timeout_expires() {
        let parker = Parker::new();

        let start = Instant::now();
        parker.park_timeout(Duration::from_millis(50));
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(40),
            "timeout should wait at least 40ms, waited {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_millis(500),
            "timeout should not wait too long, waited {elapsed:?}"
        );
    }

    #[test]
    fn park_timeout_interrupted_by_unpark() {
        let parker = Arc::new(Parker::new());

        let p = Arc::clone(&parker);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            p.park_timeout(Duration::from_secs(10));
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(20));
        parker.unpark();

        let elapsed = handle.join().expect("parked thread should complete");
        assert!(
            elapsed < Duration::from_millis(500),
            "unpark should interrupt the timeout, waited {elapsed:?}"
        );
    }

    #[test]
    fn zero_duration_park_timeout_returns() {
        let parker = Parker::new();
        let start = Instant::now();
        parker.park_timeout(Duration::ZERO);
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
