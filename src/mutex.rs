//! Hybrid blocking/async mutex with deadline-aware acquisition.
//!
//! [`HybridMutex`] serves two kinds of callers from one FIFO waiter queue:
//! threads that park ([`HybridMutex::try_wait`]) and async tasks that
//! suspend ([`HybridMutex::try_wait_async`]). Both paths share the same
//! uncontended fast path — a single compare-and-exchange on the ownership
//! flag — which allocates nothing and never touches the queue or the timer.
//!
//! # Fairness
//!
//! Queued waiters are granted the lock strictly in arrival order; a release
//! hands ownership directly to the head waiter with no intermediate free
//! state, so a queued waiter cannot be overtaken by another queued waiter.
//! A caller hitting the fast path while the queue is empty may still win
//! against a concurrently enqueuing waiter; that race is the accepted cost
//! of keeping the fast path lock-free.
//!
//! # Timeouts
//!
//! Acquisition never returns an error: an expired deadline surfaces as an
//! invalid [`Token`], so hot-path callers branch on a bool rather than
//! unwinding. Each waiter reaches exactly one of two terminal states —
//! granted or timed out — even when a release and a deadline expiry race.
//!
//! # Reentrancy
//!
//! Not supported and not detected. A thread or task that already holds the
//! lock and acquires again blocks until its deadline elapses (or forever).

use parking_lot::Mutex as ParkingMutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use crate::deadline::{Deadline, Timeout};
use crate::park::Parker;
use crate::timer;

/// Waiter lifecycle: `QUEUED` transitions exactly once, to either
/// `GRANTED` (release hand-off) or `TIMED_OUT` (deadline expiry or
/// abandoned future). Both are terminal.
pub(crate) const QUEUED: u8 = 0;
pub(crate) const GRANTED: u8 = 1;
pub(crate) const TIMED_OUT: u8 = 2;

/// A mutex acquirable from both blocking threads and async tasks.
///
/// Constructed with a default [`Timeout`] that applies to
/// [`try_wait`](Self::try_wait) and [`try_wait_async`](Self::try_wait_async);
/// the `*_for` variants replace the default for that call.
///
/// # Example
///
/// ```
/// use hybrid_mutex::{HybridMutex, Timeout};
/// use std::time::Duration;
///
/// let mutex = HybridMutex::new(Timeout::After(Duration::from_millis(500)));
///
/// let token = mutex.try_wait();
/// assert!(token.is_valid());
/// drop(token); // released here
///
/// assert!(mutex.try_wait().is_valid());
/// ```
pub struct HybridMutex {
    /// Ownership flag. `true` from a successful acquisition until a
    /// release finds the waiter queue empty; a release that hands off to
    /// a waiter leaves it set.
    owned: AtomicBool,
    /// Waiter queue. The lock is held only to update the queue, never
    /// across a park or a wake.
    queue: Arc<ParkingMutex<WaitState>>,
    default_timeout: Timeout,
}

struct WaitState {
    waiters: VecDeque<Arc<WaitNode>>,
    next_waiter_id: u64,
}

impl WaitState {
    /// Removes the waiter with the given id. Returns whether it was
    /// still queued.
    fn remove(&mut self, id: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|node| node.id != id);
        before != self.waiters.len()
    }
}

/// One queued acquisition request.
///
/// The resume capability is a tagged variant rather than a trait object:
/// the queue stays homogeneous and a wake is a direct call.
pub(crate) struct WaitNode {
    id: u64,
    state: AtomicU8,
    resume: ResumeHandle,
    /// Back-reference for the timer thread, which must unlink an expired
    /// waiter from the queue before completing it.
    queue: Weak<ParkingMutex<WaitState>>,
}

enum ResumeHandle {
    /// A parked thread.
    Blocking(Parker),
    /// A suspended task. The slot is empty until the future is first
    /// polled while queued.
    Suspended(ParkingMutex<Option<Waker>>),
}

impl WaitNode {
    fn new(id: u64, resume: ResumeHandle, queue: Weak<ParkingMutex<WaitState>>) -> Self {
        Self {
            id,
            state: AtomicU8::new(QUEUED),
            resume,
            queue,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Claims the grant outcome. Exactly one of `try_grant`/`try_expire`
    /// succeeds per node.
    #[inline]
    fn try_grant(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, GRANTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the timeout outcome.
    #[inline]
    fn try_expire(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, TIMED_OUT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Invokes the resume capability: unparks a blocking waiter or wakes
    /// a suspended one. Called outside the queue lock.
    fn wake(&self) {
        match &self.resume {
            ResumeHandle::Blocking(parker) => parker.unpark(),
            ResumeHandle::Suspended(slot) => {
                let waker = slot.lock().take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
        }
    }

    /// Stores or refreshes the waker of a suspended waiter.
    fn set_waker(&self, waker: &Waker) {
        let ResumeHandle::Suspended(slot) = &self.resume else {
            debug_assert!(false, "set_waker called on a blocking waiter");
            return;
        };
        let mut slot = slot.lock();
        match &mut *slot {
            Some(existing) if existing.will_wake(waker) => {}
            other => *other = Some(waker.clone()),
        }
    }

    /// Timer-thread entry point: resolves this waiter as timed out.
    ///
    /// Loses cleanly if a grant got there first. On a win the node is
    /// unlinked from its queue before the waiter is woken, so a racing
    /// release can never resume it a second time.
    pub(crate) fn expire(&self) {
        if !self.try_expire() {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.lock().remove(self.id);
        }
        tracing::trace!(waiter = self.id, "waiter deadline elapsed");
        self.wake();
    }
}

impl HybridMutex {
    /// Creates an unlocked mutex with the given default timeout.
    #[must_use]
    pub fn new(default_timeout: Timeout) -> Self {
        Self {
            owned: AtomicBool::new(false),
            queue: Arc::new(ParkingMutex::new(WaitState {
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            })),
            default_timeout,
        }
    }

    /// The timeout used by [`try_wait`](Self::try_wait) and
    /// [`try_wait_async`](Self::try_wait_async).
    #[must_use]
    pub fn default_timeout(&self) -> Timeout {
        self.default_timeout
    }

    /// Returns true if the mutex is currently owned.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    /// Number of queued waiters, blocking and suspended combined.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.queue.lock().waiters.len()
    }

    /// The uncontended fast path: a single compare-and-exchange, no
    /// allocation, no queue access.
    #[inline]
    fn try_acquire_immediate(&self) -> bool {
        self.owned
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Attempts to acquire the lock without waiting.
    ///
    /// Equivalent to `try_wait_for(Timeout::Immediate)` but with an
    /// `Option` shape for callers that prefer it.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Token<'_>> {
        self.try_acquire_immediate().then(|| Token::valid(self))
    }

    /// Acquires the lock, blocking up to the default timeout.
    ///
    /// Returns a valid [`Token`] on success and an invalid one on
    /// timeout; never panics and never returns an error.
    #[must_use]
    pub fn try_wait(&self) -> Token<'_> {
        self.try_wait_for(self.default_timeout)
    }

    /// Acquires the lock, blocking up to the given timeout (replacing the
    /// default for this call).
    ///
    /// Only a hand-off from a release or an elapsed deadline produce a
    /// return; spurious wakeups re-enter the wait.
    #[must_use]
    pub fn try_wait_for(&self, timeout: Timeout) -> Token<'_> {
        if self.try_acquire_immediate() {
            return Token::valid(self);
        }
        let deadline = timeout.deadline();
        if matches!(deadline, Deadline::Immediate) {
            return Token::invalid();
        }

        let Some(node) = self.enqueue(ResumeHandle::Blocking(Parker::new())) else {
            return Token::valid(self);
        };
        let ResumeHandle::Blocking(parker) = &node.resume else {
            unreachable!("blocking waiter carries a parker");
        };

        loop {
            match deadline.remaining() {
                None => parker.park(),
                Some(remaining) if remaining.is_zero() => {
                    if node.try_expire() {
                        self.queue.lock().remove(node.id);
                        tracing::trace!(waiter = node.id, "blocking waiter timed out");
                        return Token::invalid();
                    }
                    // The hand-off won the race; the lock is ours.
                    debug_assert_eq!(node.state(), GRANTED);
                    return Token::valid(self);
                }
                Some(remaining) => parker.park_timeout(remaining),
            }
            if node.state() == GRANTED {
                return Token::valid(self);
            }
        }
    }

    /// Acquires the lock from an async task, waiting up to the default
    /// timeout.
    ///
    /// See [`try_wait_async_for`](Self::try_wait_async_for).
    #[must_use]
    pub fn try_wait_async(&self) -> Acquire<'_> {
        self.try_wait_async_for(self.default_timeout)
    }

    /// Acquires the lock from an async task, waiting up to the given
    /// timeout (replacing the default for this call).
    ///
    /// The fast path runs here, not at first poll: an uncontended call
    /// returns an [`Acquire`] that is already complete, having allocated
    /// no waiter and touched no timer. On contention the caller is
    /// enqueued immediately, so queue position reflects call order even
    /// if the future is polled late.
    #[must_use]
    pub fn try_wait_async_for(&self, timeout: Timeout) -> Acquire<'_> {
        if self.try_acquire_immediate() {
            return Acquire {
                mutex: self,
                phase: Phase::Ready,
            };
        }
        let deadline = timeout.deadline();
        if matches!(deadline, Deadline::Immediate) {
            return Acquire {
                mutex: self,
                phase: Phase::Expired,
            };
        }

        let Some(node) = self.enqueue(ResumeHandle::Suspended(ParkingMutex::new(None))) else {
            return Acquire {
                mutex: self,
                phase: Phase::Ready,
            };
        };
        if let Deadline::At(at) = deadline {
            timer::driver().register(at, &node);
        }
        Acquire {
            mutex: self,
            phase: Phase::Queued(node),
        }
    }

    /// Appends a waiter to the queue tail.
    ///
    /// Returns `None` if the lock was acquired instead: the flag is
    /// re-checked under the queue lock so a release that emptied the
    /// queue in the meantime cannot be missed.
    fn enqueue(&self, resume: ResumeHandle) -> Option<Arc<WaitNode>> {
        let mut state = self.queue.lock();
        if self.try_acquire_immediate() {
            return None;
        }
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        let node = Arc::new(WaitNode::new(id, resume, Arc::downgrade(&self.queue)));
        state.waiters.push_back(Arc::clone(&node));
        tracing::trace!(waiter = id, "waiter enqueued");
        Some(node)
    }

    /// Releases the lock: hands ownership directly to the first waiter
    /// still eligible, or marks the mutex free if none remain.
    ///
    /// Timed-out nodes left in the queue lose the grant CAS and are
    /// discarded here. The winning waiter is resumed outside the queue
    /// lock.
    fn release_and_wake(&self) {
        debug_assert!(
            self.owned.load(Ordering::Relaxed),
            "release of a mutex that is not owned"
        );
        let handed_off = {
            let mut state = self.queue.lock();
            loop {
                match state.waiters.pop_front() {
                    Some(node) => {
                        if node.try_grant() {
                            // Ownership transfers without the flag ever
                            // reading false.
                            break Some(node);
                        }
                    }
                    None => {
                        self.owned.store(false, Ordering::Release);
                        break None;
                    }
                }
            }
        };
        match handed_off {
            Some(node) => {
                tracing::trace!(waiter = node.id, "ownership handed off");
                node.wake();
            }
            None => tracing::trace!("mutex released, queue empty"),
        }
    }
}

impl Default for HybridMutex {
    fn default() -> Self {
        Self::new(Timeout::default())
    }
}

impl fmt::Debug for HybridMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridMutex")
            .field("locked", &self.is_locked())
            .field("waiters", &self.waiters())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Proof of an acquisition attempt's outcome.
///
/// A valid token owns the lock and releases it exactly once: either via
/// [`release`](Self::release) or when dropped. An invalid token records a
/// timed-out attempt; releasing it is a no-op, as is releasing a token
/// twice.
#[must_use = "a valid token releases the lock as soon as it is dropped"]
pub struct Token<'a> {
    /// `Some` while this token holds the lock.
    mutex: Option<&'a HybridMutex>,
}

impl<'a> Token<'a> {
    fn valid(mutex: &'a HybridMutex) -> Self {
        Self { mutex: Some(mutex) }
    }

    fn invalid() -> Self {
        Self { mutex: None }
    }

    /// Whether the acquisition succeeded and the lock is still held by
    /// this token.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.mutex.is_some()
    }

    /// Releases the lock. Idempotent; a no-op on an invalid token.
    pub fn release(&mut self) {
        if let Some(mutex) = self.mutex.take() {
            mutex.release_and_wake();
        }
    }
}

impl Drop for Token<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Future returned by [`HybridMutex::try_wait_async`].
///
/// Resolves to a [`Token`]; a timed-out wait resolves to an invalid one.
/// [`is_complete`](Self::is_complete) reports whether the next poll would
/// return immediately — the uncontended fast path is complete before the
/// future is ever polled.
#[must_use = "futures do nothing unless polled"]
pub struct Acquire<'a> {
    mutex: &'a HybridMutex,
    phase: Phase,
}

enum Phase {
    /// The fast path won at call time; the token has not been taken yet.
    Ready,
    /// An immediate-deadline attempt failed at call time.
    Expired,
    /// Queued; outcome pending.
    Queued(Arc<WaitNode>),
    /// The token was handed out (or the future abandoned).
    Done,
}

impl Acquire<'_> {
    /// Whether the wait has already resolved, without suspending.
    ///
    /// True immediately after an uncontended call, and as soon as a
    /// queued waiter has been granted the lock or timed out.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match &self.phase {
            Phase::Ready | Phase::Expired | Phase::Done => true,
            Phase::Queued(node) => node.state() != QUEUED,
        }
    }
}

impl<'a> Future for Acquire<'a> {
    type Output = Token<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.phase, Phase::Done) {
            Phase::Ready => Poll::Ready(Token::valid(this.mutex)),
            Phase::Expired => Poll::Ready(Token::invalid()),
            Phase::Queued(node) => match node.state() {
                GRANTED => Poll::Ready(Token::valid(this.mutex)),
                TIMED_OUT => {
                    // The timer normally unlinks the node; cover the
                    // window where it has marked but not yet removed.
                    this.mutex.queue.lock().remove(node.id);
                    Poll::Ready(Token::invalid())
                }
                _ => {
                    node.set_waker(cx.waker());
                    // The outcome may have landed while the waker was
                    // being stored; re-check before suspending.
                    match node.state() {
                        GRANTED => Poll::Ready(Token::valid(this.mutex)),
                        TIMED_OUT => {
                            this.mutex.queue.lock().remove(node.id);
                            Poll::Ready(Token::invalid())
                        }
                        _ => {
                            this.phase = Phase::Queued(node);
                            Poll::Pending
                        }
                    }
                }
            },
            Phase::Done => panic!("Acquire polled after completion"),
        }
    }
}

impl Drop for Acquire<'_> {
    /// Abandoning the future must not leak the waiter or the lock: a
    /// queued node is withdrawn, and a grant that was never observed is
    /// passed on to the next waiter.
    fn drop(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Ready => self.mutex.release_and_wake(),
            Phase::Queued(node) => {
                if node.try_expire() {
                    self.mutex.queue.lock().remove(node.id);
                } else if node.state() == GRANTED {
                    self.mutex.release_and_wake();
                }
            }
            Phase::Expired | Phase::Done => {}
        }
    }
}

impl fmt::Debug for Acquire<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match &self.phase {
            Phase::Ready => "ready",
            Phase::Expired => "expired",
            Phase::Queued(_) => "queued",
            Phase::Done => "done",
        };
        f.debug_struct("Acquire").field("phase", &phase).finish()
    }
}
