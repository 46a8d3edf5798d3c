//! A timeout-aware mutex usable from both blocking threads and async tasks.
//!
//! [`HybridMutex`] exposes two acquisition paths over one FIFO waiter
//! queue:
//!
//! - [`HybridMutex::try_wait`] blocks the calling thread, parking it until
//!   the lock is handed over or the deadline elapses.
//! - [`HybridMutex::try_wait_async`] suspends the calling task without
//!   occupying a thread; the returned [`Acquire`] future is already
//!   complete when the lock was free at call time.
//!
//! Either path yields a [`Token`]: valid on success, invalid on timeout.
//! A valid token releases the lock exactly once, on drop or via an
//! explicit, idempotent [`Token::release`]. Timeouts are values, not
//! errors — the hot path never unwinds.
//!
//! The uncontended case is a single compare-and-exchange: no allocation,
//! no queue access, no timer, no task machinery. Contended callers are
//! served strictly in arrival order; the small best-case latency given up
//! to fairness is the reason this primitive exists next to simpler locks.
//!
//! # Example
//!
//! ```
//! use hybrid_mutex::{HybridMutex, Timeout};
//! use std::time::Duration;
//!
//! let mutex = HybridMutex::new(Timeout::After(Duration::from_millis(200)));
//!
//! // Blocking path: waits up to the default timeout.
//! let token = mutex.try_wait();
//! assert!(token.is_valid());
//!
//! // A second caller unwilling to wait fails fast, without an error.
//! assert!(!mutex.try_wait_for(Timeout::Immediate).is_valid());
//!
//! drop(token); // released here
//! ```
//!
//! The async path mirrors the blocking one:
//!
//! ```ignore
//! let token = mutex.try_wait_async().await;
//! if token.is_valid() {
//!     // critical section
//! }
//! ```
//!
//! # Caveats
//!
//! Acquisition is not reentrant: a holder that acquires again deadlocks
//! until its timeout. There is no reader-writer mode, no cross-process
//! support, and no priority inheritance.

mod deadline;
mod mutex;
mod park;
mod timer;

pub use deadline::Timeout;
pub use mutex::{Acquire, HybridMutex, Token};
