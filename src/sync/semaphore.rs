//! # Counting semaphore
//!
//! ## Overview
//! A semaphore hands out `count` units of a resource. `acquire` (P) takes a
//! unit, sleeping while none is left; `release` (V) returns one.
//!
//! ## Assumptions
//! - Single logical CPU; the only concurrency is interrupts and blocking
//! - `acquire` is never called from an interrupt handler
//!
//! ## Invariants
//! - `count` never goes below zero (it is unsigned; a decrement only happens
//!   after observing a non-zero count inside the critical section)
//! - Every thread sleeping on the semaphore's channel observed `count == 0`
//!   before it slept
//!
//! ## Behavior
//! - `release` wakes *every* sleeper; each one re-checks the count, so the
//!   next owner is whichever the scheduler runs first (no FIFO guarantee)

use alloc::string::String;
use core::fmt;

use log::{debug, trace};

use crate::error::SyncResult;
use crate::sync::{dup_name, IntrGuard, UPIntrFreeCell};
use crate::task::{Kernel, WaitChannel};

/// Counting semaphore.
///
/// ## Overview
/// Wraps `SemaphoreInner` and exposes P ([`acquire`](Self::acquire)) and V
/// ([`release`](Self::release)). Sleepers block on the semaphore's own
/// wait channel; there is no queue.
///
/// ## Fields
/// - `kernel`: scheduler and interrupt control the semaphore blocks through
/// - `name`: private copy of the creation name, for diagnostics
/// - `inner`: the count, only touched with interrupts masked
pub struct Semaphore<K: Kernel + 'static> {
    kernel: &'static K,
    name: String,
    inner: UPIntrFreeCell<SemaphoreInner>,
}

/// State protected by the semaphore's critical section.
///
/// ## Fields
/// - `count`: units available right now; a thread that finds it at zero
///   sleeps instead of driving it negative
struct SemaphoreInner {
    count: usize,
}

impl<K: Kernel + 'static> Semaphore<K> {
    /// Creates a semaphore holding `count` units.
    ///
    /// Fails with [`SyncError::NoMemory`](crate::SyncError::NoMemory) if the
    /// name cannot be copied.
    pub fn new(kernel: &'static K, name: &str, count: usize) -> SyncResult<Self> {
        let name = dup_name(name)?;
        debug!("semaphore {}: created with count {}", name, count);
        Ok(Self {
            kernel,
            name,
            inner: UPIntrFreeCell::new(SemaphoreInner { count }),
        })
    }

    /// Destroys the semaphore.
    ///
    /// ## Panics
    /// - If any thread is still sleeping on it
    pub fn destroy(self) {
        let chan = self.wait_channel();
        let sleepers = {
            let _intr = IntrGuard::new(self.kernel);
            self.kernel.sleepers(chan)
        };
        assert!(
            sleepers == 0,
            "semaphore {}: destroyed with {} sleeping thread(s)",
            self.name,
            sleepers
        );
        debug!("semaphore {}: destroyed", self.name);
    }

    /// P: takes one unit, sleeping until one is available.
    ///
    /// ## Panics
    /// - If called from an interrupt handler. This is checked even when a
    ///   unit is available and the call would not block.
    #[doc(alias = "P")]
    pub fn acquire(&self) {
        assert!(
            !self.kernel.in_interrupt(),
            "semaphore {}: acquire in interrupt handler",
            self.name
        );
        let chan = self.wait_channel();
        let mut inner = self.inner.exclusive_access(self.kernel);
        while inner.count == 0 {
            trace!(
                "semaphore {}: {} sleeps",
                self.name,
                self.kernel.current()
            );
            inner.sleep(chan);
        }
        inner.count -= 1;
    }

    /// Takes one unit if one is available. Never blocks, so it may be used
    /// from an interrupt handler.
    pub fn try_acquire(&self) -> bool {
        self.inner.exclusive_session(self.kernel, |inner| {
            if inner.count == 0 {
                false
            } else {
                inner.count -= 1;
                true
            }
        })
    }

    /// V: returns one unit and wakes every sleeper.
    #[doc(alias = "V")]
    pub fn release(&self) {
        let mut inner = self.inner.exclusive_access(self.kernel);
        inner.count = match inner.count.checked_add(1) {
            Some(count) => count,
            None => panic!("semaphore {}: count overflow", self.name),
        };
        assert!(inner.count > 0);
        self.kernel.wakeup(self.wait_channel());
    }

    /// Units currently available.
    pub fn count(&self) -> usize {
        self.inner.exclusive_session(self.kernel, |inner| inner.count)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait_channel(&self) -> WaitChannel {
        WaitChannel::of(self)
    }
}

impl<K: Kernel + 'static> fmt::Debug for Semaphore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish()
    }
}
