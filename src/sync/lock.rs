//! # Sleeping lock
//!
//! ## Overview
//! A binary lock that remembers which thread holds it. It blocks the same way
//! the semaphore does (sleep on its own wait channel, wake all on release,
//! re-check after every wakeup) but is not built on top of a semaphore.
//!
//! ## Assumptions
//! - Single logical CPU; the only concurrency is interrupts and blocking
//! - Callers pair every `acquire` with a `release` from the same thread
//!
//! ## Invariants
//! - At most one thread is the holder at any instant
//! - `holder.is_some()` is the "held" state; there is no separate flag that
//!   could disagree with it
//!
//! ## Behavior
//! - Re-acquiring a lock the caller already holds is a bug and panics
//! - Releasing a lock the caller does not hold is a bug and panics
//! - `release` wakes every sleeper; the next holder is up to the scheduler

use alloc::string::String;
use core::fmt;

use log::{debug, trace};

use crate::error::SyncResult;
use crate::sync::{dup_name, UPIntrFreeCell};
use crate::task::{Kernel, ThreadId, WaitChannel};

/// Sleeping lock with an owner.
///
/// ## Overview
/// Only the thread that acquired the lock may release it. Contenders sleep on
/// the lock's wait channel and race for it again after every release.
///
/// ## Fields
/// - `kernel`: scheduler and interrupt control the lock blocks through
/// - `name`: private copy of the creation name, for diagnostics
/// - `inner`: the holder, only touched with interrupts masked
pub struct Lock<K: Kernel + 'static> {
    kernel: &'static K,
    name: String,
    inner: UPIntrFreeCell<LockInner>,
}

/// State protected by the lock's critical section.
///
/// ## Fields
/// - `holder`: thread that owns the lock, `None` when free
struct LockInner {
    holder: Option<ThreadId>,
}

impl<K: Kernel + 'static> Lock<K> {
    /// Creates an unlocked lock.
    pub fn new(kernel: &'static K, name: &str) -> SyncResult<Self> {
        let name = dup_name(name)?;
        debug!("lock {}: created", name);
        Ok(Self {
            kernel,
            name,
            inner: UPIntrFreeCell::new(LockInner { holder: None }),
        })
    }

    /// Destroys the lock.
    ///
    /// ## Panics
    /// - If the lock is held or any thread is sleeping on it
    pub fn destroy(self) {
        let chan = self.wait_channel();
        let (holder, sleepers) = {
            let inner = self.inner.exclusive_access(self.kernel);
            (inner.holder, self.kernel.sleepers(chan))
        };
        if let Some(holder) = holder {
            panic!("lock {}: destroyed while held by {}", self.name, holder);
        }
        assert!(
            sleepers == 0,
            "lock {}: destroyed with {} sleeping thread(s)",
            self.name,
            sleepers
        );
        debug!("lock {}: destroyed", self.name);
    }

    /// Acquires the lock, sleeping until it is free.
    ///
    /// ## Panics
    /// - If called from an interrupt handler
    /// - If the calling thread already holds the lock
    pub fn acquire(&self) {
        assert!(
            !self.kernel.in_interrupt(),
            "lock {}: acquire in interrupt handler",
            self.name
        );
        let me = self.kernel.current();
        let chan = self.wait_channel();
        let mut inner = self.inner.exclusive_access(self.kernel);
        if inner.holder == Some(me) {
            drop(inner);
            panic!("lock {}: recursive acquire by {}", self.name, me);
        }
        while inner.holder.is_some() {
            trace!("lock {}: {} sleeps, held by {:?}", self.name, me, inner.holder);
            inner.sleep(chan);
        }
        inner.holder = Some(me);
    }

    /// Acquires the lock if it is free. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let me = self.kernel.current();
        self.inner.exclusive_session(self.kernel, |inner| {
            if inner.holder.is_some() {
                false
            } else {
                inner.holder = Some(me);
                true
            }
        })
    }

    /// Releases the lock and wakes every sleeper.
    ///
    /// ## Panics
    /// - If the calling thread is not the holder
    pub fn release(&self) {
        let me = self.kernel.current();
        let mut inner = self.inner.exclusive_access(self.kernel);
        if inner.holder != Some(me) {
            let holder = inner.holder;
            drop(inner);
            match holder {
                Some(holder) => panic!(
                    "lock {}: released by {} but held by {}",
                    self.name, me, holder
                ),
                None => panic!("lock {}: released by {} but not held", self.name, me),
            }
        }
        inner.holder = None;
        self.kernel.wakeup(self.wait_channel());
    }

    /// Whether the calling thread holds the lock.
    pub fn do_i_hold(&self) -> bool {
        let me = self.kernel.current();
        self.holder() == Some(me)
    }

    pub fn holder(&self) -> Option<ThreadId> {
        self.inner.exclusive_session(self.kernel, |inner| inner.holder)
    }

    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait_channel(&self) -> WaitChannel {
        WaitChannel::of(self)
    }
}

impl<K: Kernel + 'static> fmt::Debug for Lock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("holder", &self.holder())
            .finish()
    }
}
