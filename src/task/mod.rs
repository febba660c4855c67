//! # Threads as seen by the primitives
//!
//! ## Overview
//! The scheduler owns every thread. Primitives only ever hold a [`ThreadId`]
//! (lock owner, condition-variable queue entries) and block or wake threads
//! through the [`Scheduler`] interface, keyed by an opaque [`WaitChannel`].
//!
//! ## Behavior
//! - `sleep` is entered with interrupts masked and returns, after the thread
//!   has been woken and rescheduled, with interrupts masked again
//! - `wakeup` / `wakeup_thread` only mark threads ready; they never switch

use core::fmt;

use crate::hal::IntrControl;

/// Opaque, comparable identity of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Key matching sleeping threads to the event that wakes them.
///
/// Primitives use their own address, so a channel is only meaningful while
/// the primitive stays in place, which holds for as long as anyone can be
/// blocked on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitChannel(pub usize);

impl WaitChannel {
    pub fn of<T>(obj: &T) -> Self {
        WaitChannel(obj as *const T as usize)
    }
}

/// Sleep / wakeup collaborator.
pub trait Scheduler {
    /// Identity of the calling thread.
    fn current(&self) -> ThreadId;

    /// Blocks the calling thread on `chan` until it is woken.
    ///
    /// Must be called with interrupts masked. The switch away from the caller
    /// happens with the level still masked, so a wakeup cannot slip in between
    /// the caller's last check and its registration as a sleeper.
    fn sleep(&self, chan: WaitChannel);

    /// Makes every thread sleeping on `chan` ready.
    fn wakeup(&self, chan: WaitChannel);

    /// Makes `tid` ready if it is sleeping.
    fn wakeup_thread(&self, tid: ThreadId);

    /// Number of threads sleeping on `chan`.
    fn sleepers(&self, chan: WaitChannel) -> usize;
}

/// Everything a primitive needs from the kernel it is embedded in.
pub trait Kernel: IntrControl + Scheduler + Sync {}

impl<K: IntrControl + Scheduler + Sync> Kernel for K {}
