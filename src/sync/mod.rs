//! # Synchronization primitives
//!
//! ## Overview
//! Single entry point for the sleeping primitives and the interrupt-masked
//! cell they share:
//! - `semaphore`: counting semaphore
//! - `lock`: sleeping lock with an owner
//! - `condvar`: condition variable with a FIFO wait queue
//! - `up`: critical-section guard and interior mutability for one CPU
//!
//! ## Assumptions
//! - One logical CPU; interrupts and blocking are the only interleaving points
//! - Every primitive reaches the kernel through [`Kernel`](crate::Kernel)
//!
//! ## Invariants
//! - All primitive state is only touched inside a `UPIntrFreeCell` session
//! - A thread is registered as a sleeper before the critical section that
//!   decided it must sleep is left
//!
//! ## Behavior
//! - Semaphore and lock wake all sleepers and let them re-check
//! - The condition variable wakes exactly one thread per signal, oldest first

mod condvar;
mod lock;
mod semaphore;
mod up;

pub use condvar::Condvar;
pub use lock::Lock;
pub use semaphore::Semaphore;
pub use up::{IntrGuard, UPIntrFreeCell, UPIntrRefMut};

use alloc::string::String;

use crate::error::{SyncError, SyncResult};

/// Copies a primitive's name, reporting allocation failure instead of
/// aborting.
fn dup_name(name: &str) -> SyncResult<String> {
    let mut owned = String::new();
    owned
        .try_reserve_exact(name.len())
        .map_err(|_| SyncError::NoMemory)?;
    owned.push_str(name);
    Ok(owned)
}
