//! # ksync
//!
//! ## Overview
//! Sleeping synchronization primitives for a kernel that runs all of its
//! threads on a single logical CPU:
//!
//! - [`Semaphore`]: counting resource gate (`P` / `V`)
//! - [`Lock`]: mutual exclusion with ownership tracking
//! - [`Condvar`]: wait / signal / broadcast paired with a [`Lock`], strict FIFO
//!
//! Atomicity comes from masking interrupts ([`IntrGuard`]) rather than from
//! hardware atomics. The thread scheduler and the interrupt controller are
//! supplied by the embedding kernel through the [`Kernel`] trait.
//!
//! ## Layout
//! - `hal`: interrupt level control consumed by the primitives
//! - `task`: thread identity, wait channels and the scheduler interface
//! - `sync`: the primitives and the interrupt-masked cell they are built on
//! - `sim` (feature `std`): a deterministic single-CPU machine for tests
//!
//! ## Assumptions
//! - No second core ever executes kernel code
//! - The only source of concurrency is interrupts and explicit blocking

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod hal;
pub mod sync;
pub mod task;

#[cfg(feature = "std")]
pub mod sim;

pub use error::{SyncError, SyncResult};
pub use hal::{IntrControl, IntrLevel};
pub use sync::{Condvar, IntrGuard, Lock, Semaphore, UPIntrFreeCell, UPIntrRefMut};
pub use task::{Kernel, Scheduler, ThreadId, WaitChannel};
