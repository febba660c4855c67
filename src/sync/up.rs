//! # Uniprocessor interior mutability with interrupt masking
//!
//! ## Overview
//! - `IntrGuard`: scoped critical section; raises the interrupt level on
//!   creation and restores the saved level when dropped, on every exit path
//! - `UPIntrFreeCell`: keeps the interrupt level masked for as long as its
//!   contents are borrowed
//! - `UPIntrRefMut`: the RAII borrow handed out by `UPIntrFreeCell`
//!
//! ## Assumptions
//! - A single logical CPU executes kernel code
//! - Masking interrupts is enough to exclude every other thread
//!
//! ## Safety
//! - `unsafe impl Sync` for `UPIntrFreeCell` holds only under the
//!   [`IntrControl`] contract
//! - `RefCell` still checks borrows dynamically: re-entering the same cell
//!   from inside a session panics instead of aliasing
//!
//! ## Invariants
//! - While a `UPIntrRefMut` holds its borrow, the level is masked
//! - The borrow is always released before the saved level is restored
//! - `UPIntrRefMut::sleep` keeps the level masked across the block, so the
//!   check-then-sleep sequence of a caller cannot lose a wakeup

use core::cell::{RefCell, RefMut};
use core::ops::{Deref, DerefMut};

use crate::hal::{IntrControl, IntrLevel};
use crate::task::{Scheduler, WaitChannel};

/// Scoped critical section.
///
/// Nesting is allowed: an inner guard saves and restores
/// [`IntrLevel::MASKED`], leaving the outer section intact.
pub struct IntrGuard<'a, K: IntrControl + ?Sized> {
    kernel: &'a K,
    saved: IntrLevel,
}

impl<'a, K: IntrControl + ?Sized> IntrGuard<'a, K> {
    pub fn new(kernel: &'a K) -> Self {
        let saved = kernel.raise();
        Self { kernel, saved }
    }

    /// Level that will be restored when the guard is dropped.
    pub fn saved(&self) -> IntrLevel {
        self.saved
    }
}

impl<K: IntrControl + ?Sized> Drop for IntrGuard<'_, K> {
    fn drop(&mut self) {
        self.kernel.restore(self.saved);
    }
}

/// Interior-mutable cell whose every access runs with interrupts masked.
pub struct UPIntrFreeCell<T> {
    inner: RefCell<T>,
}

unsafe impl<T: Send> Sync for UPIntrFreeCell<T> {}

impl<T> UPIntrFreeCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Masks interrupts and borrows the contents.
    ///
    /// Panics if the contents are already borrowed.
    pub fn exclusive_access<'a, K: IntrControl + ?Sized>(
        &'a self,
        kernel: &'a K,
    ) -> UPIntrRefMut<'a, K, T> {
        let level = IntrGuard::new(kernel);
        UPIntrRefMut {
            data: Some(self.inner.borrow_mut()),
            cell: &self.inner,
            level,
        }
    }

    /// Runs `f` inside one critical section.
    pub fn exclusive_session<K, F, V>(&self, kernel: &K, f: F) -> V
    where
        K: IntrControl + ?Sized,
        F: FnOnce(&mut T) -> V,
    {
        let mut inner = self.exclusive_access(kernel);
        f(inner.deref_mut())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Exclusive borrow of a [`UPIntrFreeCell`], with interrupts masked.
pub struct UPIntrRefMut<'a, K: IntrControl + ?Sized, T> {
    // Field order matters: the borrow is dropped before the level.
    data: Option<RefMut<'a, T>>,
    cell: &'a RefCell<T>,
    level: IntrGuard<'a, K>,
}

impl<'a, K: IntrControl + ?Sized, T> UPIntrRefMut<'a, K, T> {
    /// Gives up the borrow but stays in the critical section.
    pub fn into_intr_guard(self) -> IntrGuard<'a, K> {
        let UPIntrRefMut { data, level, .. } = self;
        drop(data);
        level
    }
}

impl<K: IntrControl + Scheduler + ?Sized, T> UPIntrRefMut<'_, K, T> {
    /// Blocks the current thread on `chan` without leaving the critical
    /// section.
    ///
    /// The borrow is released while the thread sleeps so that the waker can
    /// access the cell, and taken again once the thread runs.
    pub fn sleep(&mut self, chan: WaitChannel) {
        self.data = None;
        self.level.kernel.sleep(chan);
        self.data = Some(self.cell.borrow_mut());
    }
}

impl<K: IntrControl + ?Sized, T> Deref for UPIntrRefMut<'_, K, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data.as_deref().unwrap()
    }
}

impl<K: IntrControl + ?Sized, T> DerefMut for UPIntrRefMut<'_, K, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data.as_deref_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeCpu {
        level: Cell<IntrLevel>,
        raises: Cell<usize>,
    }

    impl FakeCpu {
        fn new() -> Self {
            Self {
                level: Cell::new(IntrLevel::ENABLED),
                raises: Cell::new(0),
            }
        }
    }

    unsafe impl IntrControl for FakeCpu {
        fn raise(&self) -> IntrLevel {
            self.raises.set(self.raises.get() + 1);
            self.level.replace(IntrLevel::MASKED)
        }

        fn restore(&self, prev: IntrLevel) {
            self.level.set(prev);
        }

        fn in_interrupt(&self) -> bool {
            false
        }
    }

    #[test]
    fn nested_guards_restore_outer_level() {
        let cpu = FakeCpu::new();
        {
            let outer = IntrGuard::new(&cpu);
            assert_eq!(outer.saved(), IntrLevel::ENABLED);
            {
                let inner = IntrGuard::new(&cpu);
                assert_eq!(inner.saved(), IntrLevel::MASKED);
            }
            assert!(cpu.level.get().is_masked());
        }
        assert_eq!(cpu.level.get(), IntrLevel::ENABLED);
        assert_eq!(cpu.raises.get(), 2);
    }

    #[test]
    fn session_runs_masked() {
        let cpu = FakeCpu::new();
        let cell = UPIntrFreeCell::new(41);
        let seen = cell.exclusive_session(&cpu, |v| {
            *v += 1;
            cpu.level.get()
        });
        assert!(seen.is_masked());
        assert_eq!(cpu.level.get(), IntrLevel::ENABLED);
        assert_eq!(cell.into_inner(), 42);
    }

    #[test]
    fn intr_guard_outlives_borrow() {
        let cpu = FakeCpu::new();
        let cell = UPIntrFreeCell::new(0u32);
        let guard = cell.exclusive_access(&cpu).into_intr_guard();
        // the cell is free again while the section is still open
        *cell.exclusive_access(&cpu) = 7;
        assert!(cpu.level.get().is_masked());
        drop(guard);
        assert_eq!(cpu.level.get(), IntrLevel::ENABLED);
        assert_eq!(cell.into_inner(), 7);
    }

    #[test]
    #[should_panic]
    fn reentrant_access_panics() {
        let cpu = FakeCpu::new();
        let cell = UPIntrFreeCell::new(());
        let _first = cell.exclusive_access(&cpu);
        let _second = cell.exclusive_access(&cpu);
    }
}
