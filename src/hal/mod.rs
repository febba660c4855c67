//! # Interrupt level control
//!
//! ## Overview
//! The primitives never touch interrupt hardware themselves. They raise the
//! current interrupt level to [`IntrLevel::MASKED`] through [`IntrControl`]
//! and restore the saved level afterwards, which on a single logical CPU makes
//! the enclosed state transition indivisible.
//!
//! ## Safety
//! [`IntrControl`] is an `unsafe trait`: every `unsafe impl Sync` in
//! [`crate::sync`] relies on an implementor keeping its promise that nothing
//! else runs kernel code while the level is masked.

/// Interrupt priority level of the CPU.
///
/// Levels are ordered; a higher level masks more interrupt sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IntrLevel(pub u8);

impl IntrLevel {
    /// All interrupts delivered.
    pub const ENABLED: IntrLevel = IntrLevel(0);
    /// Every interrupt source masked.
    pub const MASKED: IntrLevel = IntrLevel(u8::MAX);

    pub fn is_masked(self) -> bool {
        self == Self::MASKED
    }
}

/// Critical-section collaborator.
///
/// # Safety
/// While the level is [`IntrLevel::MASKED`], no other thread and no interrupt
/// handler may execute code that touches the primitives. `raise` must be
/// callable while already masked (nesting) and return the level it replaced.
pub unsafe trait IntrControl {
    /// Masks all interrupts, returning the previous level.
    fn raise(&self) -> IntrLevel;

    /// Returns to a level previously obtained from [`raise`](Self::raise).
    fn restore(&self, prev: IntrLevel);

    /// Whether the CPU is currently running an interrupt handler, where
    /// blocking is forbidden.
    fn in_interrupt(&self) -> bool;
}
