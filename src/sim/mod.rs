//! # Simulated uniprocessor
//!
//! ## Overview
//! A [`Machine`] implements [`Kernel`](crate::Kernel) on a hosted system so
//! the primitives can be exercised by ordinary tests. Every simulated thread
//! is backed by a host thread, but only the thread the machine is currently
//! running executes; the others wait for their turn. The result is a single
//! logical CPU whose interleavings are fully determined by the program:
//! threads switch only when they block, yield, exit, or (with
//! [`MachineFlags::PREEMPT`]) re-enable interrupts.
//!
//! ## Assumptions
//! - [`Machine::boot`] is called from the test's own thread, which becomes
//!   the boot thread ([`BOOT`])
//! - Spawned threads only touch shared state through the machine or through
//!   the primitives under test
//!
//! ## Behavior
//! - The interrupt level is per-CPU; each thread's level is saved when it is
//!   switched out and reinstated when it runs again
//! - A panic in a spawned thread is caught, the thread exits, and the panic
//!   is re-raised on the boot thread the next time it runs
//! - If nothing is runnable while threads are still blocked, the machine
//!   panics with a deadlock report instead of hanging

mod console;
mod manager;

pub use console::init as init_logging;
pub use manager::{TaskManager, TaskStatus};

use alloc::collections::BTreeMap;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar as HostCondvar, Mutex as HostMutex, MutexGuard, PoisonError};
use std::thread;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::hal::{IntrControl, IntrLevel};
use crate::task::{Scheduler, ThreadId, WaitChannel};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachineFlags: u32 {
        /// Deliver a timer tick, i.e. switch to the next ready thread, every
        /// time the interrupt level drops back to enabled.
        const PREEMPT = 1 << 0;
        /// Panic if a thread goes to sleep with interrupts enabled.
        const STRICT_SLEEP = 1 << 1;
    }
}

/// The thread that booted the machine.
pub const BOOT: ThreadId = ThreadId(0);

type Payload = Box<dyn Any + Send + 'static>;

/// Per-thread bookkeeping.
///
/// ## Fields
/// - `name`: given at spawn, shown in deadlock reports
/// - `status`: scheduling state
/// - `level`: interrupt level saved while the thread is switched out
struct Thread {
    name: String,
    status: TaskStatus,
    level: IntrLevel,
}

/// State of the one logical CPU.
///
/// ## Fields
/// - `running`: the only thread allowed to execute
/// - `level`, `in_interrupt`: current interrupt state
/// - `manager`: ready queue
/// - `threads`: every thread ever spawned, the boot thread included
/// - `next_tid`: id for the next spawn
/// - `panic`: first panic payload of a spawned thread, not yet re-raised
/// - `switches`: context switch counter
struct Cpu {
    running: ThreadId,
    level: IntrLevel,
    in_interrupt: bool,
    manager: TaskManager,
    threads: BTreeMap<ThreadId, Thread>,
    next_tid: usize,
    panic: Option<Payload>,
    switches: usize,
}

impl Cpu {
    fn make_ready(&mut self, tid: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.status = TaskStatus::Ready;
            self.manager.add(tid);
        }
    }

    fn status(&self, tid: ThreadId) -> Option<TaskStatus> {
        self.threads.get(&tid).map(|t| t.status)
    }

    fn describe_pending(&self) -> Vec<String> {
        self.threads
            .iter()
            .filter(|(tid, t)| **tid != BOOT && t.status != TaskStatus::Exited)
            .map(|(tid, t)| format!("{} ({}, {:?})", t.name, tid, t.status))
            .collect()
    }
}

/// Simulated single-CPU kernel.
///
/// ## Overview
/// Implements [`IntrControl`] and [`Scheduler`] so the primitives can run on
/// the host. Host threads take turns: only the one whose id is in
/// `Cpu::running` executes, the rest wait on `turn`.
///
/// ## Fields
/// - `cpu`: every piece of machine state, behind one host mutex
/// - `turn`: notified whenever `running` changes
/// - `flags`: behavior chosen at boot
pub struct Machine {
    cpu: HostMutex<Cpu>,
    turn: HostCondvar,
    flags: MachineFlags,
}

impl Machine {
    /// Creates a machine whose only thread is the caller.
    ///
    /// The machine lives for the rest of the process, as a kernel would.
    pub fn boot(flags: MachineFlags) -> &'static Machine {
        console::init();
        let mut threads = BTreeMap::new();
        threads.insert(
            BOOT,
            Thread {
                name: String::from("boot"),
                status: TaskStatus::Running,
                level: IntrLevel::ENABLED,
            },
        );
        debug!("sim: boot with {:?}", flags);
        Box::leak(Box::new(Machine {
            cpu: HostMutex::new(Cpu {
                running: BOOT,
                level: IntrLevel::ENABLED,
                in_interrupt: false,
                manager: TaskManager::new(),
                threads,
                next_tid: BOOT.0 + 1,
                panic: None,
                switches: 0,
            }),
            turn: HostCondvar::new(),
            flags,
        }))
    }

    /// Creates a ready thread running `f`. It first runs when the current
    /// thread blocks, yields or is preempted.
    pub fn spawn<F>(&'static self, name: &str, f: F) -> ThreadId
    where
        F: FnOnce() + Send + 'static,
    {
        let tid = {
            let mut cpu = self.cpu();
            let tid = ThreadId(cpu.next_tid);
            cpu.next_tid += 1;
            cpu.threads.insert(
                tid,
                Thread {
                    name: String::from(name),
                    status: TaskStatus::Ready,
                    level: IntrLevel::ENABLED,
                },
            );
            cpu.manager.add(tid);
            tid
        };
        debug!("sim: spawn {} ({})", tid, name);
        thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                drop(self.wait_turn(self.cpu(), tid));
                let result = panic::catch_unwind(AssertUnwindSafe(f));
                self.exit(tid, result.err());
            })
            .expect("sim: cannot spawn host thread");
        tid
    }

    /// Puts the current thread at the back of the ready queue and runs the
    /// next one.
    pub fn yield_now(&self) {
        let cpu = self.cpu();
        let me = cpu.running;
        self.switch_from(cpu, me, TaskStatus::Ready);
    }

    /// Runs the other threads until all of them have exited.
    ///
    /// ## Panics
    /// - With the panic payload of a spawned thread that panicked
    /// - If threads remain but none of them can run
    pub fn join_all(&self) {
        loop {
            let mut cpu = self.cpu();
            assert_eq!(cpu.running, BOOT, "sim: join_all outside the boot thread");
            if let Some(payload) = cpu.panic.take() {
                drop(cpu);
                panic::resume_unwind(payload);
            }
            let pending = cpu.describe_pending();
            if pending.is_empty() {
                return;
            }
            if cpu.manager.is_empty() {
                drop(cpu);
                panic!("sim: deadlock, still blocked: {}", pending.join(", "));
            }
            self.switch_from(cpu, BOOT, TaskStatus::Ready);
        }
    }

    /// Runs `f` as an interrupt handler on the current thread: interrupts
    /// masked and blocking forbidden.
    pub fn interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        let frame = {
            let mut cpu = self.cpu();
            let level = core::mem::replace(&mut cpu.level, IntrLevel::MASKED);
            let nested = core::mem::replace(&mut cpu.in_interrupt, true);
            InterruptFrame {
                machine: self,
                level,
                nested,
            }
        };
        let ret = f();
        drop(frame);
        ret
    }

    pub fn status(&self, tid: ThreadId) -> Option<TaskStatus> {
        self.cpu().status(tid)
    }

    pub fn level(&self) -> IntrLevel {
        self.cpu().level
    }

    /// Number of times the CPU changed threads.
    pub fn context_switches(&self) -> usize {
        self.cpu().switches
    }

    fn cpu(&self) -> MutexGuard<'_, Cpu> {
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_turn<'a>(&'a self, mut cpu: MutexGuard<'a, Cpu>, me: ThreadId) -> MutexGuard<'a, Cpu> {
        while cpu.running != me {
            cpu = self.turn.wait(cpu).unwrap_or_else(PoisonError::into_inner);
        }
        cpu
    }

    /// Leaves `me` in `status` and hands the CPU to the next ready thread.
    /// Returns once `me` is running again (never, for `Exited`).
    fn switch_from(&self, mut cpu: MutexGuard<'_, Cpu>, me: ThreadId, status: TaskStatus) {
        let level = cpu.level;
        if status == TaskStatus::Ready {
            cpu.manager.add(me);
        }
        let next = match cpu.manager.fetch() {
            Some(next) => next,
            None if status == TaskStatus::Exited => {
                if let Some(thread) = cpu.threads.get_mut(&me) {
                    thread.status = status;
                }
                return;
            }
            None => {
                let pending = cpu.describe_pending();
                drop(cpu);
                panic!(
                    "sim: deadlock, {} would block with nothing runnable: {}",
                    me,
                    pending.join(", ")
                );
            }
        };
        if let Some(thread) = cpu.threads.get_mut(&me) {
            thread.status = status;
            thread.level = level;
        }
        let next_level = match cpu.threads.get_mut(&next) {
            Some(thread) => {
                thread.status = TaskStatus::Running;
                thread.level
            }
            None => IntrLevel::ENABLED,
        };
        cpu.running = next;
        cpu.level = next_level;
        if next == me {
            return;
        }
        cpu.switches += 1;
        trace!("sim: switch {} -> {}", me, next);
        self.turn.notify_all();
        if status == TaskStatus::Exited {
            return;
        }
        let mut cpu = self.wait_turn(cpu, me);
        if me == BOOT {
            if let Some(payload) = cpu.panic.take() {
                drop(cpu);
                panic::resume_unwind(payload);
            }
        }
    }

    fn exit(&self, tid: ThreadId, panic: Option<Payload>) {
        let mut cpu = self.cpu();
        if let Some(payload) = panic {
            warn!("sim: {} panicked", tid);
            cpu.panic.get_or_insert(payload);
        }
        // Let the boot thread see the panic, or the deadlock, instead of
        // sleeping forever.
        if cpu.panic.is_some() || cpu.manager.is_empty() {
            if let Some(TaskStatus::Blocked(_)) = cpu.status(BOOT) {
                cpu.make_ready(BOOT);
            }
        }
        debug!("sim: exit {}", tid);
        self.switch_from(cpu, tid, TaskStatus::Exited);
    }
}

struct InterruptFrame<'a> {
    machine: &'a Machine,
    level: IntrLevel,
    nested: bool,
}

impl Drop for InterruptFrame<'_> {
    fn drop(&mut self) {
        let mut cpu = self.machine.cpu();
        cpu.level = self.level;
        cpu.in_interrupt = self.nested;
    }
}

// SAFETY: only the running thread executes; switches happen in `sleep`,
// `yield_now`, thread exit, and in `restore` when the level drops to
// `ENABLED`. None of these run with the level masked except `sleep`, which
// is the blocking point the contract allows.
unsafe impl IntrControl for Machine {
    fn raise(&self) -> IntrLevel {
        let mut cpu = self.cpu();
        core::mem::replace(&mut cpu.level, IntrLevel::MASKED)
    }

    fn restore(&self, prev: IntrLevel) {
        let mut cpu = self.cpu();
        cpu.level = prev;
        let tick = prev == IntrLevel::ENABLED
            && self.flags.contains(MachineFlags::PREEMPT)
            && !cpu.in_interrupt
            && !thread::panicking();
        if tick {
            let me = cpu.running;
            self.switch_from(cpu, me, TaskStatus::Ready);
        }
    }

    fn in_interrupt(&self) -> bool {
        self.cpu().in_interrupt
    }
}

impl Scheduler for Machine {
    fn current(&self) -> ThreadId {
        self.cpu().running
    }

    fn sleep(&self, chan: WaitChannel) {
        let cpu = self.cpu();
        let me = cpu.running;
        if cpu.in_interrupt {
            drop(cpu);
            panic!("sim: {} sleeps in interrupt handler", me);
        }
        if self.flags.contains(MachineFlags::STRICT_SLEEP) && !cpu.level.is_masked() {
            drop(cpu);
            panic!("sim: {} sleeps with interrupts enabled", me);
        }
        trace!("sim: {} sleeps on {:?}", me, chan);
        self.switch_from(cpu, me, TaskStatus::Blocked(chan));
    }

    fn wakeup(&self, chan: WaitChannel) {
        let mut cpu = self.cpu();
        let woken: Vec<ThreadId> = cpu
            .threads
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Blocked(chan))
            .map(|(tid, _)| *tid)
            .collect();
        for tid in woken {
            trace!("sim: wake {} from {:?}", tid, chan);
            cpu.make_ready(tid);
        }
    }

    fn wakeup_thread(&self, tid: ThreadId) {
        let mut cpu = self.cpu();
        if let Some(TaskStatus::Blocked(_)) = cpu.status(tid) {
            trace!("sim: wake {}", tid);
            cpu.make_ready(tid);
        }
    }

    fn sleepers(&self, chan: WaitChannel) -> usize {
        self.cpu()
            .threads
            .values()
            .filter(|t| t.status == TaskStatus::Blocked(chan))
            .count()
    }
}
