//! # Condition variable
//!
//! ## Overview
//! Threads wait on a condition variable while holding a [`Lock`]; `wait`
//! gives the lock up, sleeps, and takes the lock back before returning.
//! Unlike the semaphore and the lock, waiters are kept in an explicit FIFO
//! queue and woken one by one, oldest first.
//!
//! ## Assumptions
//! - Single logical CPU; the only concurrency is interrupts and blocking
//! - Every call on one condition variable uses the same lock (not checked)
//!
//! ## Invariants
//! - `waiters == queue.len()` whenever nobody is inside a critical section
//! - A thread in the queue is asleep on the condition variable's channel
//! - Nothing is allocated while interrupts are masked: room for the next
//!   waiter is made before the final critical section of `wait` is entered
//!
//! ## Behavior
//! Per waiting thread:
//!
//! ```text
//! running --wait--> queued --signal/broadcast--> reacquiring lock --> running
//! ```
//!
//! - `wait` releases the lock, enqueues and sleeps in one critical section, so
//!   a signal cannot fall between the release and the sleep
//! - `signal` with nobody waiting does nothing

use alloc::collections::VecDeque;
use alloc::string::String;
use core::fmt;

use log::{debug, trace};

use crate::config::{CONDVAR_QUEUE_GROWTH, CONDVAR_QUEUE_INIT_CAPACITY};
use crate::error::{SyncError, SyncResult};
use crate::sync::{dup_name, Lock, UPIntrFreeCell, UPIntrRefMut};
use crate::task::{Kernel, ThreadId, WaitChannel};

/// Condition variable used together with a [`Lock`].
///
/// ## Overview
/// `wait` parks the caller at the tail of a FIFO queue; `signal` wakes the
/// head, `broadcast` wakes everyone queued at the time of the call.
///
/// ## Fields
/// - `kernel`: scheduler and interrupt control the waiters block through
/// - `name`: private copy of the creation name, for diagnostics
/// - `inner`: waiter count and queue, only touched with interrupts masked
pub struct Condvar<K: Kernel + 'static> {
    kernel: &'static K,
    name: String,
    inner: UPIntrFreeCell<CondvarInner>,
}

/// State protected by the condition variable's critical section.
///
/// ## Fields
/// - `waiters`: threads that called `wait` and have not been woken yet
/// - `queue`: the same threads, oldest first
struct CondvarInner {
    waiters: usize,
    queue: WaitQueue,
}

/// FIFO of waiting threads with explicitly managed storage.
struct WaitQueue {
    threads: VecDeque<ThreadId>,
}

impl WaitQueue {
    fn try_with_capacity(capacity: usize) -> SyncResult<Self> {
        let mut threads = VecDeque::new();
        threads
            .try_reserve_exact(capacity)
            .map_err(|_| SyncError::NoMemory)?;
        Ok(Self { threads })
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            threads: VecDeque::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.threads.len()
    }

    fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn capacity(&self) -> usize {
        self.threads.capacity()
    }

    fn contains(&self, tid: ThreadId) -> bool {
        self.threads.contains(&tid)
    }

    /// Whether one more thread fits without allocating.
    fn has_room(&self) -> bool {
        self.threads.len() < self.threads.capacity()
    }

    fn grown_capacity(&self) -> usize {
        (self.threads.capacity() * CONDVAR_QUEUE_GROWTH).max(self.threads.len() + 1)
    }

    /// Moves the queued threads into `spare` and returns the old storage.
    ///
    /// `spare` must be able to hold every queued thread plus one, so the
    /// move itself never allocates.
    fn adopt(&mut self, mut spare: WaitQueue) -> WaitQueue {
        debug_assert!(spare.is_empty() && spare.capacity() > self.len());
        spare.threads.extend(self.threads.drain(..));
        core::mem::replace(self, spare)
    }

    fn push_back(&mut self, tid: ThreadId) {
        debug_assert!(self.has_room());
        self.threads.push_back(tid);
    }

    fn pop_front(&mut self) -> Option<ThreadId> {
        self.threads.pop_front()
    }
}

impl<K: Kernel + 'static> Condvar<K> {
    /// Creates a condition variable with an empty queue.
    pub fn new(kernel: &'static K, name: &str) -> SyncResult<Self> {
        let name = dup_name(name)?;
        let queue = WaitQueue::try_with_capacity(CONDVAR_QUEUE_INIT_CAPACITY)?;
        debug!("condvar {}: created", name);
        Ok(Self {
            kernel,
            name,
            inner: UPIntrFreeCell::new(CondvarInner { waiters: 0, queue }),
        })
    }

    /// Destroys the condition variable.
    ///
    /// ## Panics
    /// - If any thread is waiting on it
    pub fn destroy(self) {
        let chan = self.wait_channel();
        let (waiters, queued, sleepers) =
            self.inner.exclusive_session(self.kernel, |inner| {
                (inner.waiters, inner.queue.len(), self.kernel.sleepers(chan))
            });
        assert!(
            waiters == 0 && queued == 0 && sleepers == 0,
            "condvar {}: destroyed with {} waiter(s), {} queued, {} sleeping",
            self.name,
            waiters,
            queued,
            sleepers
        );
        debug!("condvar {}: destroyed", self.name);
    }

    /// Releases `lock`, sleeps until signaled, then re-acquires `lock`.
    ///
    /// Returns only once the calling thread holds `lock` again; taking it back
    /// may block a second time if another thread got there first. Callers
    /// re-check their condition in a loop, as the state may have changed
    /// before the lock was re-acquired.
    ///
    /// ## Panics
    /// - If the calling thread does not hold `lock`
    /// - If called from an interrupt handler
    pub fn wait(&self, lock: &Lock<K>) {
        assert!(
            lock.do_i_hold(),
            "condvar {}: wait without holding lock {}",
            self.name,
            lock.name()
        );
        assert!(
            !self.kernel.in_interrupt(),
            "condvar {}: wait in interrupt handler",
            self.name
        );
        let me = self.kernel.current();
        let chan = self.wait_channel();

        // Freed only after the critical section below has been left.
        let mut retired = None;
        let mut inner = self.reserve_slot(&mut retired);
        lock.release();
        inner.waiters += 1;
        inner.queue.push_back(me);
        debug_assert_eq!(inner.waiters, inner.queue.len());
        trace!("condvar {}: {} waits", self.name, me);
        while inner.queue.contains(me) {
            inner.sleep(chan);
        }
        let _intr = inner.into_intr_guard();
        lock.acquire();
    }

    /// Wakes the longest-waiting thread, if any.
    ///
    /// Returns whether a thread was woken.
    ///
    /// ## Panics
    /// - If the calling thread does not hold `lock`
    pub fn signal(&self, lock: &Lock<K>) -> bool {
        assert!(
            lock.do_i_hold(),
            "condvar {}: signal without holding lock {}",
            self.name,
            lock.name()
        );
        let mut inner = self.inner.exclusive_access(self.kernel);
        self.wake_head(&mut inner)
    }

    /// Wakes every thread waiting at the time of the call.
    ///
    /// Returns the number of threads woken. Each of them still re-acquires
    /// `lock` on its own when it runs.
    ///
    /// ## Panics
    /// - If the calling thread does not hold `lock`
    pub fn broadcast(&self, lock: &Lock<K>) -> usize {
        assert!(
            lock.do_i_hold(),
            "condvar {}: broadcast without holding lock {}",
            self.name,
            lock.name()
        );
        let mut inner = self.inner.exclusive_access(self.kernel);
        let mut woken = 0;
        while self.wake_head(&mut inner) {
            woken += 1;
        }
        assert!(inner.waiters == 0 && inner.queue.is_empty());
        woken
    }

    /// Threads currently between `wait` and being woken.
    pub fn waiters(&self) -> usize {
        self.inner.exclusive_session(self.kernel, |inner| inner.waiters)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait_channel(&self) -> WaitChannel {
        WaitChannel::of(self)
    }

    fn wake_head(&self, inner: &mut CondvarInner) -> bool {
        if inner.waiters == 0 {
            return false;
        }
        inner.waiters -= 1;
        match inner.queue.pop_front() {
            Some(next) => {
                trace!("condvar {}: wakes {}", self.name, next);
                self.kernel.wakeup_thread(next);
                true
            }
            None => panic!(
                "condvar {}: {} waiter(s) counted but queue is empty",
                self.name,
                inner.waiters + 1
            ),
        }
    }

    /// Enters the critical section with room for one more waiter.
    ///
    /// Growing the queue allocates with interrupts enabled; the bigger
    /// storage is swapped in under the critical section and the replaced one
    /// is handed back through `retired`.
    fn reserve_slot<'a>(
        &'a self,
        retired: &mut Option<WaitQueue>,
    ) -> UPIntrRefMut<'a, K, CondvarInner> {
        let mut spare: Option<WaitQueue> = None;
        loop {
            let mut inner = self.inner.exclusive_access(self.kernel);
            if inner.queue.has_room() {
                *retired = spare;
                return inner;
            }
            match spare.take() {
                Some(bigger) if bigger.capacity() > inner.queue.len() => {
                    *retired = Some(inner.queue.adopt(bigger));
                    return inner;
                }
                _ => {
                    let want = inner.queue.grown_capacity();
                    drop(inner);
                    spare = Some(WaitQueue::with_capacity(want));
                }
            }
        }
    }
}

impl<K: Kernel + 'static> fmt::Debug for Condvar<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("name", &self.name)
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::sim::{Machine, MachineFlags};

    #[test]
    fn queue_grows_outside_critical_section() {
        let mut queue = WaitQueue::try_with_capacity(1).unwrap();
        queue.push_back(ThreadId(1));
        assert!(!queue.has_room());
        let spare = WaitQueue::with_capacity(queue.grown_capacity());
        let old = queue.adopt(spare);
        assert!(old.is_empty());
        assert!(queue.has_room());
        queue.push_back(ThreadId(2));
        assert_eq!(queue.pop_front(), Some(ThreadId(1)));
        assert_eq!(queue.pop_front(), Some(ThreadId(2)));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn waiters_match_queue_length() {
        let m = Machine::boot(MachineFlags::STRICT_SLEEP);
        let cv = Condvar::new(m, "cv").unwrap();
        assert_eq!(cv.waiters(), 0);
        cv.inner.exclusive_session(m, |inner| {
            assert_eq!(inner.waiters, inner.queue.len());
            assert!(inner.queue.capacity() >= CONDVAR_QUEUE_INIT_CAPACITY);
        });
    }

    #[test]
    #[should_panic(expected = "destroyed with 1 waiter(s)")]
    fn destroy_with_queued_waiter_panics() {
        let m = Machine::boot(MachineFlags::STRICT_SLEEP);
        let cv = Condvar::new(m, "cv").unwrap();
        cv.inner.exclusive_session(m, |inner| {
            inner.waiters += 1;
            inner.queue.push_back(ThreadId(7));
        });
        cv.destroy();
    }

    #[test]
    #[should_panic(expected = "counted but queue is empty")]
    fn miscounted_waiter_is_fatal() {
        let m = Machine::boot(MachineFlags::STRICT_SLEEP);
        let cv = Condvar::new(m, "cv").unwrap();
        let lock = Lock::new(m, "lk").unwrap();
        cv.inner.exclusive_session(m, |inner| inner.waiters = 1);
        lock.acquire();
        cv.signal(&lock);
    }

    mod fake {
        use std::alloc::{GlobalAlloc, Layout, System};
        use std::cell::Cell;

        use crate::hal::{IntrControl, IntrLevel};
        use crate::task::{Scheduler, ThreadId, WaitChannel};

        thread_local! {
            static MASKED: Cell<bool> = const { Cell::new(false) };
            static RAISES: Cell<usize> = const { Cell::new(0) };
            static MASKED_ALLOCS: Cell<usize> = const { Cell::new(0) };
            static MASKED_FREES: Cell<usize> = const { Cell::new(0) };
        }

        fn masked_now() -> bool {
            MASKED.try_with(Cell::get).unwrap_or(false)
        }

        fn bump(counter: &'static std::thread::LocalKey<Cell<usize>>) {
            let _ = counter.try_with(|c| c.set(c.get() + 1));
        }

        /// Counts heap traffic that happens while this thread's [`FakeCpu`]
        /// has interrupts masked.
        pub struct CountingAlloc;

        unsafe impl GlobalAlloc for CountingAlloc {
            unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
                if masked_now() {
                    bump(&MASKED_ALLOCS);
                }
                System.alloc(layout)
            }

            unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
                if masked_now() {
                    bump(&MASKED_FREES);
                }
                System.dealloc(ptr, layout)
            }

            unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
                if masked_now() {
                    bump(&MASKED_ALLOCS);
                }
                System.realloc(ptr, layout, new_size)
            }
        }

        #[global_allocator]
        static ALLOC: CountingAlloc = CountingAlloc;

        /// Host thread as a CPU that never switches.
        pub struct FakeCpu;

        pub static CPU: FakeCpu = FakeCpu;

        unsafe impl IntrControl for FakeCpu {
            fn raise(&self) -> IntrLevel {
                bump(&RAISES);
                if MASKED.with(|m| m.replace(true)) {
                    IntrLevel::MASKED
                } else {
                    IntrLevel::ENABLED
                }
            }

            fn restore(&self, prev: IntrLevel) {
                MASKED.with(|m| m.set(prev.is_masked()));
            }

            fn in_interrupt(&self) -> bool {
                false
            }
        }

        impl Scheduler for FakeCpu {
            fn current(&self) -> ThreadId {
                ThreadId(1)
            }

            fn sleep(&self, chan: WaitChannel) {
                panic!("fake cpu cannot sleep on {:?}", chan);
            }

            fn wakeup(&self, _chan: WaitChannel) {}

            fn wakeup_thread(&self, _tid: ThreadId) {}

            fn sleepers(&self, _chan: WaitChannel) -> usize {
                0
            }
        }

        pub fn masked() -> bool {
            masked_now()
        }

        /// (raises, allocations while masked, frees while masked)
        pub fn counters() -> (usize, usize, usize) {
            (
                RAISES.with(Cell::get),
                MASKED_ALLOCS.with(Cell::get),
                MASKED_FREES.with(Cell::get),
            )
        }
    }

    #[test]
    fn full_queue_is_regrown_with_interrupts_enabled() {
        let cv = Condvar::new(&fake::CPU, "cv").unwrap();
        let full = cv.inner.exclusive_session(&fake::CPU, |inner| {
            while inner.queue.has_room() {
                inner.waiters += 1;
                inner.queue.push_back(ThreadId(inner.waiters));
            }
            inner.queue.capacity()
        });

        let (raises, allocs, frees) = fake::counters();
        let mut retired = None;
        let inner = cv.reserve_slot(&mut retired);
        assert!(fake::masked());
        assert!(inner.queue.has_room());
        assert_eq!(inner.queue.len(), full);
        assert!(inner.queue.contains(ThreadId(1)));
        match &retired {
            Some(old) => {
                assert!(old.is_empty());
                assert_eq!(old.capacity(), full);
            }
            None => panic!("old storage was not handed back"),
        }
        // left the section once to allocate, then came back
        assert_eq!(fake::counters().0, raises + 2);

        drop(inner.into_intr_guard());
        assert!(!fake::masked());
        drop(retired);
        assert_eq!(fake::counters(), (raises + 2, allocs, frees));
    }

    #[test]
    fn queue_with_room_is_kept() {
        let cv = Condvar::new(&fake::CPU, "cv").unwrap();
        let (raises, allocs, frees) = fake::counters();
        let mut retired = None;
        let inner = cv.reserve_slot(&mut retired);
        assert!(inner.queue.has_room());
        assert!(retired.is_none());
        drop(inner);
        assert_eq!(fake::counters(), (raises + 1, allocs, frees));
    }
}
