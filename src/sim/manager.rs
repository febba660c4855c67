//! Ready queue of the simulated CPU.
//!
//! Plain FIFO: no time slices, no priorities. Whatever was made ready first
//! runs first.

use alloc::collections::VecDeque;

use crate::task::{ThreadId, WaitChannel};

/// Scheduling state of a simulated thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// In the ready queue.
    Ready,
    /// Owns the CPU.
    Running,
    /// Asleep on a wait channel until someone wakes it.
    Blocked(WaitChannel),
    /// Returned from its entry closure, or panicked.
    Exited,
}

/// Run queue of the simulated CPU.
///
/// ## Fields
/// - `ready_queue`: threads in `Ready` state, next to run at the front
pub struct TaskManager {
    ready_queue: VecDeque<ThreadId>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            ready_queue: VecDeque::new(),
        }
    }

    pub fn add(&mut self, tid: ThreadId) {
        self.ready_queue.push_back(tid);
    }

    pub fn fetch(&mut self) -> Option<ThreadId> {
        self.ready_queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.ready_queue.is_empty()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
