/// Wait-queue slots a condition variable allocates when it is created.
pub const CONDVAR_QUEUE_INIT_CAPACITY: usize = 1;

/// Factor a full condition-variable wait queue is grown by before a wait.
pub const CONDVAR_QUEUE_GROWTH: usize = 2;
