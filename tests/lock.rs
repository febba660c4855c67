use std::sync::Arc;

use ksync::sim::{Machine, MachineFlags, TaskStatus, BOOT};
use ksync::{Lock, ThreadId};

fn machine() -> &'static Machine {
    Machine::boot(MachineFlags::STRICT_SLEEP)
}

#[test]
fn contended_acquire_completes_after_release() {
    let m = machine();
    let lock = Arc::new(Lock::new(m, "lk").unwrap());
    let seen: Arc<spin::Mutex<Option<(bool, Option<ThreadId>)>>> =
        Arc::new(spin::Mutex::new(None));

    lock.acquire();
    let (l, s) = (Arc::clone(&lock), Arc::clone(&seen));
    let b = m.spawn("b", move || {
        l.acquire();
        *s.lock() = Some((l.do_i_hold(), l.holder()));
        l.release();
    });

    m.yield_now();
    assert_eq!(m.status(b), Some(TaskStatus::Blocked(lock.wait_channel())));
    assert!(lock.do_i_hold());
    assert_eq!(lock.holder(), Some(BOOT));

    lock.release();
    assert!(!lock.do_i_hold());
    m.join_all();

    assert_eq!(*seen.lock(), Some((true, Some(b))));
    assert!(!lock.is_held());
}

#[test]
fn only_the_holder_holds() {
    let m = machine();
    let lock = Arc::new(Lock::new(m, "lk").unwrap());
    let seen = Arc::new(spin::Mutex::new(None));

    lock.acquire();
    let (l, s) = (Arc::clone(&lock), Arc::clone(&seen));
    m.spawn("other", move || {
        *s.lock() = Some((l.do_i_hold(), l.is_held(), l.try_acquire()));
    });
    m.join_all();

    assert_eq!(*seen.lock(), Some((false, true, false)));
    assert!(lock.do_i_hold());
    lock.release();
}

#[test]
fn mutual_exclusion_under_preemption() {
    let m = Machine::boot(MachineFlags::PREEMPT | MachineFlags::STRICT_SLEEP);
    let lock = Arc::new(Lock::new(m, "lk").unwrap());
    // (holders now, most holders seen, critical sections run)
    let inside = Arc::new(spin::Mutex::new((0usize, 0usize, 0usize)));

    for i in 0..4 {
        let lock = Arc::clone(&lock);
        let inside = Arc::clone(&inside);
        m.spawn(&format!("worker{}", i), move || {
            for _ in 0..8 {
                lock.acquire();
                assert!(lock.do_i_hold());
                {
                    let mut seen = inside.lock();
                    seen.0 += 1;
                    seen.1 = seen.1.max(seen.0);
                    seen.2 += 1;
                }
                m.yield_now();
                inside.lock().0 -= 1;
                lock.release();
            }
        });
    }
    m.join_all();

    assert_eq!(*inside.lock(), (0, 1, 32));
    assert!(!lock.is_held());
}

#[test]
fn try_acquire_takes_a_free_lock() {
    let m = machine();
    let lock = Lock::new(m, "lk").unwrap();
    assert!(lock.try_acquire());
    assert!(lock.do_i_hold());
    lock.release();
    lock.destroy();
}

#[test]
#[should_panic(expected = "recursive acquire")]
fn recursive_acquire_is_fatal() {
    let m = machine();
    let lock = Lock::new(m, "lk").unwrap();
    lock.acquire();
    lock.acquire();
}

#[test]
#[should_panic(expected = "but not held")]
fn release_of_free_lock_is_fatal() {
    let m = machine();
    let lock = Lock::new(m, "lk").unwrap();
    lock.release();
}

#[test]
#[should_panic(expected = "but held by tid 0")]
fn release_by_non_holder_is_fatal() {
    let m = machine();
    let lock = Arc::new(Lock::new(m, "lk").unwrap());
    lock.acquire();
    let l = Arc::clone(&lock);
    m.spawn("thief", move || l.release());
    m.join_all();
}

#[test]
#[should_panic(expected = "acquire in interrupt handler")]
fn acquire_in_interrupt_is_fatal() {
    let m = machine();
    let lock = Lock::new(m, "lk").unwrap();
    m.interrupt(|| lock.acquire());
}

#[test]
#[should_panic(expected = "destroyed while held")]
fn destroy_while_held_is_fatal() {
    let m = machine();
    let lock = Lock::new(m, "lk").unwrap();
    lock.acquire();
    lock.destroy();
}
