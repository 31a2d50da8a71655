//! Mutex ownership hand-off and cancellation
use assert_matches::assert_matches;
use ember_kernel::{CreateFlags, LockMutexError, Mutex, ThreadStatus, PRIORITY_MAIN};
use ember_port_std::{spawn, Simulator};

use crate::SeqTracker;

/// Waiters are handed the mutex in priority order, without the mutex ever
/// becoming unlocked in between.
#[test]
fn hand_off_by_priority() {
    static SEQ: SeqTracker = SeqTracker::new();
    static M: Mutex = Mutex::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        M.lock(k).unwrap();
        SEQ.expect_and_replace(0, 1);

        // Each of these preempts the main thread and blocks on `M`. They are
        // created in increasing priority order so that they preempt the main
        // thread even if it inherits the priority of a waiter.
        spawn(k, 6, CreateFlags::empty(), "c", |k| {
            SEQ.expect_and_replace(1, 2);
            M.lock(k).unwrap();
            SEQ.expect_and_replace(7, 8);
            M.unlock(k);
        })
        .unwrap();
        spawn(k, 5, CreateFlags::empty(), "a", |k| {
            SEQ.expect_and_replace(2, 3);
            M.lock(k).unwrap();
            SEQ.expect_and_replace(6, 7);
            M.unlock(k);
        })
        .unwrap();
        spawn(k, 3, CreateFlags::empty(), "b", |k| {
            SEQ.expect_and_replace(3, 4);
            M.lock(k).unwrap();
            SEQ.expect_and_replace(5, 6);
            assert!(M.is_locked(k));
            M.unlock(k);
        })
        .unwrap();

        SEQ.expect_and_replace(4, 5);
        M.unlock(k);

        SEQ.expect_and_replace(8, 9);
        assert!(!M.is_locked(k));
    });
}

#[test]
fn equal_priorities_are_served_in_order() {
    static SEQ: SeqTracker = SeqTracker::new();
    static M: Mutex = Mutex::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        M.lock(k).unwrap();

        for i in 0..3 {
            spawn(k, 6, CreateFlags::WITHOUT_YIELD, "waiter", move |k| {
                SEQ.expect_and_replace(i, i + 1);
                M.lock(k).unwrap();
                SEQ.expect_and_replace(3 + i, 4 + i);
                M.unlock(k);
            })
            .unwrap();
        }

        // Let the waiters block on `M` in the order they were created
        k.sleep_for(10);
        assert_eq!(SEQ.get(), 3);

        M.unlock(k);
        SEQ.expect_and_replace(6, 7);
    });
}

#[test]
fn unlock_from_interrupt() {
    static SEQ: SeqTracker = SeqTracker::new();
    static M: Mutex = Mutex::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        M.lock(k).unwrap();

        spawn(k, 6, CreateFlags::empty(), "waiter", |k| {
            SEQ.expect_and_replace(0, 1);
            M.lock(k).unwrap();
            SEQ.expect_and_replace(3, 4);
            M.unlock(k);
        })
        .unwrap();

        SEQ.expect_and_replace(1, 2);
        k.port().pend_interrupt(|k| {
            // The switch to the waiter is deferred until the handler exits
            M.unlock(k);
            SEQ.expect_and_replace(2, 3);
        });

        SEQ.expect_and_replace(4, 5);
    });
}

#[test]
fn cancel_before_lock() {
    static M: Mutex = Mutex::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let me = k.current_pid().unwrap();

        M.cancel(k, me).unwrap();
        assert_matches!(M.lock(k), Err(LockMutexError::Canceled));
        assert!(!M.is_locked(k));

        // The cancellation is consumed by a single call
        assert_matches!(M.lock(k), Ok(()));
        M.unlock(k);
    });
}

#[test]
fn cancel_while_waiting() {
    static SEQ: SeqTracker = SeqTracker::new();
    static M: Mutex = Mutex::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        M.lock(k).unwrap();

        let waiter = spawn(k, 6, CreateFlags::empty(), "waiter", |k| {
            SEQ.expect_and_replace(0, 1);
            assert_matches!(M.lock(k), Err(LockMutexError::Canceled));
            SEQ.expect_and_replace(2, 3);
        })
        .unwrap();
        assert_eq!(k.status(waiter), Some(ThreadStatus::BlockedMutex));

        SEQ.expect_and_replace(1, 2);
        k.port().pend_interrupt(move |k| {
            M.cancel(k, waiter).unwrap();
        });

        SEQ.expect_and_replace(3, 4);

        // The mutex still belongs to the main thread
        assert!(M.is_locked(k));
        M.unlock(k);
        assert!(!M.is_locked(k));
    });
}

#[test]
fn unlock_and_sleep() {
    static SEQ: SeqTracker = SeqTracker::new();
    static M: Mutex = Mutex::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let sleeper = spawn(k, 6, CreateFlags::empty(), "sleeper", |k| {
            M.lock(k).unwrap();
            SEQ.expect_and_replace(0, 1);
            M.unlock_and_sleep(k);
            SEQ.expect_and_replace(2, 3);
        })
        .unwrap();

        SEQ.expect_and_replace(1, 2);
        assert_eq!(k.status(sleeper), Some(ThreadStatus::Sleeping));
        assert!(M.try_lock(k));
        M.unlock(k);

        k.thread_wakeup(sleeper).unwrap();
        SEQ.expect_and_replace(3, 4);
    });
}
