//! Thread flags
use assert_matches::assert_matches;
use ember_kernel::{CreateFlags, NoAccessError, ThreadStatus, TimeoutError, PRIORITY_MAIN};
use ember_port_std::{spawn, Simulator};

use crate::SeqTracker;

#[test]
fn wait_modes() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let waiter = spawn(k, 6, CreateFlags::empty(), "waiter", |k| {
            SEQ.expect_and_replace(0, 1);
            assert_eq!(k.thread_flags_wait_any(0b110), 0b100);
            SEQ.expect_and_replace(2, 3);

            // 0b1000 is still set
            assert_eq!(k.thread_flags_wait_all(0b11000), 0b11000);
            SEQ.expect_and_replace(4, 5);

            let start = k.now();
            assert_matches!(
                k.thread_flags_wait_any_timeout(0x100, 20),
                Err(TimeoutError::Timeout)
            );
            assert!(k.now() >= start + 20);
            SEQ.expect_and_replace(6, 7);

            // One flag per call, lowest first
            assert_eq!(k.thread_flags_wait_one(0b110), 0b010);
            SEQ.expect_and_replace(8, 9);
            assert_eq!(k.thread_flags_wait_one(0b110), 0b100);

            assert_eq!(k.thread_flags_clear(0xffff), 0);
            SEQ.expect_and_replace(9, 10);
        })
        .unwrap();

        SEQ.expect_and_replace(1, 2);
        k.thread_flags_set(waiter, 0b1000).unwrap();
        assert_eq!(k.status(waiter), Some(ThreadStatus::BlockedFlagAny));
        k.thread_flags_set(waiter, 0b0100).unwrap();

        SEQ.expect_and_replace(3, 4);
        assert_eq!(k.status(waiter), Some(ThreadStatus::BlockedFlagAll));
        k.port().pend_interrupt(move |k| {
            k.thread_flags_set(waiter, 0x10).unwrap();
        });

        SEQ.expect_and_replace(5, 6);
        k.sleep_for(100);

        SEQ.expect_and_replace(7, 8);
        k.thread_flags_set(waiter, 0b0110).unwrap();

        SEQ.expect_and_replace(10, 11);
        assert_matches!(
            k.thread_flags_set(waiter, 1),
            Err(NoAccessError::NoAccess)
        );
    });
}

#[test]
fn already_set() {
    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let me = k.current_pid().unwrap();
        k.thread_flags_set(me, 0b101).unwrap();

        // Doesn't block
        assert_eq!(k.thread_flags_wait_any(0b1111), 0b101);
        assert_eq!(k.thread_flags_clear(0b101), 0);

        k.thread_flags_set(me, 0b11).unwrap();
        assert_eq!(k.thread_flags_clear(0b10), 0b10);
        assert_matches!(k.thread_flags_wait_any_timeout(0b1, 0), Ok(0b1));
    });
}
