//! Thread lifecycle and scheduling
use assert_matches::assert_matches;
use ember_kernel::{CreateFlags, KillZombieError, ThreadStatus, WakeupError, PRIORITY_MAIN};
use ember_port_std::{spawn, SimConfig, Simulator};

use crate::SeqTracker;

#[test]
fn zombie_is_reaped_and_pid_reused() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let stack_size = k.port().config().stack_size;
        let count = k.thread_count();

        let child = spawn(k, 6, CreateFlags::empty(), "child", |_| {
            SEQ.expect_and_replace(0, 1);
        })
        .unwrap();

        // The child has finished, but its slot is still taken
        SEQ.expect_and_replace(1, 2);
        assert_eq!(k.status(child), Some(ThreadStatus::Zombie));
        assert_eq!(k.name(child), Some("child"));
        assert_eq!(k.thread_count(), count + 1);
        assert_matches!(k.thread_wakeup(child), Err(WakeupError::BadObjectState));

        let stack = k.thread_kill_zombie(child).unwrap();
        assert_eq!(stack.len(), stack_size);
        assert_eq!(k.status(child), None);
        assert_eq!(k.thread_count(), count);
        assert_matches!(k.thread_kill_zombie(child), Err(KillZombieError::NoAccess));

        // The lowest free slot is reused
        let child2 = spawn(k, 6, CreateFlags::empty(), "child2", |_| {
            SEQ.expect_and_replace(2, 3);
        })
        .unwrap();
        assert_eq!(child2, child);
        assert_eq!(k.name(child2), Some("child2"));
        SEQ.expect_and_replace(3, 4);
    });
}

#[test]
fn sleep_and_wakeup() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let sleeper = spawn(k, 6, CreateFlags::empty(), "sleeper", |k| {
            SEQ.expect_and_replace(0, 1);
            k.thread_sleep();
            SEQ.expect_and_replace(2, 3);
        })
        .unwrap();

        SEQ.expect_and_replace(1, 2);
        assert_eq!(k.status(sleeper), Some(ThreadStatus::Sleeping));
        k.thread_wakeup(sleeper).unwrap();
        SEQ.expect_and_replace(3, 4);
    });
}

#[test]
fn created_sleeping() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let child = spawn(k, 6, CreateFlags::SLEEPING, "child", |_| {
            SEQ.expect_and_replace(1, 2);
        })
        .unwrap();

        SEQ.expect_and_replace(0, 1);
        assert_eq!(k.status(child), Some(ThreadStatus::Sleeping));
        k.thread_wakeup(child).unwrap();
        SEQ.expect_and_replace(2, 3);
    });
}

#[test]
fn yield_among_equals() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        // Same priority; doesn't preempt
        spawn(k, PRIORITY_MAIN, CreateFlags::empty(), "peer", |k| {
            SEQ.expect_and_replace(1, 2);
            k.thread_yield();
            SEQ.expect_and_replace(3, 4);
        })
        .unwrap();

        SEQ.expect_and_replace(0, 1);
        k.thread_yield();
        SEQ.expect_and_replace(2, 3);
        k.thread_yield();
        SEQ.expect_and_replace(4, 5);
    });
}

#[test]
fn set_priority_preempts() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let child = spawn(k, PRIORITY_MAIN + 1, CreateFlags::empty(), "child", |_| {
            SEQ.expect_and_replace(1, 2);
        })
        .unwrap();

        SEQ.expect_and_replace(0, 1);
        assert_eq!(k.status(child), Some(ThreadStatus::Pending));
        k.set_priority(child, PRIORITY_MAIN - 1).unwrap();
        SEQ.expect_and_replace(2, 3);
    });
}

#[test]
fn sleep_for() {
    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let start = k.now();
        k.sleep_for(30);
        assert!(k.now() >= start + 30);

        // A deadline in the past doesn't block
        k.sleep_until(start);
    });
}

#[test]
fn interrupt_context() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::with_config(SimConfig {
        tick: std::time::Duration::from_micros(500),
        ..SimConfig::default()
    });
    sim.run_main(PRIORITY_MAIN, |k| {
        assert!(k.current_pid().is_some());

        k.port().pend_interrupt(|k| {
            SEQ.expect_and_replace(0, 1);
            assert_eq!(k.current_pid(), None);
            assert!(k.port().config().tick < std::time::Duration::from_millis(1));
        });
        SEQ.expect_and_replace(1, 2);
    });

    // An interrupt pended by an outside thread is taken while the CPU is
    // idle
    let (send, recv) = std::sync::mpsc::channel();
    sim.pend_interrupt(move |k| {
        send.send(k.current_pid()).unwrap();
    });
    assert_eq!(recv.recv().unwrap(), None);
}

#[test]
#[should_panic = "boom"]
fn panic_is_propagated() {
    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        spawn(k, 6, CreateFlags::empty(), "child", |_| panic!("boom")).unwrap();
    });
}
