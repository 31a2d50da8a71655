//! Event queues
use assert_matches::assert_matches;
use ember_kernel::{
    CreateFlags, Event, EventHandler, EventQueue, ThreadStatus, TimeoutError, PRIORITY_MAIN,
    THREAD_FLAG_EVENT,
};
use ember_port_std::{spawn, Simulator};
use std::ptr;

use crate::SeqTracker;

static SEQ: SeqTracker = SeqTracker::new();

/// Advances `SEQ` from `from` to `to`.
struct Expect {
    from: usize,
    to: usize,
}

impl EventHandler for Expect {
    fn handle(&self, _: &'static Event) {
        SEQ.expect_and_replace(self.from, self.to);
    }
}

struct Ignore;

impl EventHandler for Ignore {
    fn handle(&self, _: &'static Event) {}
}

#[test]
fn run_loop_in_order() {
    static QUEUE: EventQueue = EventQueue::new();
    static E1: Event = Event::new(&Expect { from: 1, to: 2 });
    static E2: Event = Event::new(&Expect { from: 2, to: 3 });
    static E3: Event = Event::new(&Expect { from: 3, to: 4 });

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let worker = spawn(k, 6, CreateFlags::empty(), "events", |k| {
            QUEUE.run_loop(k);
        })
        .unwrap();
        assert_eq!(k.status(worker), Some(ThreadStatus::BlockedFlagAny));

        k.port().pend_interrupt(|k| {
            QUEUE.post(k, &E1);
            QUEUE.post(k, &E2);
            // Already pending
            QUEUE.post(k, &E1);
            QUEUE.post(k, &E3);
            assert!(QUEUE.is_pending(k, &E2));
            SEQ.expect_and_replace(0, 1);
        });

        SEQ.expect_and_replace(4, 5);
        assert!(!QUEUE.is_pending(k, &E1));
        assert_eq!(k.status(worker), Some(ThreadStatus::BlockedFlagAny));
    });
}

#[test]
fn cancel_and_get() {
    static QUEUE: EventQueue = EventQueue::new();
    static E1: Event = Event::new(&Ignore);
    static E2: Event = Event::new(&Ignore);
    static E3: Event = Event::new(&Ignore);

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        QUEUE.post(k, &E1);
        QUEUE.post(k, &E2);
        QUEUE.post(k, &E3);

        QUEUE.cancel(k, &E2);
        assert!(!QUEUE.is_pending(k, &E2));
        // Not pending; no effect
        QUEUE.cancel(k, &E2);

        assert_matches!(QUEUE.get(k), Some(e) if ptr::eq(e, &E1));
        assert_matches!(QUEUE.get(k), Some(e) if ptr::eq(e, &E3));
        assert_matches!(QUEUE.get(k), None);

        // Canceling the last event keeps the queue usable
        QUEUE.post(k, &E1);
        QUEUE.post(k, &E3);
        QUEUE.cancel(k, &E3);
        QUEUE.post(k, &E2);
        assert_matches!(QUEUE.wait(k), e if ptr::eq(e, &E1));
        assert_matches!(QUEUE.wait(k), e if ptr::eq(e, &E2));
    });
}

#[test]
fn wait_timeout() {
    static QUEUE: EventQueue = EventQueue::new();
    static E1: Event = Event::new(&Ignore);

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let start = k.now();
        assert_matches!(QUEUE.wait_timeout(k, 20), Err(TimeoutError::Timeout));
        assert!(k.now() >= start + 20);

        spawn(k, PRIORITY_MAIN + 1, CreateFlags::empty(), "poster", |k| {
            QUEUE.post(k, &E1);
        })
        .unwrap();
        assert_matches!(QUEUE.wait_timeout(k, 1000), Ok(e) if ptr::eq(e, &E1));
    });
}

#[test]
#[should_panic = "claimed"]
fn second_waiter() {
    static QUEUE: EventQueue = EventQueue::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        spawn(k, 6, CreateFlags::empty(), "first", |k| {
            QUEUE.wait(k);
        })
        .unwrap();
        QUEUE.wait(k);
    });
}

/// The claim of a thread that has exited is void, also after its PID is
/// reused.
#[test]
fn claim_ends_with_thread() {
    static QUEUE: EventQueue = EventQueue::new();
    static E1: Event = Event::new(&Ignore);
    static E2: Event = Event::new(&Ignore);
    static E3: Event = Event::new(&Ignore);

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let first = spawn(k, 6, CreateFlags::empty(), "first", |k| {
            assert_matches!(QUEUE.wait(k), e if ptr::eq(e, &E1));
        })
        .unwrap();

        QUEUE.post(k, &E1);
        assert_eq!(k.status(first), Some(ThreadStatus::Zombie));
        k.thread_kill_zombie(first).unwrap();

        let second = spawn(k, 6, CreateFlags::empty(), "second", |k| {
            k.thread_sleep();
            assert_eq!(k.thread_flags_clear(THREAD_FLAG_EVENT), 0);
        })
        .unwrap();
        assert_eq!(second, first);
        assert_eq!(k.status(second), Some(ThreadStatus::Sleeping));

        // `second` doesn't inherit the claim
        QUEUE.post(k, &E2);
        k.thread_wakeup(second).unwrap();
        assert_eq!(k.status(second), Some(ThreadStatus::Zombie));

        assert_matches!(QUEUE.wait(k), e if ptr::eq(e, &E2));

        spawn(k, PRIORITY_MAIN + 1, CreateFlags::empty(), "poster", |k| {
            QUEUE.post(k, &E3);
        })
        .unwrap();
        assert_matches!(QUEUE.wait(k), e if ptr::eq(e, &E3));
    });
}
