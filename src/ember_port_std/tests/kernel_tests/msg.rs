//! Message passing
use assert_matches::assert_matches;
use ember_kernel::{
    CreateFlags, Message, MsgInitQueueError, ReplyError, SendError, ThreadStatus, TimeoutError,
    TryReceiveError, TrySendError, PRIORITY_MAIN,
};
use ember_port_std::{spawn, Simulator};

use crate::{PidCell, SeqTracker};

fn leak_queue(len: usize) -> &'static mut [Message] {
    Box::leak(vec![Message::new(0, 0); len].into_boxed_slice())
}

#[test]
fn queue_is_fifo() {
    static MAIN: PidCell = PidCell::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        MAIN.set(k.current_pid().unwrap());
        k.msg_init_queue(leak_queue(4)).unwrap();
        assert_matches!(
            k.msg_init_queue(leak_queue(4)),
            Err(MsgInitQueueError::BadObjectState)
        );

        let sender = spawn(k, 6, CreateFlags::empty(), "sender", |k| {
            for i in 0..3 {
                // Doesn't block; the queue has room
                k.msg_send(MAIN.get(), Message::new(1, i)).unwrap();
            }
        })
        .unwrap();

        assert_eq!(k.status(sender), Some(ThreadStatus::Zombie));
        assert_eq!(k.msg_avail(), 3);
        for i in 0..3 {
            let msg = k.msg_receive();
            assert_eq!(msg.sender, Some(sender));
            assert_eq!((msg.kind, msg.content), (1, i));
        }
        assert_eq!(k.msg_avail(), 0);
        assert_matches!(k.msg_try_receive(), Err(TryReceiveError::WouldBlock));

        k.msg_send_to_self(Message::new(2, 42)).unwrap();
        let msg = k.msg_try_receive().unwrap();
        assert_eq!(msg.sender, Some(MAIN.get()));
        assert_eq!(msg.content, 42);

        assert_matches!(
            k.msg_send(MAIN.get(), Message::new(0, 0)),
            Err(SendError::BadParam)
        );
    });
}

#[test]
fn direct_to_waiting_receiver() {
    static SEQ: SeqTracker = SeqTracker::new();
    static MAIN: PidCell = PidCell::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        MAIN.set(k.current_pid().unwrap());

        let receiver = spawn(k, 6, CreateFlags::empty(), "receiver", |k| {
            SEQ.expect_and_replace(0, 1);
            let msg = k.msg_receive();
            SEQ.expect_and_replace(2, 3);
            assert_eq!(msg.sender, Some(MAIN.get()));
            assert_eq!(msg.content, 7);
        })
        .unwrap();

        SEQ.expect_and_replace(1, 2);
        assert_eq!(k.status(receiver), Some(ThreadStatus::BlockedReceive));
        k.msg_send(receiver, Message::new(0, 7)).unwrap();
        SEQ.expect_and_replace(3, 4);
    });
}

/// Without a queue, a sender blocks until the target receives.
#[test]
fn send_blocks_until_received() {
    static SEQ: SeqTracker = SeqTracker::new();
    static MAIN: PidCell = PidCell::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        MAIN.set(k.current_pid().unwrap());

        let receiver = spawn(k, PRIORITY_MAIN + 1, CreateFlags::empty(), "receiver", |k| {
            SEQ.expect_and_replace(1, 2);
            let msg = k.msg_receive();
            SEQ.expect_and_replace(3, 4);
            assert_eq!(msg.sender, Some(MAIN.get()));
            assert_eq!(msg.content, 5);
        })
        .unwrap();

        SEQ.expect_and_replace(0, 1);
        assert_matches!(
            k.msg_try_send(receiver, Message::new(1, 5)),
            Err(TrySendError::WouldBlock)
        );
        k.msg_send(receiver, Message::new(1, 5)).unwrap();
        SEQ.expect_and_replace(2, 3);

        k.sleep_for(10);
        SEQ.expect_and_replace(4, 5);
    });
}

#[test]
fn request_and_reply() {
    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let server = spawn(k, 6, CreateFlags::empty(), "server", |k| {
            for _ in 0..2 {
                let req = k.msg_receive();
                k.msg_reply(&req, Message::new(req.kind, req.content + 1))
                    .unwrap();
            }

            // The sender of this one isn't waiting for a reply
            let msg = k.msg_receive();
            assert_matches!(
                k.msg_reply(&msg, Message::new(0, 0)),
                Err(ReplyError::BadObjectState)
            );
            assert_matches!(
                k.msg_reply(&Message::new(0, 0), Message::new(0, 0)),
                Err(ReplyError::NoAccess)
            );
        })
        .unwrap();

        for i in 0..2 {
            let reply = k.msg_send_receive(server, Message::new(4, 10 * i)).unwrap();
            assert_eq!(reply.sender, Some(server));
            assert_eq!((reply.kind, reply.content), (4, 10 * i + 1));
        }
        k.msg_send(server, Message::new(9, 0)).unwrap();
        assert_eq!(k.status(server), Some(ThreadStatus::Zombie));
    });
}

#[test]
fn send_from_interrupt() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let main = k.current_pid().unwrap();

        let receiver = spawn(k, 6, CreateFlags::empty(), "receiver", |k| {
            SEQ.expect_and_replace(0, 1);
            let msg = k.msg_receive();
            SEQ.expect_and_replace(3, 4);
            assert_eq!(msg.sender, None);
            assert_eq!(msg.content, 33);
        })
        .unwrap();

        SEQ.expect_and_replace(1, 2);
        k.port().pend_interrupt(move |k| {
            // `main` has no queue and isn't receiving
            assert_matches!(
                k.msg_send_int(main, Message::new(3, 0)),
                Err(TrySendError::WouldBlock)
            );
            k.msg_send_int(receiver, Message::new(3, 33)).unwrap();
            SEQ.expect_and_replace(2, 3);
        });
        SEQ.expect_and_replace(4, 5);
    });
}

#[test]
fn receive_timeout() {
    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let start = k.now();
        assert_matches!(k.msg_receive_timeout(20), Err(TimeoutError::Timeout));
        assert!(k.now() >= start + 20);
        assert_matches!(k.msg_receive_timeout(0), Err(TimeoutError::Timeout));

        // Runs while the main thread waits
        let main = k.current_pid().unwrap();
        let sender = spawn(k, PRIORITY_MAIN + 1, CreateFlags::empty(), "sender", move |k| {
            k.msg_send(main, Message::new(1, 1)).unwrap();
        })
        .unwrap();

        let msg = k.msg_receive_timeout(1000).unwrap();
        assert_eq!(msg.sender, Some(sender));
    });
}

/// A thread blocked on a target that exits is released with an error.
#[test]
fn target_exits() {
    static SEQ: SeqTracker = SeqTracker::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let quitter = spawn(k, PRIORITY_MAIN + 1, CreateFlags::empty(), "quitter", |_| {
            SEQ.expect_and_replace(0, 1);
        })
        .unwrap();

        assert_matches!(
            k.msg_send(quitter, Message::new(0, 0)),
            Err(SendError::NoAccess)
        );
        SEQ.expect_and_replace(1, 2);
        assert_eq!(k.status(quitter), Some(ThreadStatus::Zombie));
        assert_matches!(
            k.msg_send(quitter, Message::new(0, 0)),
            Err(SendError::NoAccess)
        );

        // Takes the request but never replies
        let ghost = spawn(k, PRIORITY_MAIN + 1, CreateFlags::empty(), "ghost", |k| {
            SEQ.expect_and_replace(2, 3);
            k.msg_receive();
        })
        .unwrap();

        assert_matches!(
            k.msg_send_receive(ghost, Message::new(0, 0)),
            Err(SendError::NoAccess)
        );
        SEQ.expect_and_replace(3, 4);
    });
}

/// A full queue makes senders wait in priority order. Each `msg_receive`
/// moves the first waiting message into the freed slot.
#[test]
fn blocked_senders_refill_queue() {
    static SEQ: SeqTracker = SeqTracker::new();
    static MAIN: PidCell = PidCell::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        MAIN.set(k.current_pid().unwrap());
        k.msg_init_queue(leak_queue(1)).unwrap();

        let sender = spawn(k, 6, CreateFlags::empty(), "sender", |k| {
            SEQ.expect_and_replace(0, 1);
            k.msg_send(MAIN.get(), Message::new(1, 1)).unwrap();
            // The queue is full now
            k.msg_send(MAIN.get(), Message::new(1, 2)).unwrap();
            SEQ.expect_and_replace(4, 5);
        })
        .unwrap();

        SEQ.expect_and_replace(1, 2);
        let caller = spawn(k, 5, CreateFlags::empty(), "caller", |k| {
            SEQ.expect_and_replace(2, 3);
            let reply = k.msg_send_receive(MAIN.get(), Message::new(2, 3)).unwrap();
            SEQ.expect_and_replace(6, 7);
            assert_eq!(reply.sender, Some(MAIN.get()));
            assert_eq!(reply.content, 4);
        })
        .unwrap();

        SEQ.expect_and_replace(3, 4);
        assert_eq!(k.msg_avail(), 1);
        assert_eq!(k.status(sender), Some(ThreadStatus::BlockedSend));
        assert_eq!(k.status(caller), Some(ThreadStatus::BlockedSend));

        let msg = k.msg_receive();
        assert_eq!((msg.sender, msg.content), (Some(sender), 1));
        // `caller` has the higher priority. Its request was taken, so it now
        // waits for the reply.
        assert_eq!(k.status(caller), Some(ThreadStatus::BlockedReply));
        assert_eq!(k.status(sender), Some(ThreadStatus::BlockedSend));
        assert_eq!(k.msg_avail(), 1);

        // Wakes up `sender`, which preempts this thread
        let request = k.msg_receive();
        SEQ.expect_and_replace(5, 6);
        assert_eq!((request.sender, request.content), (Some(caller), 3));
        assert_eq!(k.status(sender), Some(ThreadStatus::Zombie));

        k.msg_reply(&request, Message::new(2, request.content + 1))
            .unwrap();
        SEQ.expect_and_replace(7, 8);

        let msg = k.msg_receive();
        assert_eq!((msg.sender, msg.content), (Some(sender), 2));
        assert_eq!(k.msg_avail(), 0);
    });
}

/// Only the thread a request was sent to can reply to it.
#[test]
fn reply_from_other_thread_is_rejected() {
    static SEQ: SeqTracker = SeqTracker::new();
    static MAIN: PidCell = PidCell::new();
    static OTHER: PidCell = PidCell::new();

    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        MAIN.set(k.current_pid().unwrap());

        let other = spawn(k, 6, CreateFlags::empty(), "other", |k| {
            SEQ.expect_and_replace(0, 1);
            let old = k.msg_receive();
            SEQ.expect_and_replace(2, 3);
            assert_eq!(old.sender, Some(MAIN.get()));

            k.thread_sleep();
            SEQ.expect_and_replace(5, 6);

            // The main thread is waiting for `server`, not for this thread
            assert_eq!(k.status(MAIN.get()), Some(ThreadStatus::BlockedReply));
            assert_matches!(
                k.msg_reply(&old, Message::new(99, 0)),
                Err(ReplyError::BadObjectState)
            );
            assert_eq!(k.status(MAIN.get()), Some(ThreadStatus::BlockedReply));
        })
        .unwrap();
        OTHER.set(other);

        SEQ.expect_and_replace(1, 2);
        k.msg_send(other, Message::new(1, 0)).unwrap();

        SEQ.expect_and_replace(3, 4);
        let server = spawn(k, PRIORITY_MAIN + 1, CreateFlags::empty(), "server", |k| {
            SEQ.expect_and_replace(4, 5);
            let req = k.msg_receive();
            k.thread_wakeup(OTHER.get()).unwrap();

            SEQ.expect_and_replace(6, 7);
            k.msg_reply(&req, Message::new(req.kind, req.content + 1))
                .unwrap();
        })
        .unwrap();

        let reply = k.msg_send_receive(server, Message::new(2, 10)).unwrap();
        SEQ.expect_and_replace(7, 8);
        assert_eq!(reply.sender, Some(server));
        assert_eq!((reply.kind, reply.content), (2, 11));
    });
}

#[test]
fn reply_from_interrupt() {
    let sim = Simulator::new();
    sim.run_main(PRIORITY_MAIN, |k| {
        let server = spawn(k, 6, CreateFlags::empty(), "server", |k| {
            let req = k.msg_receive();
            k.port().pend_interrupt(move |k| {
                k.msg_reply(&req, Message::new(req.kind, req.content * 3))
                    .unwrap();
            });
        })
        .unwrap();

        let reply = k.msg_send_receive(server, Message::new(5, 7)).unwrap();
        assert_eq!(reply.sender, None);
        assert_eq!((reply.kind, reply.content), (5, 21));
    });
}
