//! Message passing
//!
//! Every thread can receive [`Message`]s. A message sent to a thread that is
//! waiting in [`Kernel::msg_receive`] is handed over directly. Otherwise it's
//! stored in the target's message queue, if the target has one
//! ([`Kernel::msg_init_queue`]) and it has room. If neither is possible, a
//! blocking sender waits in the target's sender list until the target
//! receives the message.
use core::{fmt, mem};

use crate::{
    error::{MsgInitQueueError, ReplyError, SendError, TimeoutError, TryReceiveError, TrySendError},
    klock::{self, CpuLockGuard},
    state,
    thread::ThreadStatus,
    timeout,
    utils::intrusive_list::ListHead,
    wait::{self, Membership, WaitResult},
    Kernel, Pid, Port, Ticks,
};

mod bus;
pub use self::bus::MsgBus;

/// A message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Message {
    /// The sending thread, filled in by the kernel. `None` if the message
    /// was sent from an interrupt context.
    pub sender: Option<Pid>,
    /// The application-defined message type.
    pub kind: u16,
    pub content: u32,
}

impl Message {
    pub const fn new(kind: u16, content: u32) -> Self {
        Self {
            sender: None,
            kind,
            content,
        }
    }
}

/// A ring buffer of messages.
pub(crate) struct MsgQueue {
    buf: &'static mut [Message],
    read: usize,
    len: usize,
}

impl MsgQueue {
    fn new(buf: &'static mut [Message]) -> Self {
        debug_assert!(!buf.is_empty());
        Self {
            buf,
            read: 0,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Append `msg`. Returns `false` if the queue is full.
    fn push(&mut self, msg: Message) -> bool {
        if self.len == self.buf.len() {
            return false;
        }
        let i = (self.read + self.len) % self.buf.len();
        self.buf[i] = msg;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<Message> {
        if self.len == 0 {
            return None;
        }
        let msg = self.buf[self.read];
        self.read = (self.read + 1) % self.buf.len();
        self.len -= 1;
        Some(msg)
    }
}

impl fmt::Debug for MsgQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MsgQueue({}/{})", self.len, self.buf.len())
    }
}

/// The message-related data of a waiting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgWait {
    None,
    /// `BlockedSend`: the message to be taken by the target. `reply` is
    /// set by [`Kernel::msg_send_receive`].
    Send { msg: Message, reply: bool },
    /// `BlockedReceive`: filled in by a sender that hands a message over.
    Receive(Option<Message>),
    /// `BlockedReply`: filled in by [`Kernel::msg_reply`].
    Reply { from: Pid, reply: Option<Message> },
}

/// Per-thread message passing state.
#[derive(Debug)]
pub(crate) struct ThreadMsgState {
    queue: Option<MsgQueue>,
    /// Threads in `BlockedSend` targeting this thread, in priority order.
    pub(crate) senders: ListHead<Pid>,
    wait: MsgWait,
}

impl ThreadMsgState {
    pub(crate) const fn new() -> Self {
        Self {
            queue: None,
            senders: ListHead::new(),
            wait: MsgWait::None,
        }
    }
}

enum Delivery {
    /// Handed over to the target waiting in `msg_receive`.
    Direct,
    Queued,
    /// The target can't accept the message right now.
    Full,
}

/// Check that `target` is a live thread.
fn expect_alive<P: Port, const N: usize>(lock: &CpuLockGuard<'_, P, N>, target: Pid) -> Result<(), SendError> {
    match lock.threads.get(target) {
        Some(tcb) if tcb.status != ThreadStatus::Zombie => Ok(()),
        _ => Err(SendError::NoAccess),
    }
}

/// Give `msg` to `target` without blocking. The caller is responsible for
/// calling `dispatch` afterwards.
fn deliver<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, target: Pid, msg: Message) -> Delivery {
    let tcb = &mut lock.threads[target];
    if tcb.status == ThreadStatus::BlockedReceive {
        tcb.msg.wait = MsgWait::Receive(Some(msg));
        wait::wake(lock, target, WaitResult::Woken);
        Delivery::Direct
    } else if tcb.msg.queue.as_mut().map_or(false, |q| q.push(msg)) {
        Delivery::Queued
    } else {
        Delivery::Full
    }
}

/// Non-blocking send, usable from any context.
pub(crate) fn try_send_locked<P: Port, const N: usize>(
    lock: &mut CpuLockGuard<'_, P, N>,
    sender: Option<Pid>,
    target: Pid,
    mut msg: Message,
) -> Result<(), TrySendError> {
    if sender == Some(target) {
        return Err(TrySendError::BadParam);
    }
    expect_alive(lock, target)?;

    msg.sender = sender;
    match deliver(lock, target, msg) {
        Delivery::Direct | Delivery::Queued => Ok(()),
        Delivery::Full => Err(TrySendError::WouldBlock),
    }
}

/// Take a message from `sender`, which is in `me`'s sender list. A sender
/// waiting for a reply moves on to `BlockedReply`; others are woken up.
fn take_from_sender<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, me: Pid, sender: Pid) -> Message {
    let (msg, reply) = match lock.threads[sender].msg.wait {
        MsgWait::Send { msg, reply } => (msg, reply),
        other => unreachable!("{sender:?} is in a sender list with {other:?}"),
    };

    if reply {
        wait::unlink(lock, sender);
        let tcb = &mut lock.threads[sender];
        tcb.status = ThreadStatus::BlockedReply;
        tcb.msg.wait = MsgWait::Reply {
            from: me,
            reply: None,
        };
    } else {
        lock.threads[sender].msg.wait = MsgWait::None;
        wait::wake(lock, sender, WaitResult::Woken);
    }
    msg
}

/// Take the next message for `me` without blocking.
fn take_message<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, me: Pid) -> Option<Message> {
    let queued = lock.threads[me].msg.queue.as_mut().and_then(MsgQueue::pop);
    let next_sender = lock.threads[me].msg.senders.first;

    match (queued, next_sender) {
        (Some(msg), Some(sender)) => {
            // Move the first blocked sender's message into the freed slot
            let refill = take_from_sender(lock, me, sender);
            let pushed = lock.threads[me]
                .msg
                .queue
                .as_mut()
                .map_or(false, |q| q.push(refill));
            debug_assert!(pushed);
            Some(msg)
        }
        (Some(msg), None) => Some(msg),
        (None, Some(sender)) => Some(take_from_sender(lock, me, sender)),
        (None, None) => None,
    }
}

enum ReceiveError {
    WouldBlock,
    Timeout,
}

/// Receive a message for the current thread. `block == false` makes it a
/// non-blocking attempt.
fn receive_locked<P: Port, const N: usize>(
    mut lock: CpuLockGuard<'_, P, N>,
    block: bool,
    deadline: Option<Ticks>,
) -> Result<Message, ReceiveError> {
    let me = state::expect_waitable_context(&lock);

    if let Some(msg) = take_message(&mut lock, me) {
        // A sender might have been woken up
        lock.dispatch();
        return Ok(msg);
    }

    if !block {
        return Err(ReceiveError::WouldBlock);
    }
    if matches!(deadline, Some(at) if at <= lock.port().now()) {
        return Err(ReceiveError::Timeout);
    }

    lock.threads[me].msg.wait = MsgWait::Receive(None);
    let (mut lock, _) = wait::wait(lock, ThreadStatus::BlockedReceive, None, deadline);

    match mem::replace(&mut lock.threads[me].msg.wait, MsgWait::None) {
        MsgWait::Receive(Some(msg)) => Ok(msg),
        _ => Err(ReceiveError::Timeout),
    }
}

/// Release the threads that wait on the exiting thread `me` to accept
/// their message or to reply. Their operations fail with `NoAccess`.
pub(crate) fn release_peers<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, me: Pid) {
    while let Some(sender) = lock.threads[me].msg.senders.first {
        lock.threads[sender].msg.wait = MsgWait::None;
        wait::wake(lock, sender, WaitResult::Canceled);
    }

    for i in 0..N {
        let pid = Pid::from_index(i);
        let awaits_reply = matches!(
            lock.threads.get(pid),
            Some(tcb) if tcb.status == ThreadStatus::BlockedReply
                && matches!(tcb.msg.wait, MsgWait::Reply { from, .. } if from == me)
        );
        if awaits_reply {
            lock.threads[pid].msg.wait = MsgWait::None;
            wait::wake(lock, pid, WaitResult::Canceled);
        }
    }
}

/// Message passing
impl<P: Port, const N: usize> Kernel<P, N> {
    /// Give the current thread a message queue backed by `buf`.
    ///
    /// Without a queue, a thread can only receive messages from senders
    /// that find it waiting in [`Self::msg_receive`] or that block until
    /// it does.
    pub fn msg_init_queue(&self, buf: &'static mut [Message]) -> Result<(), MsgInitQueueError> {
        if buf.is_empty() {
            return Err(MsgInitQueueError::BadParam);
        }

        let mut lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);
        let msg = &mut lock.threads[me].msg;
        if msg.queue.is_some() {
            return Err(MsgInitQueueError::BadObjectState);
        }
        msg.queue = Some(MsgQueue::new(buf));
        Ok(())
    }

    /// Get the number of messages in the current thread's queue.
    pub fn msg_avail(&self) -> usize {
        let lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);
        lock.threads[me].msg.queue.as_ref().map_or(0, MsgQueue::len)
    }

    /// Send a message, blocking until the target accepts it.
    ///
    /// Fails with `NoAccess` if the target does not exist or exits before
    /// accepting the message, and with `BadParam` if the target is the
    /// current thread (use [`Self::msg_send_to_self`]).
    ///
    /// Panics if called from an interrupt context; use
    /// [`Self::msg_send_int`] there.
    pub fn msg_send(&self, target: Pid, mut msg: Message) -> Result<(), SendError> {
        let mut lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);
        if target == me {
            return Err(SendError::BadParam);
        }
        expect_alive(&lock, target)?;

        msg.sender = Some(me);
        match deliver(&mut lock, target, msg) {
            Delivery::Direct => {
                lock.dispatch();
                Ok(())
            }
            Delivery::Queued => Ok(()),
            Delivery::Full => {
                log::trace!("{me:?} blocks sending to {target:?}");
                lock.threads[me].msg.wait = MsgWait::Send { msg, reply: false };
                let (_lock, result) = wait::wait(
                    lock,
                    ThreadStatus::BlockedSend,
                    Some(Membership::Senders(target)),
                    None,
                );
                match result {
                    WaitResult::Woken => Ok(()),
                    _ => Err(SendError::NoAccess),
                }
            }
        }
    }

    /// Send a message if the target can accept it immediately. Can be called
    /// from any context.
    pub fn msg_try_send(&self, target: Pid, msg: Message) -> Result<(), TrySendError> {
        let mut lock = klock::lock_cpu(self);
        let me = state::current_thread(&lock);
        try_send_locked(&mut lock, me, target, msg)?;
        lock.dispatch();
        Ok(())
    }

    /// Send a message from an interrupt handler. Never blocks. The message's
    /// sender is `None`.
    pub fn msg_send_int(&self, target: Pid, msg: Message) -> Result<(), TrySendError> {
        let mut lock = klock::lock_cpu(self);
        try_send_locked(&mut lock, None, target, msg)?;
        lock.dispatch();
        Ok(())
    }

    /// Put a message into the current thread's own queue. Fails with
    /// `WouldBlock` if the thread has no queue or it's full.
    pub fn msg_send_to_self(&self, mut msg: Message) -> Result<(), TrySendError> {
        let mut lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);
        msg.sender = Some(me);
        match deliver(&mut lock, me, msg) {
            Delivery::Queued => Ok(()),
            _ => Err(TrySendError::WouldBlock),
        }
    }

    /// Receive a message, blocking until one is available.
    pub fn msg_receive(&self) -> Message {
        let lock = klock::lock_cpu(self);
        match receive_locked(lock, true, None) {
            Ok(msg) => msg,
            Err(_) => unreachable!(),
        }
    }

    /// Receive a message if one is available.
    pub fn msg_try_receive(&self) -> Result<Message, TryReceiveError> {
        let lock = klock::lock_cpu(self);
        receive_locked(lock, false, None).map_err(|_| TryReceiveError::WouldBlock)
    }

    /// [`Self::msg_receive`] with a timeout.
    pub fn msg_receive_timeout(&self, ticks: Ticks) -> Result<Message, TimeoutError> {
        let lock = klock::lock_cpu(self);
        let deadline = timeout::deadline_after(&lock, ticks);
        receive_locked(lock, true, Some(deadline)).map_err(|e| match e {
            ReceiveError::WouldBlock | ReceiveError::Timeout => TimeoutError::Timeout,
        })
    }

    /// Send a message and wait for the target to reply to it with
    /// [`Self::msg_reply`].
    ///
    /// The current thread keeps its priority while the target processes
    /// the message. A target with a lower priority than the caller delays
    /// the caller behind any thread with a priority in between.
    pub fn msg_send_receive(&self, target: Pid, mut msg: Message) -> Result<Message, SendError> {
        let mut lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);
        if target == me {
            return Err(SendError::BadParam);
        }
        expect_alive(&lock, target)?;

        msg.sender = Some(me);
        let (status, membership, wait) = match deliver(&mut lock, target, msg) {
            Delivery::Direct | Delivery::Queued => (
                ThreadStatus::BlockedReply,
                None,
                MsgWait::Reply {
                    from: target,
                    reply: None,
                },
            ),
            Delivery::Full => (
                ThreadStatus::BlockedSend,
                Some(Membership::Senders(target)),
                MsgWait::Send { msg, reply: true },
            ),
        };
        lock.threads[me].msg.wait = wait;

        let (mut lock, result) = wait::wait(lock, status, membership, None);

        match (result, mem::replace(&mut lock.threads[me].msg.wait, MsgWait::None)) {
            (
                WaitResult::Woken,
                MsgWait::Reply {
                    reply: Some(reply), ..
                },
            ) => Ok(reply),
            _ => Err(SendError::NoAccess),
        }
    }

    /// Reply to a message received from a thread waiting in
    /// [`Self::msg_send_receive`]. Can be called from any context.
    ///
    /// A thread can only answer a request that was sent to it. Fails with
    /// `BadObjectState` if the sender is not waiting for a reply from the
    /// calling thread.
    pub fn msg_reply(&self, original: &Message, mut reply: Message) -> Result<(), ReplyError> {
        let mut lock = klock::lock_cpu(self);
        let target = original.sender.ok_or(ReplyError::NoAccess)?;
        let from = match lock.threads.get(target) {
            None => return Err(ReplyError::NoAccess),
            Some(tcb) => match (tcb.status, tcb.msg.wait) {
                (ThreadStatus::BlockedReply, MsgWait::Reply { from, .. }) => from,
                (ThreadStatus::Zombie, _) => return Err(ReplyError::NoAccess),
                _ => return Err(ReplyError::BadObjectState),
            },
        };

        // Only the thread that took the request may answer it. Interrupt
        // handlers can answer on its behalf.
        let me = state::current_thread(&lock);
        if matches!(me, Some(me) if me != from) {
            return Err(ReplyError::BadObjectState);
        }

        reply.sender = me;
        lock.threads[target].msg.wait = MsgWait::Reply {
            from,
            reply: Some(reply),
        };
        wait::wake(&mut lock, target, WaitResult::Woken);
        lock.dispatch();
        Ok(())
    }
}
