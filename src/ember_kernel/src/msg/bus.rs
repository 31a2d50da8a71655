//! Message bus
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    error::BusError,
    klock::{self, CpuLockCell},
    msg::{try_send_locked, Message},
    state, Kernel, Pid, Port,
};

/// A publish/subscribe channel that delivers a message to every attached
/// thread subscribed to its kind.
///
/// Delivery never blocks. A subscriber that can't accept a message right
/// away (it's neither waiting in `msg_receive` nor has room in its queue)
/// misses it.
///
/// `CAP` is the maximum number of attached threads.
pub struct MsgBus<const CAP: usize = 8> {
    subscribers: CpuLockCell<ArrayVec<Subscriber, CAP>>,
}

#[derive(Debug, Clone, Copy)]
struct Subscriber {
    pid: Pid,
    /// Bit `i` is set if the thread is subscribed to kind `i`.
    kinds: u32,
}

impl<const CAP: usize> Default for MsgBus<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> fmt::Debug for MsgBus<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MsgBus").field(&self.subscribers).finish()
    }
}

fn kind_bit(kind: u16) -> Result<u32, BusError> {
    if kind < 32 {
        Ok(1 << kind)
    } else {
        Err(BusError::BadParam)
    }
}

impl<const CAP: usize> MsgBus<CAP> {
    pub const fn new() -> Self {
        Self {
            subscribers: CpuLockCell::new(ArrayVec::new_const()),
        }
    }

    /// Attach the current thread to the bus, initially subscribed to
    /// nothing.
    pub fn attach<P: Port, const N: usize>(&self, k: &Kernel<P, N>) -> Result<(), BusError> {
        let mut lock = klock::lock_cpu(k);
        let me = state::expect_waitable_context(&lock);
        self.subscribers.write(&mut lock, |subs| {
            if subs.iter().any(|s| s.pid == me) {
                return Err(BusError::BadObjectState);
            }
            subs.try_push(Subscriber { pid: me, kinds: 0 })
                .map_err(|_| BusError::QueueOverflow)
        })
    }

    /// Detach the current thread from the bus.
    pub fn detach<P: Port, const N: usize>(&self, k: &Kernel<P, N>) -> Result<(), BusError> {
        let mut lock = klock::lock_cpu(k);
        let me = state::expect_waitable_context(&lock);
        self.subscribers.write(&mut lock, |subs| {
            let i = subs
                .iter()
                .position(|s| s.pid == me)
                .ok_or(BusError::BadObjectState)?;
            subs.remove(i);
            Ok(())
        })
    }

    /// Subscribe the current thread to messages of `kind` (`0..32`).
    pub fn subscribe<P: Port, const N: usize>(&self, k: &Kernel<P, N>, kind: u16) -> Result<(), BusError> {
        let bit = kind_bit(kind)?;
        self.update_kinds(k, |kinds| kinds | bit)
    }

    /// Unsubscribe the current thread from messages of `kind`.
    pub fn unsubscribe<P: Port, const N: usize>(&self, k: &Kernel<P, N>, kind: u16) -> Result<(), BusError> {
        let bit = kind_bit(kind)?;
        self.update_kinds(k, |kinds| kinds & !bit)
    }

    fn update_kinds<P: Port, const N: usize>(
        &self,
        k: &Kernel<P, N>,
        f: impl FnOnce(u32) -> u32,
    ) -> Result<(), BusError> {
        let mut lock = klock::lock_cpu(k);
        let me = state::expect_waitable_context(&lock);
        self.subscribers.write(&mut lock, |subs| {
            let sub = subs
                .iter_mut()
                .find(|s| s.pid == me)
                .ok_or(BusError::BadObjectState)?;
            sub.kinds = f(sub.kinds);
            Ok(())
        })
    }

    /// Send a message of `kind` to every subscriber of `kind`. Returns the
    /// number of threads the message was delivered to.
    ///
    /// Can be called from any context.
    pub fn post<P: Port, const N: usize>(
        &self,
        k: &Kernel<P, N>,
        kind: u16,
        content: u32,
    ) -> Result<usize, BusError> {
        let bit = kind_bit(kind)?;

        let mut lock = klock::lock_cpu(k);
        let sender = state::current_thread(&lock);
        let subs = self.subscribers.write(&mut lock, |subs| subs.clone());

        let mut delivered = 0;
        for sub in subs.iter().filter(|s| s.kinds & bit != 0) {
            if Some(sub.pid) == sender {
                continue;
            }
            match try_send_locked(&mut lock, sender, sub.pid, Message::new(kind, content)) {
                Ok(()) => delivered += 1,
                Err(e) => log::trace!("{:?} missed a bus message: {e:?}", sub.pid),
            }
        }

        lock.dispatch();
        Ok(delivered)
    }
}
