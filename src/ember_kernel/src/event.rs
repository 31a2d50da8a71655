//! Event queues
//!
//! An [`EventQueue`] is a FIFO of [`Event`]s. Any context can post events to
//! it, and a single thread consumes them. The consumer sleeps on
//! [`THREAD_FLAG_EVENT`], which posting sets, so posting never blocks and is
//! safe in an interrupt handler.
use core::{fmt, ptr};

use crate::{
    error::TimeoutError,
    klock::{self, CpuLockCell, CpuLockGuard},
    state,
    thread::ThreadStatus,
    thread_flags::{self, THREAD_FLAG_EVENT},
    timeout, Kernel, Pid, Port, Ticks,
};

/// The action associated with an [`Event`].
pub trait EventHandler: Sync {
    /// Handle `event`. Called by [`EventQueue::run_loop`] in the thread
    /// running the loop.
    fn handle(&self, event: &'static Event);
}

impl<F: Fn(&'static Event) + Sync> EventHandler for F {
    fn handle(&self, event: &'static Event) {
        self(event)
    }
}

/// An event record.
///
/// An event is pending in at most one queue at a time, which is tracked by
/// the event itself. Posting an event that is already pending has no
/// effect.
pub struct Event {
    handler: &'static dyn EventHandler,
    link: CpuLockCell<EventLink>,
}

#[derive(Clone, Copy)]
struct EventLink {
    next: Option<&'static Event>,
    /// The address of the queue the event is pending in.
    queue: Option<usize>,
}

impl EventLink {
    const UNLINKED: Self = Self {
        next: None,
        queue: None,
    };
}

impl Event {
    pub const fn new(handler: &'static dyn EventHandler) -> Self {
        Self {
            handler,
            link: CpuLockCell::new(EventLink::UNLINKED),
        }
    }

    pub fn handler(&self) -> &'static dyn EventHandler {
        self.handler
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Event({:p})", self)
    }
}

/// A FIFO queue of [`Event`]s.
pub struct EventQueue {
    st: CpuLockCell<QueueSt>,
}

#[derive(Clone, Copy)]
struct QueueSt {
    first: Option<&'static Event>,
    last: Option<&'static Event>,
    /// The thread that has claimed the queue by waiting on it.
    waiter: Option<Claim>,
}

#[derive(Clone, Copy)]
struct Claim {
    pid: Pid,
    serial: u32,
}

/// Get the thread holding `claim`. A claim is void once its thread has
/// exited, even if the PID was handed to a new thread since.
fn claimant<P: Port, const N: usize>(lock: &CpuLockGuard<'_, P, N>, claim: Option<Claim>) -> Option<Pid> {
    let claim = claim?;
    match lock.threads.get(claim.pid) {
        Some(tcb) if tcb.serial == claim.serial && tcb.status != ThreadStatus::Zombie => {
            Some(claim.pid)
        }
        _ => None,
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            st: CpuLockCell::new(QueueSt {
                first: None,
                last: None,
                waiter: None,
            }),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Append `event` to the queue unless it's already pending, and wake up
    /// the waiting thread. Can be called from any context.
    pub fn post<P: Port, const N: usize>(&self, k: &Kernel<P, N>, event: &'static Event) {
        let mut lock = klock::lock_cpu(k);

        if event.link.get(&lock).queue.is_some() {
            return;
        }
        event.link.replace(
            &mut lock,
            EventLink {
                next: None,
                queue: Some(self.addr()),
            },
        );

        let mut st = self.st.get(&lock);
        match st.last {
            Some(last) => last.link.write(&mut lock, |link| link.next = Some(event)),
            None => st.first = Some(event),
        }
        st.last = Some(event);
        let waiter = claimant(&lock, st.waiter);
        if waiter.is_none() {
            st.waiter = None;
        }
        self.st.replace(&mut lock, st);

        if let Some(waiter) = waiter {
            thread_flags::set_locked(&mut lock, waiter, THREAD_FLAG_EVENT);
        }

        lock.dispatch();
    }

    /// Remove `event` from the queue if it's pending in it. Can be called
    /// from any context.
    pub fn cancel<P: Port, const N: usize>(&self, k: &Kernel<P, N>, event: &'static Event) {
        let mut lock = klock::lock_cpu(k);

        if event.link.get(&lock).queue != Some(self.addr()) {
            return;
        }

        let mut st = self.st.get(&lock);
        let next = event.link.get(&lock).next;

        // Find the predecessor
        let mut prev = None;
        let mut cur = st.first;
        while let Some(e) = cur {
            if ptr::eq(e, event) {
                break;
            }
            prev = cur;
            cur = e.link.get(&lock).next;
        }
        debug_assert!(cur.is_some());

        match prev {
            Some(prev) => prev.link.write(&mut lock, |link| link.next = next),
            None => st.first = next,
        }
        if next.is_none() {
            st.last = prev;
        }
        self.st.replace(&mut lock, st);
        event.link.replace(&mut lock, EventLink::UNLINKED);
    }

    /// Remove the first event from the queue and return it. Can be called
    /// from any context.
    pub fn get<P: Port, const N: usize>(&self, k: &Kernel<P, N>) -> Option<&'static Event> {
        let mut lock = klock::lock_cpu(k);
        self.pop(&mut lock)
    }

    fn pop<P: Port, const N: usize>(&self, lock: &mut CpuLockGuard<'_, P, N>) -> Option<&'static Event> {
        let mut st = self.st.get(lock);
        let event = st.first?;
        st.first = event.link.get(lock).next;
        if st.first.is_none() {
            st.last = None;
        }
        self.st.replace(lock, st);
        event.link.replace(lock, EventLink::UNLINKED);
        Some(event)
    }

    /// Return `true` if `event` is pending in this queue.
    pub fn is_pending<P: Port, const N: usize>(&self, k: &Kernel<P, N>, event: &'static Event) -> bool {
        let lock = klock::lock_cpu(k);
        event.link.get(&lock).queue == Some(self.addr())
    }

    /// Take the first event, waiting for one to be posted if the queue is
    /// empty.
    ///
    /// The first call claims the queue for the calling thread. The claim
    /// ends when the thread exits. Panics if the queue was claimed by another
    /// thread or if called from an interrupt context.
    pub fn wait<P: Port, const N: usize>(&self, k: &Kernel<P, N>) -> &'static Event {
        match self.wait_inner(k, None) {
            Ok(event) => event,
            Err(TimeoutError::Timeout) => unreachable!(),
        }
    }

    /// [`Self::wait`] with a timeout.
    pub fn wait_timeout<P: Port, const N: usize>(
        &self,
        k: &Kernel<P, N>,
        ticks: Ticks,
    ) -> Result<&'static Event, TimeoutError> {
        self.wait_inner(k, Some(ticks))
    }

    fn wait_inner<P: Port, const N: usize>(
        &self,
        k: &Kernel<P, N>,
        ticks: Option<Ticks>,
    ) -> Result<&'static Event, TimeoutError> {
        let mut lock = klock::lock_cpu(k);
        let me = state::expect_waitable_context(&lock);
        let deadline = ticks.map(|ticks| timeout::deadline_after(&lock, ticks));

        let mut st = self.st.get(&lock);
        match claimant(&lock, st.waiter) {
            Some(waiter) if waiter == me => {}
            Some(waiter) => panic!("the event queue is claimed by {waiter:?}"),
            // Unclaimed, or the previous waiter has exited
            None => {
                st.waiter = Some(Claim {
                    pid: me,
                    serial: lock.threads[me].serial,
                });
                self.st.replace(&mut lock, st);
            }
        }

        loop {
            if let Some(event) = self.pop(&mut lock) {
                return Ok(event);
            }

            let (new_lock, result) = thread_flags::wait_flags(
                lock,
                THREAD_FLAG_EVENT,
                ThreadStatus::BlockedFlagAny,
                deadline,
            );
            lock = new_lock;
            result?;
        }
    }

    /// Wait for events and call their handlers, forever.
    pub fn run_loop<P: Port, const N: usize>(&self, k: &Kernel<P, N>) -> ! {
        loop {
            let event = self.wait(k);
            event.handler.handle(event);
        }
    }
}
