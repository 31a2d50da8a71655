//! The suspension and wake-up primitives that the blocking operations are
//! built on
//!
//! A thread is a member of at most one list at any time: a run queue, the
//! wait queue of a kernel object or the sender list of a thread. The list a
//! thread belongs to is recorded in [`Tcb::membership`], so that a wait can
//! be aborted (by a timeout or a cancellation request) without knowing which
//! object the thread is waiting on.
//!
//! [`Tcb::membership`]: crate::thread::Tcb::membership
use core::{fmt, ptr::NonNull};

use crate::{
    klock::{CpuLockCell, CpuLockGuard},
    state::{self, State, Threads},
    thread::ThreadStatus,
    timeout,
    utils::intrusive_list::ListHead,
    Pid, Port, Ticks,
};

/// The list a thread belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    None,
    ReadyQueue,
    WaitQueue(WaitQueueRef),
    /// The sender list of the specified thread.
    Senders(Pid),
}

/// The outcome of a wait, set by whoever ends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitResult {
    Woken,
    Timeout,
    Canceled,
}

/// A priority-ordered list of threads blocked on a kernel object.
pub(crate) struct WaitQueue {
    head: CpuLockCell<ListHead<Pid>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaitQueueRef(NonNull<WaitQueue>);

// Safety: A `WaitQueueRef` is only dereferenced while the kernel state is
// locked, and only while a thread waiting on the queue exists. Every wait
// operation borrows the object owning the queue until the wait ends, so the
// queue outlives the reference.
unsafe impl Send for WaitQueueRef {}

impl fmt::Debug for WaitQueueRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WaitQueueRef({:p})", self.0)
    }
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(ListHead::new()),
        }
    }

    fn as_ref(&self) -> WaitQueueRef {
        WaitQueueRef(NonNull::from(self))
    }

    /// Get the waiter to be woken first.
    pub(crate) fn first<P: Port, const N: usize>(&self, lock: &CpuLockGuard<'_, P, N>) -> Option<Pid> {
        self.head.get(lock).first
    }

    /// Return `true` if `pid` is waiting on `self`.
    pub(crate) fn contains<P: Port, const N: usize>(
        &self,
        lock: &CpuLockGuard<'_, P, N>,
        pid: Pid,
    ) -> bool {
        lock.threads
            .get(pid)
            .map_or(false, |tcb| tcb.membership == Membership::WaitQueue(self.as_ref()))
    }

    /// Block the current thread on `self` until it's woken by [`wake`] or
    /// `deadline` passes.
    pub(crate) fn wait<'a, P: Port, const N: usize>(
        &self,
        lock: CpuLockGuard<'a, P, N>,
        status: ThreadStatus,
        deadline: Option<Ticks>,
    ) -> (CpuLockGuard<'a, P, N>, WaitResult) {
        wait(lock, status, Some(Membership::WaitQueue(self.as_ref())), deadline)
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitQueue").field(&self.head).finish()
    }
}

/// Insert `pid` into `head`, after every thread with the same or a higher
/// priority.
fn insert_by_priority<const N: usize>(threads: &mut Threads<N>, head: &mut ListHead<Pid>, pid: Pid) {
    let prio = threads[pid].priority;
    let at = head.iter(threads).find(|&p| threads[p].priority > prio);
    head.insert_before(threads, pid, at);
}

/// Call `f` with the head of the list designated by `membership`, which
/// must be a priority-ordered list.
fn with_list<P: Port, const N: usize, R>(
    lock: &mut CpuLockGuard<'_, P, N>,
    membership: Membership,
    f: impl FnOnce(&mut Threads<N>, &mut ListHead<Pid>) -> R,
) -> R {
    match membership {
        Membership::WaitQueue(wq) => {
            // Safety: See `WaitQueueRef`
            let wq = unsafe { wq.0.as_ref() };
            let mut head = wq.head.get(lock);
            let r = f(&mut lock.threads, &mut head);
            wq.head.replace(lock, head);
            r
        }
        Membership::Senders(target) => {
            let mut head = lock.threads[target].msg.senders;
            let r = f(&mut lock.threads, &mut head);
            lock.threads[target].msg.senders = head;
            r
        }
        Membership::None | Membership::ReadyQueue => unreachable!(),
    }
}

/// Insert `pid` into the priority-ordered list `membership`. `pid` must not
/// be a member of any list.
pub(crate) fn insert_waiter<P: Port, const N: usize>(
    lock: &mut CpuLockGuard<'_, P, N>,
    pid: Pid,
    membership: Membership,
) {
    debug_assert_eq!(lock.threads[pid].membership, Membership::None);
    with_list(lock, membership, |threads, head| {
        insert_by_priority(threads, head, pid)
    });
    lock.threads[pid].membership = membership;
}

/// Remove `pid` from whichever list it belongs to.
pub(crate) fn unlink<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, pid: Pid) {
    let membership = lock.threads[pid].membership;
    match membership {
        Membership::None => {}
        Membership::ReadyQueue => {
            let State { ready, threads, .. } = &mut **lock;
            ready.remove(threads, pid);
        }
        _ => {
            with_list(lock, membership, |threads, head| head.remove(threads, pid));
            lock.threads[pid].membership = Membership::None;
        }
    }
}

/// Block the current thread.
///
/// The thread enters `status`, is inserted into `membership` (if any) and,
/// if `deadline` is given, into the timeout heap. Returns when another
/// context calls [`wake`] on the thread or the deadline passes.
///
/// Panics if the current context is not a thread context.
pub(crate) fn wait<'a, P: Port, const N: usize>(
    mut lock: CpuLockGuard<'a, P, N>,
    status: ThreadStatus,
    membership: Option<Membership>,
    deadline: Option<Ticks>,
) -> (CpuLockGuard<'a, P, N>, WaitResult) {
    let me = state::expect_waitable_context(&lock);

    let tcb = &mut lock.threads[me];
    debug_assert_eq!(tcb.status, ThreadStatus::Running);
    tcb.status = status;
    tcb.wait_result = WaitResult::Woken;

    if let Some(membership) = membership {
        insert_waiter(&mut lock, me, membership);
    }
    if let Some(at) = deadline {
        timeout::insert(&mut lock, me, at);
    }

    let lock = lock.dispatch();

    let result = lock.threads[me].wait_result;
    (lock, result)
}

/// End the wait of `pid` with `result` and make it ready. The caller is
/// responsible for calling `dispatch` afterwards.
///
/// Cancels the thread's timeout, so a thread is never woken twice.
pub(crate) fn wake<P: Port, const N: usize>(
    lock: &mut CpuLockGuard<'_, P, N>,
    pid: Pid,
    result: WaitResult,
) {
    debug_assert!(!matches!(
        lock.threads[pid].status,
        ThreadStatus::Running | ThreadStatus::Pending | ThreadStatus::Zombie
    ));

    unlink(lock, pid);
    timeout::cancel(lock, pid);

    let State { threads, ready, .. } = &mut **lock;
    let tcb = &mut threads[pid];
    tcb.wait_result = result;
    tcb.status = ThreadStatus::Pending;
    ready.push_back(threads, pid);
}
