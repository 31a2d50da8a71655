//! The kernel state: the TCB table, the run queues and the timeout heap
use arrayvec::ArrayVec;
use core::{fmt, ops};

use crate::{
    klock::CpuLockGuard,
    thread::{readyqueue::ReadyQueue, Tcb, ThreadStatus},
    timeout::TimeoutEntry,
    utils::intrusive_list::{Link, LinkArena},
    Pid, Port,
};

pub(crate) struct State<const N: usize> {
    pub(crate) threads: Threads<N>,
    pub(crate) ready: ReadyQueue,
    /// The thread whose context is active, or `None` if the CPU is idle.
    pub(crate) running: Option<Pid>,
    pub(crate) timeouts: ArrayVec<TimeoutEntry, N>,
    /// The number of occupied TCB slots, including zombies.
    pub(crate) num_threads: usize,
    /// The number of threads created so far. Tells apart threads that
    /// reuse a PID.
    pub(crate) num_created: u32,
}

impl<const N: usize> State<N> {
    pub(crate) fn new() -> Self {
        Self {
            threads: Threads(core::array::from_fn(|_| None)),
            ready: ReadyQueue::new(),
            running: None,
            timeouts: ArrayVec::new(),
            num_threads: 0,
            num_created: 0,
        }
    }

    /// Decide which thread should run next and update the statuses
    /// accordingly.
    ///
    /// The running thread keeps the CPU unless it has left the `Running`
    /// status (it blocked, yielded or exited) or a thread with a strictly
    /// higher priority is ready. A preempted thread is placed at the back of
    /// its run queue.
    pub(crate) fn choose_next(&mut self) -> Option<Pid> {
        if let Some(cur) = self.running {
            let tcb = &self.threads[cur];
            if tcb.status == ThreadStatus::Running {
                match self.ready.highest_priority() {
                    Some(prio) if prio < tcb.priority => {
                        self.threads[cur].status = ThreadStatus::Pending;
                        self.ready.push_back(&mut self.threads, cur);
                    }
                    _ => return Some(cur),
                }
            }
        }

        let next = self.ready.pop_front(&mut self.threads);
        if let Some(next) = next {
            self.threads[next].status = ThreadStatus::Running;
        }
        self.running = next;
        next
    }
}

impl<const N: usize> fmt::Debug for State<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("running", &self.running)
            .field("ready", &self.ready)
            .field("timeouts", &self.timeouts)
            .field("threads", &self.threads)
            .finish()
    }
}

/// The TCB table. Slot `i` holds the thread whose `Pid` is `i + 1`.
pub(crate) struct Threads<const N: usize>([Option<Tcb>; N]);

impl<const N: usize> Threads<N> {
    pub(crate) fn get(&self, pid: Pid) -> Option<&Tcb> {
        self.0.get(pid.index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Tcb> {
        self.0.get_mut(pid.index())?.as_mut()
    }

    /// Store `tcb` in the lowest free slot.
    pub(crate) fn alloc(&mut self, tcb: Tcb) -> Option<Pid> {
        let i = self.0.iter().position(Option::is_none)?;
        self.0[i] = Some(tcb);
        Some(Pid::from_index(i))
    }

    pub(crate) fn free(&mut self, pid: Pid) -> Option<Tcb> {
        self.0.get_mut(pid.index())?.take()
    }
}

impl<const N: usize> ops::Index<Pid> for Threads<N> {
    type Output = Tcb;

    #[track_caller]
    fn index(&self, pid: Pid) -> &Self::Output {
        match self.get(pid) {
            Some(tcb) => tcb,
            None => panic!("{pid:?} does not exist"),
        }
    }
}

impl<const N: usize> ops::IndexMut<Pid> for Threads<N> {
    #[track_caller]
    fn index_mut(&mut self, pid: Pid) -> &mut Self::Output {
        match self.get_mut(pid) {
            Some(tcb) => tcb,
            None => panic!("{pid:?} does not exist"),
        }
    }
}

impl<const N: usize> LinkArena<Pid> for Threads<N> {
    fn link(&self, i: Pid) -> &Link<Pid> {
        &self[i].link
    }

    fn link_mut(&mut self, i: Pid) -> &mut Link<Pid> {
        &mut self[i].link
    }
}

impl<const N: usize> fmt::Debug for Threads<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(
                self.0
                    .iter()
                    .enumerate()
                    .filter_map(|(i, tcb)| Some((Pid::from_index(i), tcb.as_ref()?))),
            )
            .finish()
    }
}

/// Get the thread owning the current context. Panics if the current context
/// is an interrupt handler or no thread is running.
#[track_caller]
pub(crate) fn expect_waitable_context<P: Port, const N: usize>(lock: &CpuLockGuard<'_, P, N>) -> Pid {
    if lock.port().irq_is_in() {
        panic!("this operation may block and can't be used in an interrupt context");
    }
    match lock.running {
        Some(pid) => pid,
        None => panic!("no thread is running"),
    }
}

/// Get the thread owning the current context, or `None` in an interrupt
/// context.
pub(crate) fn current_thread<P: Port, const N: usize>(lock: &CpuLockGuard<'_, P, N>) -> Option<Pid> {
    if lock.port().irq_is_in() {
        None
    } else {
        lock.running
    }
}
