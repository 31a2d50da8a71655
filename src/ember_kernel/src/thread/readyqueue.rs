//! Thread ready queue implementation
//!
//! One FIFO list per priority level. A bitmap tracks the non-empty levels so
//! that finding the highest-priority ready thread takes constant time.
use core::fmt;

use crate::{
    state::Threads,
    utils::{intrusive_list::ListHead, OneLevelPrioBitmap, PrioBitmap},
    wait::Membership,
    Pid, Priority, SCHED_PRIO_LEVELS,
};

pub(crate) struct ReadyQueue {
    queues: [ListHead<Pid>; SCHED_PRIO_LEVELS],
    bitmap: OneLevelPrioBitmap<SCHED_PRIO_LEVELS>,
}

impl ReadyQueue {
    pub(crate) const fn new() -> Self {
        Self {
            queues: [ListHead::new(); SCHED_PRIO_LEVELS],
            bitmap: OneLevelPrioBitmap::new(),
        }
    }

    /// Get the priority of the highest-priority ready thread.
    pub(crate) fn highest_priority(&self) -> Option<Priority> {
        self.bitmap.find_set().map(|i| i as Priority)
    }

    /// Insert `pid` at the back of the queue of its effective priority.
    ///
    /// `pid` must not be a member of any list.
    pub(crate) fn push_back<const N: usize>(&mut self, threads: &mut Threads<N>, pid: Pid) {
        debug_assert_eq!(threads[pid].membership, Membership::None);
        let prio = threads[pid].priority as usize;
        self.queues[prio].push_back(threads, pid);
        self.bitmap.set(prio);
        threads[pid].membership = Membership::ReadyQueue;
    }

    /// Remove `pid` from the queue. `pid` must be a member of the queue, and
    /// its priority must not have changed since it was inserted.
    pub(crate) fn remove<const N: usize>(&mut self, threads: &mut Threads<N>, pid: Pid) {
        debug_assert_eq!(threads[pid].membership, Membership::ReadyQueue);
        let prio = threads[pid].priority as usize;
        self.queues[prio].remove(threads, pid);
        if self.queues[prio].is_empty() {
            self.bitmap.clear(prio);
        }
        threads[pid].membership = Membership::None;
    }

    /// Remove the first thread of the highest non-empty level and return it.
    pub(crate) fn pop_front<const N: usize>(&mut self, threads: &mut Threads<N>) -> Option<Pid> {
        let prio = self.bitmap.find_set()?;
        let pid = self.queues[prio].pop_front(threads)?;
        if self.queues[prio].is_empty() {
            self.bitmap.clear(prio);
        }
        threads[pid].membership = Membership::None;
        Some(pid)
    }
}

impl fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}
