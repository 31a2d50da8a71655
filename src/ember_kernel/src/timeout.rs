//! Timeouts of blocking operations
//!
//! Each waiting thread has at most one timeout. Timeouts are kept in a
//! min-heap ordered by deadline, and each TCB remembers the heap position
//! of its entry so that a wake-up can remove the entry in logarithmic time.
//! The port's alarm is kept pointing at the earliest deadline.
use crate::{
    klock::CpuLockGuard,
    state::{State, Threads},
    utils::binary_heap::{BinaryHeap, BinaryHeapCtx},
    wait::{self, WaitResult},
    Pid, Port, Ticks,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutEntry {
    pub(crate) at: Ticks,
    pub(crate) pid: Pid,
}

/// Updates [`Tcb::timeout_pos`] as the heap entries are moved.
///
/// [`Tcb::timeout_pos`]: crate::thread::Tcb::timeout_pos
struct TimeoutHeapCtx<'a, const N: usize> {
    threads: &'a mut Threads<N>,
}

impl<const N: usize> BinaryHeapCtx<TimeoutEntry> for TimeoutHeapCtx<'_, N> {
    #[inline]
    fn lt(&mut self, x: &TimeoutEntry, y: &TimeoutEntry) -> bool {
        x.at < y.at
    }

    #[inline]
    fn on_move(&mut self, e: &mut TimeoutEntry, new_index: usize) {
        self.threads[e.pid].timeout_pos = Some(new_index);
    }
}

/// Register a timeout for `pid`, which must not have one.
pub(crate) fn insert<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, pid: Pid, at: Ticks) {
    let State {
        timeouts, threads, ..
    } = &mut **lock;
    debug_assert!(threads[pid].timeout_pos.is_none());

    let pos = timeouts.heap_push(TimeoutEntry { at, pid }, TimeoutHeapCtx { threads });

    // Re-arm the alarm if the new entry is the earliest one
    if pos == 0 {
        lock.port().set_alarm(at);
    }
}

/// Remove the timeout of `pid` if it has one.
///
/// The alarm is left as it is. An early alarm finds nothing to expire and
/// just re-arms itself.
pub(crate) fn cancel<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, pid: Pid) {
    let State {
        timeouts, threads, ..
    } = &mut **lock;
    if let Some(pos) = threads[pid].timeout_pos.take() {
        let entry = timeouts.heap_remove(pos, TimeoutHeapCtx { threads });
        debug_assert_eq!(entry.map(|e| e.pid), Some(pid));
    }
}

/// Wake up every thread whose deadline is not later than `now`, and point
/// the alarm at the next deadline.
pub(crate) fn expire<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, now: Ticks) {
    loop {
        let top = lock.timeouts.first().copied();
        match top {
            None => break,
            Some(TimeoutEntry { at, .. }) if at > now => {
                lock.port().set_alarm(at);
                break;
            }
            Some(TimeoutEntry { pid, .. }) => {
                log::trace!("{pid:?} timed out");

                // Removes the entry from the heap
                wait::wake(lock, pid, WaitResult::Timeout);
            }
        }
    }
}

/// Convert a relative timeout to a deadline.
pub(crate) fn deadline_after<P: Port, const N: usize>(lock: &CpuLockGuard<'_, P, N>, ticks: Ticks) -> Ticks {
    lock.port().now().saturating_add(ticks)
}
