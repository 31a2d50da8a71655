//! Thread flags
//!
//! Every thread has a 16-bit set of flags that other contexts (including
//! interrupt handlers) can set, and the thread can wait for.
use crate::{
    error::{NoAccessError, TimeoutError},
    klock::{self, CpuLockGuard},
    state,
    thread::ThreadStatus,
    timeout,
    wait::{self, WaitResult},
    Kernel, Pid, Port, Ticks,
};

/// A set of thread flags.
pub type ThreadFlags = u16;

/// The flag set by [`EventQueue::post`] to wake up the waiting thread.
///
/// [`EventQueue::post`]: crate::EventQueue::post
pub const THREAD_FLAG_EVENT: ThreadFlags = 0x1;

/// Set `mask` on `pid` and wake it up if its wait condition is satisfied.
/// The caller is responsible for calling `dispatch` afterwards.
pub(crate) fn set_locked<P: Port, const N: usize>(
    lock: &mut CpuLockGuard<'_, P, N>,
    pid: Pid,
    mask: ThreadFlags,
) {
    let tcb = &mut lock.threads[pid];
    tcb.flags |= mask;

    let satisfied = match tcb.status {
        ThreadStatus::BlockedFlagAny => tcb.flags & tcb.flag_wait_mask != 0,
        ThreadStatus::BlockedFlagAll => tcb.flags & tcb.flag_wait_mask == tcb.flag_wait_mask,
        _ => false,
    };
    if satisfied {
        wait::wake(lock, pid, WaitResult::Woken);
    }
}

/// Remove the flags of `me` that are in `mask` and return them.
fn take<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, me: Pid, mask: ThreadFlags) -> ThreadFlags {
    let tcb = &mut lock.threads[me];
    let taken = tcb.flags & mask;
    tcb.flags &= !taken;
    taken
}

/// Thread flags
impl<P: Port, const N: usize> Kernel<P, N> {
    /// Set flags on a thread. Can be called from any context.
    pub fn thread_flags_set(&self, pid: Pid, mask: ThreadFlags) -> Result<(), NoAccessError> {
        let mut lock = klock::lock_cpu(self);
        match lock.threads.get(pid) {
            Some(tcb) if tcb.status != ThreadStatus::Zombie => {}
            _ => return Err(NoAccessError::NoAccess),
        }
        set_locked(&mut lock, pid, mask);
        lock.dispatch();
        Ok(())
    }

    /// Clear flags of the current thread and return the cleared flags that
    /// were set.
    pub fn thread_flags_clear(&self, mask: ThreadFlags) -> ThreadFlags {
        let mut lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);
        take(&mut lock, me, mask)
    }

    /// Wait until any of the flags in `mask` is set. Returns and clears the
    /// flags of `mask` that are set.
    pub fn thread_flags_wait_any(&self, mask: ThreadFlags) -> ThreadFlags {
        let lock = klock::lock_cpu(self);
        match wait_flags(lock, mask, ThreadStatus::BlockedFlagAny, None).1 {
            Ok(flags) => flags,
            Err(TimeoutError::Timeout) => unreachable!(),
        }
    }

    /// Wait until all of the flags in `mask` are set. Returns and clears
    /// them.
    pub fn thread_flags_wait_all(&self, mask: ThreadFlags) -> ThreadFlags {
        let lock = klock::lock_cpu(self);
        match wait_flags(lock, mask, ThreadStatus::BlockedFlagAll, None).1 {
            Ok(flags) => flags,
            Err(TimeoutError::Timeout) => unreachable!(),
        }
    }

    /// Wait until any of the flags in `mask` is set. Returns and clears only
    /// the lowest one of them.
    pub fn thread_flags_wait_one(&self, mask: ThreadFlags) -> ThreadFlags {
        let mut lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);
        loop {
            let set = lock.threads[me].flags & mask;
            if set != 0 {
                let lowest = set & set.wrapping_neg();
                return take(&mut lock, me, lowest);
            }
            lock.threads[me].flag_wait_mask = mask;
            lock = wait::wait(lock, ThreadStatus::BlockedFlagAny, None, None).0;
        }
    }

    /// [`Self::thread_flags_wait_any`] with a timeout.
    pub fn thread_flags_wait_any_timeout(
        &self,
        mask: ThreadFlags,
        ticks: Ticks,
    ) -> Result<ThreadFlags, TimeoutError> {
        let lock = klock::lock_cpu(self);
        let deadline = timeout::deadline_after(&lock, ticks);
        wait_flags(lock, mask, ThreadStatus::BlockedFlagAny, Some(deadline)).1
    }
}

/// Wait for flags, optionally until `deadline`. `BlockedFlagAll` returns
/// only when every flag in `mask` is set.
pub(crate) fn wait_flags<'a, P: Port, const N: usize>(
    mut lock: CpuLockGuard<'a, P, N>,
    mask: ThreadFlags,
    status: ThreadStatus,
    deadline: Option<Ticks>,
) -> (CpuLockGuard<'a, P, N>, Result<ThreadFlags, TimeoutError>) {
    let me = state::expect_waitable_context(&lock);
    let satisfied = |flags: ThreadFlags| match status {
        ThreadStatus::BlockedFlagAll => flags & mask == mask,
        _ => flags & mask != 0,
    };

    loop {
        if satisfied(lock.threads[me].flags) {
            let flags = take(&mut lock, me, mask);
            return (lock, Ok(flags));
        }
        if matches!(deadline, Some(at) if at <= lock.port().now()) {
            return (lock, Err(TimeoutError::Timeout));
        }

        lock.threads[me].flag_wait_mask = mask;
        let (new_lock, result) = wait::wait(lock, status, None, deadline);
        lock = new_lock;
        if result == WaitResult::Timeout && !satisfied(lock.threads[me].flags) {
            return (lock, Err(TimeoutError::Timeout));
        }
    }
}
