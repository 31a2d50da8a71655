//! Mutexes
use core::fmt;

use crate::{
    error::{LockMutexError, LockMutexTimeoutError, NoAccessError},
    klock::{self, CpuLockCell, CpuLockGuard},
    state,
    thread::ThreadStatus,
    timeout,
    wait::{self, WaitQueue, WaitResult},
    Kernel, Pid, Port, Ticks,
};
#[cfg(feature = "priority_inheritance")]
use crate::{thread, Priority};

/// A mutual exclusion lock.
///
/// Waiters are served in priority order, and in FIFO order among threads
/// with the same priority. Unlocking a mutex with waiters hands the
/// ownership to the first waiter directly; the mutex never appears unlocked
/// in between, so a third thread can't take it.
///
/// A mutex isn't bound to a kernel instance. Every operation takes the
/// [`Kernel`] it's performed on.
///
/// With the `priority_inheritance` feature, a thread blocking on a mutex
/// raises the owner's effective priority to its own until the owner
/// unlocks the mutex or the thread stops waiting.
pub struct Mutex {
    st: CpuLockCell<MutexSt>,
    waiters: WaitQueue,
}

#[derive(Debug, Clone, Copy)]
struct MutexSt {
    locked: bool,
    /// The thread holding the lock. `None` if the mutex is unlocked or was
    /// locked by an interrupt handler.
    #[cfg_attr(not(feature = "priority_inheritance"), allow(dead_code))]
    owner: Option<Pid>,
}

impl MutexSt {
    const UNLOCKED: Self = Self {
        locked: false,
        owner: None,
    };
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("waiters", &self.waiters)
            .finish()
    }
}

impl Mutex {
    /// Construct an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            st: CpuLockCell::new(MutexSt::UNLOCKED),
            waiters: WaitQueue::new(),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Get a flag indicating whether the mutex is currently locked.
    pub fn is_locked<P: Port, const N: usize>(&self, k: &Kernel<P, N>) -> bool {
        let lock = klock::lock_cpu(k);
        self.st.get(&lock).locked
    }

    /// Lock the mutex if it's unlocked, without blocking. Returns `true` on
    /// success.
    ///
    /// Can be called from any context.
    pub fn try_lock<P: Port, const N: usize>(&self, k: &Kernel<P, N>) -> bool {
        let mut lock = klock::lock_cpu(k);
        let owner = state::current_thread(&lock);
        self.poll(&mut lock, owner)
    }

    /// Lock the mutex, blocking the current thread until it's handed over
    /// if it's locked.
    ///
    /// Fails with `Canceled` if [`Self::cancel`] was called for the current
    /// thread before or during the wait. The mutex is not acquired in this
    /// case.
    ///
    /// Panics if called from an interrupt context.
    pub fn lock<P: Port, const N: usize>(&self, k: &Kernel<P, N>) -> Result<(), LockMutexError> {
        let lock = klock::lock_cpu(k);
        match self.lock_inner(lock, None) {
            Ok(()) => Ok(()),
            Err(_) => Err(LockMutexError::Canceled),
        }
    }

    /// [`Self::lock`] with a timeout. A timeout of zero makes this a
    /// non-blocking attempt.
    pub fn lock_timeout<P: Port, const N: usize>(
        &self,
        k: &Kernel<P, N>,
        ticks: Ticks,
    ) -> Result<(), LockMutexTimeoutError> {
        let lock = klock::lock_cpu(k);
        let deadline = timeout::deadline_after(&lock, ticks);
        match self.lock_inner(lock, Some(deadline)) {
            Ok(()) => Ok(()),
            Err(WaitResult::Canceled) => Err(LockMutexTimeoutError::Canceled),
            Err(_) => Err(LockMutexTimeoutError::Timeout),
        }
    }

    fn lock_inner<P: Port, const N: usize>(
        &self,
        mut lock: CpuLockGuard<'_, P, N>,
        deadline: Option<Ticks>,
    ) -> Result<(), WaitResult> {
        let me = state::expect_waitable_context(&lock);

        // A cancellation requested before the call applies to this call
        let tcb = &mut lock.threads[me];
        if tcb.mutex_cancel == Some(self.addr()) {
            tcb.mutex_cancel = None;
            return Err(WaitResult::Canceled);
        }

        if self.poll(&mut lock, Some(me)) {
            return Ok(());
        }

        if matches!(deadline, Some(at) if at <= lock.port().now()) {
            return Err(WaitResult::Timeout);
        }

        #[cfg(feature = "priority_inheritance")]
        {
            let prio = lock.threads[me].priority;
            self.inherit_priority(&mut lock, prio);
        }

        // The unlocker hands the ownership over before waking us up
        #[allow(unused_mut)]
        let (mut lock, result) = self.waiters.wait(lock, ThreadStatus::BlockedMutex, deadline);
        match result {
            WaitResult::Woken => Ok(()),
            e => {
                // We no longer contribute to the owner's priority
                #[cfg(feature = "priority_inheritance")]
                {
                    self.reevaluate_inheritance(&mut lock);
                }
                drop(lock);
                Err(e)
            }
        }
    }

    /// Take the mutex for `owner` if it's unlocked.
    fn poll<P: Port, const N: usize>(&self, lock: &mut CpuLockGuard<'_, P, N>, owner: Option<Pid>) -> bool {
        if self.st.get(lock).locked {
            false
        } else {
            self.st.replace(
                lock,
                MutexSt {
                    locked: true,
                    owner,
                },
            );
            true
        }
    }

    /// Unlock the mutex. If there are waiters, the ownership is passed to
    /// the first one. Does nothing if the mutex is not locked.
    ///
    /// Can be called from any context, and by a thread other than the one
    /// that locked the mutex.
    pub fn unlock<P: Port, const N: usize>(&self, k: &Kernel<P, N>) {
        let mut lock = klock::lock_cpu(k);
        self.unlock_locked(&mut lock);
        lock.dispatch();
    }

    /// Unlock the mutex and put the current thread to sleep, with no
    /// scheduling point in between. The thread sleeps until
    /// [`Kernel::thread_wakeup`] is called on it.
    ///
    /// Panics if called from an interrupt context.
    pub fn unlock_and_sleep<P: Port, const N: usize>(&self, k: &Kernel<P, N>) {
        let mut lock = klock::lock_cpu(k);
        state::expect_waitable_context(&lock);
        self.unlock_locked(&mut lock);
        wait::wait(lock, ThreadStatus::Sleeping, None, None);
    }

    fn unlock_locked<P: Port, const N: usize>(&self, lock: &mut CpuLockGuard<'_, P, N>) {
        let st = self.st.get(lock);
        if !st.locked {
            return;
        }

        #[cfg(feature = "priority_inheritance")]
        {
            if let Some(owner) = st.owner {
                restore_priority(lock, owner);
            }
        }

        if let Some(next) = self.waiters.first(lock) {
            // Hand the ownership over to the next waiter
            self.st.replace(
                lock,
                MutexSt {
                    locked: true,
                    owner: Some(next),
                },
            );
            wait::wake(lock, next, WaitResult::Woken);

            // The remaining waiters now wait for `next`
            #[cfg(feature = "priority_inheritance")]
            {
                if let Some(waiter) = self.waiters.first(lock) {
                    let prio = lock.threads[waiter].priority;
                    self.inherit_priority(lock, prio);
                }
            }
        } else {
            self.st.replace(lock, MutexSt::UNLOCKED);
        }
    }

    /// Cancel a lock request of the thread `pid` on this mutex.
    ///
    /// If `pid` is waiting on this mutex, the wait ends and the thread's
    /// [`Self::lock`] call fails with `Canceled`. Otherwise, the request is
    /// recorded, and the next `lock` call on this mutex by `pid` fails with
    /// `Canceled` without blocking. A recorded request is consumed by a
    /// single `lock` call.
    ///
    /// Can be called from any context.
    pub fn cancel<P: Port, const N: usize>(&self, k: &Kernel<P, N>, pid: Pid) -> Result<(), NoAccessError> {
        let mut lock = klock::lock_cpu(k);
        match lock.threads.get(pid) {
            Some(tcb) if tcb.status != ThreadStatus::Zombie => {}
            _ => return Err(NoAccessError::NoAccess),
        }

        if self.waiters.contains(&lock, pid) {
            log::trace!("canceling the mutex wait of {pid:?}");
            wait::wake(&mut lock, pid, WaitResult::Canceled);
            #[cfg(feature = "priority_inheritance")]
            {
                self.reevaluate_inheritance(&mut lock);
            }
            lock.dispatch();
        } else {
            lock.threads[pid].mutex_cancel = Some(self.addr());
        }
        Ok(())
    }

    /// Raise the owner's effective priority to `prio`.
    #[cfg(feature = "priority_inheritance")]
    fn inherit_priority<P: Port, const N: usize>(&self, lock: &mut CpuLockGuard<'_, P, N>, prio: Priority) {
        let Some(owner) = self.st.get(lock).owner else {
            return;
        };
        match lock.threads.get(owner) {
            Some(tcb) if tcb.status != ThreadStatus::Zombie && prio < tcb.priority => {}
            _ => return,
        }
        log::trace!("{owner:?} inherits priority {prio}");
        thread::change_priority(lock, owner, prio);
    }
}

#[cfg(feature = "priority_inheritance")]
impl Mutex {
    /// Recompute the owner's effective priority after a waiter left the
    /// wait queue without getting the mutex.
    fn reevaluate_inheritance<P: Port, const N: usize>(&self, lock: &mut CpuLockGuard<'_, P, N>) {
        if let Some(owner) = self.st.get(lock).owner {
            restore_priority(lock, owner);
        }
        if let Some(waiter) = self.waiters.first(lock) {
            let prio = lock.threads[waiter].priority;
            self.inherit_priority(lock, prio);
        }
    }
}

/// Return the effective priority of `owner` to its base priority.
#[cfg(feature = "priority_inheritance")]
fn restore_priority<P: Port, const N: usize>(lock: &mut CpuLockGuard<'_, P, N>, owner: Pid) {
    let base = match lock.threads.get(owner) {
        Some(tcb) if tcb.status != ThreadStatus::Zombie && tcb.priority != tcb.base_priority => {
            tcb.base_priority
        }
        _ => return,
    };
    log::trace!("{owner:?} returns to priority {base}");
    thread::change_priority(lock, owner, base);
}
