//! Threads
use core::{fmt, ptr::NonNull};

use crate::{
    error::{CreateThreadError, KillZombieError, SetPriorityError, WakeupError},
    klock::{self, CpuLockGuard},
    msg::{self, ThreadMsgState},
    state::{self, State},
    thread_flags::ThreadFlags,
    timeout,
    utils::intrusive_list::Link,
    wait::{self, Membership, WaitResult},
    Kernel, Pid, Port, Priority, Ticks, SCHED_PRIO_LEVELS,
};

pub(crate) mod readyqueue;

/// The byte pattern written to a stack by [`CreateFlags::STACKTEST`].
const STACK_CANARY: u8 = 0xa5;

/// Thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    /// The thread owns the CPU.
    Running,
    /// The thread is ready to run and is in a run queue.
    Pending,
    /// The thread is waiting for [`Kernel::thread_wakeup`] or for the end of
    /// a delay.
    Sleeping,
    /// The thread is waiting for a [`Mutex`](crate::Mutex).
    BlockedMutex,
    /// The thread is waiting for a message.
    BlockedReceive,
    /// The thread is waiting for the target's message queue to accept its
    /// message.
    BlockedSend,
    /// The thread is waiting for the reply to [`Kernel::msg_send_receive`].
    BlockedReply,
    /// The thread is waiting for any of a set of thread flags.
    BlockedFlagAny,
    /// The thread is waiting for all of a set of thread flags.
    BlockedFlagAll,
    /// The thread has exited, and its TCB slot is waiting to be reclaimed
    /// by [`Kernel::thread_kill_zombie`].
    Zombie,
}

bitflags::bitflags! {
    /// Options for [`Kernel::thread_create`].
    pub struct CreateFlags: u8 {
        /// Create the thread in the `Sleeping` state. It starts running
        /// when [`Kernel::thread_wakeup`] is called on it.
        const SLEEPING = 1 << 0;
        /// Don't reschedule after creating the thread, even if it has a
        /// higher priority than the caller.
        const WITHOUT_YIELD = 1 << 1;
        /// Fill the stack with a known pattern, enabling
        /// [`Kernel::measure_stack_free`].
        const STACKTEST = 1 << 2;
    }
}

/// The memory region given to a thread as its stack.
pub(crate) struct StackRef(NonNull<[u8]>);

// Safety: The region was given as `&'static mut [u8]`. The kernel only hands
// it back after the owning thread has terminated.
unsafe impl Send for StackRef {}

/// *Thread control block* - the state data of a thread.
pub(crate) struct Tcb {
    pub(crate) name: &'static str,

    /// The effective priority. Differs from `base_priority` while the
    /// thread is raised by priority inheritance.
    pub(crate) priority: Priority,
    pub(crate) base_priority: Priority,

    pub(crate) status: ThreadStatus,

    /// The link to the list identified by `membership`.
    pub(crate) link: Link<Pid>,
    pub(crate) membership: Membership,

    /// The outcome of the last wait.
    pub(crate) wait_result: WaitResult,

    /// The position in the timeout heap.
    pub(crate) timeout_pos: Option<usize>,

    pub(crate) stack: StackRef,
    pub(crate) stack_test: bool,

    pub(crate) flags: ThreadFlags,
    /// The flags awaited by a `BlockedFlagAny` or `BlockedFlagAll` thread.
    pub(crate) flag_wait_mask: ThreadFlags,

    pub(crate) msg: ThreadMsgState,

    /// The address of a mutex for which a lock request has been canceled in
    /// advance.
    pub(crate) mutex_cancel: Option<usize>,

    /// The value of `State::num_created` when the thread was created.
    pub(crate) serial: u32,
}

impl Tcb {
    fn new(
        name: &'static str,
        priority: Priority,
        stack: NonNull<[u8]>,
        stack_test: bool,
        serial: u32,
    ) -> Self {
        Self {
            name,
            priority,
            base_priority: priority,
            status: ThreadStatus::Pending,
            link: Link::new(),
            membership: Membership::None,
            wait_result: WaitResult::Woken,
            timeout_pos: None,
            stack: StackRef(stack),
            stack_test,
            flags: 0,
            flag_wait_mask: 0,
            msg: ThreadMsgState::new(),
            mutex_cancel: None,
            serial,
        }
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("base_priority", &self.base_priority)
            .field("status", &self.status)
            .field("membership", &self.membership)
            .field("timeout_pos", &self.timeout_pos)
            .field("flags", &self.flags)
            .field("msg", &self.msg)
            .finish_non_exhaustive()
    }
}

/// Change the effective priority of `pid`, moving it within the list it
/// belongs to. The caller is responsible for calling `dispatch` afterwards.
pub(crate) fn change_priority<P: Port, const N: usize>(
    lock: &mut CpuLockGuard<'_, P, N>,
    pid: Pid,
    priority: Priority,
) {
    if lock.threads[pid].priority == priority {
        return;
    }

    let membership = lock.threads[pid].membership;
    match membership {
        Membership::None => lock.threads[pid].priority = priority,
        Membership::ReadyQueue => {
            let State { ready, threads, .. } = &mut **lock;
            ready.remove(threads, pid);
            threads[pid].priority = priority;
            ready.push_back(threads, pid);
        }
        // Wait lists are priority-ordered. Re-insert to keep them so.
        _ => {
            wait::unlink(lock, pid);
            lock.threads[pid].priority = priority;
            wait::insert_waiter(lock, pid, membership);
        }
    }
}

/// Thread management
impl<P: Port, const N: usize> Kernel<P, N> {
    /// Create a thread.
    ///
    /// The thread starts in the `Pending` state, or in `Sleeping` if
    /// [`CreateFlags::SLEEPING`] is given. Unless `SLEEPING` or
    /// [`CreateFlags::WITHOUT_YIELD`] is given, the scheduler runs
    /// immediately, so a new thread with a higher priority than the caller
    /// preempts it.
    ///
    /// Fails with `BadParam` if `priority` is not less than
    /// [`SCHED_PRIO_LEVELS`] or `stack` is empty, and with `NoFreeSlot` if
    /// the thread table is full.
    pub fn thread_create(
        &self,
        stack: &'static mut [u8],
        priority: Priority,
        flags: CreateFlags,
        entry: P::Entry,
        name: &'static str,
    ) -> Result<Pid, CreateThreadError> {
        if priority as usize >= SCHED_PRIO_LEVELS || stack.is_empty() {
            return Err(CreateThreadError::BadParam);
        }

        let stack_test = flags.contains(CreateFlags::STACKTEST);
        if stack_test {
            stack.fill(STACK_CANARY);
        }
        let stack = NonNull::from(stack);

        let mut lock = klock::lock_cpu(self);

        lock.num_created = lock.num_created.wrapping_add(1);
        let serial = lock.num_created;
        let pid = lock
            .threads
            .alloc(Tcb::new(name, priority, stack, stack_test, serial))
            .ok_or(CreateThreadError::NoFreeSlot)?;
        lock.num_threads += 1;

        // Safety: The slot was free, so its thread state does not represent
        // a live thread
        unsafe {
            self.port
                .initialize_thread_state(self.port_thread_state(pid), stack, entry);
        }

        log::debug!("created {pid:?} ({name:?}) at priority {priority}");

        if flags.contains(CreateFlags::SLEEPING) {
            lock.threads[pid].status = ThreadStatus::Sleeping;
        } else {
            let State { ready, threads, .. } = &mut *lock;
            ready.push_back(threads, pid);
        }

        if !flags.intersects(CreateFlags::SLEEPING | CreateFlags::WITHOUT_YIELD) {
            lock.dispatch();
        }

        Ok(pid)
    }

    /// Get the current thread. Returns `None` in an interrupt context or
    /// when no thread is running.
    pub fn current_pid(&self) -> Option<Pid> {
        let lock = klock::lock_cpu(self);
        state::current_thread(&lock)
    }

    /// Get the status of a thread, or `None` if `pid` does not designate a
    /// thread.
    pub fn status(&self, pid: Pid) -> Option<ThreadStatus> {
        let lock = klock::lock_cpu(self);
        lock.threads.get(pid).map(|tcb| tcb.status)
    }

    /// Get the effective priority of a thread.
    pub fn priority(&self, pid: Pid) -> Option<Priority> {
        let lock = klock::lock_cpu(self);
        lock.threads.get(pid).map(|tcb| tcb.priority)
    }

    /// Get the name a thread was created with.
    pub fn name(&self, pid: Pid) -> Option<&'static str> {
        let lock = klock::lock_cpu(self);
        lock.threads.get(pid).map(|tcb| tcb.name)
    }

    /// Get the number of occupied thread table slots, including zombies.
    pub fn thread_count(&self) -> usize {
        klock::lock_cpu(self).num_threads
    }

    /// Change the base priority of a thread and reschedule.
    ///
    /// If the thread currently has a raised effective priority due to
    /// priority inheritance, the effective priority is only lowered when the
    /// inheritance ends.
    pub fn set_priority(&self, pid: Pid, priority: Priority) -> Result<(), SetPriorityError> {
        if priority as usize >= SCHED_PRIO_LEVELS {
            return Err(SetPriorityError::BadParam);
        }

        let mut lock = klock::lock_cpu(self);
        let tcb = match lock.threads.get_mut(pid) {
            Some(tcb) if tcb.status != ThreadStatus::Zombie => tcb,
            _ => return Err(SetPriorityError::NoAccess),
        };

        let boosted = tcb.priority < tcb.base_priority;
        tcb.base_priority = priority;
        let effective = if boosted {
            tcb.priority.min(priority)
        } else {
            priority
        };

        change_priority(&mut lock, pid, effective);
        lock.dispatch();
        Ok(())
    }

    /// Let the scheduler choose the thread to run.
    ///
    /// In an interrupt context, the decision is deferred until
    /// [`Self::isr_end`].
    pub fn schedule(&self) {
        klock::lock_cpu(self).dispatch();
    }

    /// Switch to a thread with a strictly higher priority than the current
    /// thread, if one is ready. Can be called from any context.
    pub fn thread_yield_higher(&self) {
        self.schedule();
    }

    /// Move the current thread to the back of its run queue and reschedule,
    /// letting other ready threads with the same priority run.
    ///
    /// Panics if called from an interrupt context.
    pub fn thread_yield(&self) {
        let mut lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);

        let State { ready, threads, .. } = &mut *lock;
        threads[me].status = ThreadStatus::Pending;
        ready.push_back(threads, me);

        lock.dispatch();
    }

    /// Called by the port when leaving an interrupt handler, outside the
    /// interrupt context. Performs the scheduling decisions requested by the
    /// handler.
    pub fn isr_end(&self) {
        if self.switch_request.swap(false, core::sync::atomic::Ordering::Relaxed) {
            self.schedule();
        }
    }

    /// The alarm handler. Must be called by the port from an interrupt
    /// context when the time set by [`Port::set_alarm`] is reached.
    pub fn handle_tick(&self) {
        let mut lock = klock::lock_cpu(self);
        let now = self.port.now();
        timeout::expire(&mut lock, now);
        lock.dispatch();
    }

    /// Put the current thread to sleep until [`Self::thread_wakeup`] is
    /// called on it.
    pub fn thread_sleep(&self) {
        let lock = klock::lock_cpu(self);
        wait::wait(lock, ThreadStatus::Sleeping, None, None);
    }

    /// Wake up a thread that is in the `Sleeping` state.
    ///
    /// Also ends a [`Self::sleep_for`] or [`Self::sleep_until`] call early.
    pub fn thread_wakeup(&self, pid: Pid) -> Result<(), WakeupError> {
        let mut lock = klock::lock_cpu(self);
        match lock.threads.get(pid) {
            None => return Err(WakeupError::NoAccess),
            Some(tcb) if tcb.status != ThreadStatus::Sleeping => {
                return Err(WakeupError::BadObjectState)
            }
            Some(_) => {}
        }

        wait::wake(&mut lock, pid, WaitResult::Woken);
        lock.dispatch();
        Ok(())
    }

    /// Put the current thread to sleep for `ticks` ticks.
    pub fn sleep_for(&self, ticks: Ticks) {
        let lock = klock::lock_cpu(self);
        let at = timeout::deadline_after(&lock, ticks);
        sleep_until_locked(lock, at);
    }

    /// Put the current thread to sleep until [`Self::now`] reaches `at`.
    /// Returns immediately if `at` has already passed.
    pub fn sleep_until(&self, at: Ticks) {
        let lock = klock::lock_cpu(self);
        sleep_until_locked(lock, at);
    }

    /// Terminate the current thread.
    ///
    /// The thread becomes a zombie and keeps its TCB slot and stack until
    /// another thread calls [`Self::thread_kill_zombie`]. Threads waiting
    /// to send a message to the exiting thread, or waiting for its reply,
    /// are released with an error.
    ///
    /// Panics if called from an interrupt context.
    pub fn thread_exit(&self) -> ! {
        let mut lock = klock::lock_cpu(self);
        let me = state::expect_waitable_context(&lock);

        log::debug!("{me:?} exits");

        lock.threads[me].status = ThreadStatus::Zombie;
        msg::release_peers(&mut lock, me);

        lock.exit_and_dispatch(me)
    }

    /// Reclaim the TCB slot of a zombie thread and return its stack.
    ///
    /// The `Pid` may be reused by the next [`Self::thread_create`] call.
    pub fn thread_kill_zombie(&self, pid: Pid) -> Result<&'static mut [u8], KillZombieError> {
        let mut lock = klock::lock_cpu(self);
        match lock.threads.get(pid) {
            None => return Err(KillZombieError::NoAccess),
            Some(tcb) if tcb.status != ThreadStatus::Zombie => {
                return Err(KillZombieError::BadObjectState)
            }
            Some(_) => {}
        }

        let tcb = lock.threads.free(pid).ok_or(KillZombieError::NoAccess)?;
        lock.num_threads -= 1;

        log::debug!("reaped {pid:?}");

        // Safety: The region was `&'static mut [u8]`, and the zombie will
        // never run again
        Ok(unsafe { &mut *tcb.stack.0.as_ptr() })
    }

    /// Get the number of bytes at the low end of a thread's stack that
    /// have never been written. Returns `None` if the thread does not exist
    /// or was created without [`CreateFlags::STACKTEST`].
    pub fn measure_stack_free(&self, pid: Pid) -> Option<usize> {
        let lock = klock::lock_cpu(self);
        let tcb = lock.threads.get(pid)?;
        if !tcb.stack_test {
            return None;
        }

        let stack = tcb.stack.0;
        let base = stack.as_ptr() as *const u8;
        let free = (0..stack.len())
            // Safety: In bounds of the stack region. The owning thread may
            // be writing to it concurrently, hence the volatile access.
            .take_while(|&i| unsafe { base.add(i).read_volatile() } == STACK_CANARY)
            .count();
        Some(free)
    }
}

fn sleep_until_locked<P: Port, const N: usize>(lock: CpuLockGuard<'_, P, N>, at: Ticks) {
    if at <= lock.port().now() {
        return;
    }
    wait::wait(lock, ThreadStatus::Sleeping, None, Some(at));
}
