//! The core of a priority-preemptive real-time kernel.
//!
//! This crate provides the scheduler, the thread control block registry and
//! the synchronization and IPC primitives built on them:
//!
//!  - [`Kernel`]: threads, the run queues, sleeping and timeouts
//!  - [`Mutex`]: a lock with priority-ordered waiters and ownership hand-off
//!  - [`EventQueue`]: FIFO delivery of [`Event`]s to a single waiting thread
//!  - Message passing between threads ([`Kernel::msg_send`] et al.) and
//!    [`MsgBus`]
//!  - Thread flags ([`Kernel::thread_flags_set`] et al.)
//!
//! The kernel is hardware-agnostic. Context switching, interrupt masking and
//! the tick source are supplied by a [`Port`].
//!
//! # Priorities
//!
//! There are [`SCHED_PRIO_LEVELS`] priority levels. **Lower values represent
//! higher priorities.** The scheduler always runs the highest-priority
//! runnable thread. Threads of the same priority are not time-sliced; they
//! take turns only when the running thread blocks or calls
//! [`Kernel::thread_yield`].
//!
//! # Contexts
//!
//! Kernel functions are called either from a *thread context* or from an
//! *interrupt context* ([`Port::irq_is_in`] returns `true`). Operations that
//! may block panic when called from an interrupt context. In an interrupt
//! context, scheduling decisions are deferred until the port calls
//! [`Kernel::isr_end`].
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
use core::{fmt, num::NonZeroUsize, ptr::NonNull, sync::atomic::AtomicBool};

mod error;
mod event;
mod klock;
mod msg;
mod mutex;
mod state;
mod thread;
mod thread_flags;
mod timeout;
mod utils;
mod wait;


pub use self::{
    error::*,
    event::{Event, EventHandler, EventQueue},
    msg::{Message, MsgBus},
    mutex::Mutex,
    thread::{CreateFlags, ThreadStatus},
    thread_flags::{ThreadFlags, THREAD_FLAG_EVENT},
};

/// Ticks of the monotonic time source. The length of a tick is defined by
/// the port.
pub type Ticks = u64;

/// Thread priority. Lower values represent higher priorities.
pub type Priority = u8;

/// The number of priority levels.
pub const SCHED_PRIO_LEVELS: usize = 16;

/// The lowest priority.
pub const PRIORITY_IDLE: Priority = (SCHED_PRIO_LEVELS - 1) as Priority;

/// The customary priority of an application's main thread.
pub const PRIORITY_MAIN: Priority = (SCHED_PRIO_LEVELS / 2 - 1) as Priority;

/// Thread identifier.
///
/// A `Pid` is unique among the threads that exist at the same time. It's
/// reused only after the thread that had it is reaped by
/// [`Kernel::thread_kill_zombie`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(NonZeroUsize);

impl Pid {
    /// Construct a `Pid` from its numeric value. Returns `None` if `value` is
    /// zero.
    pub const fn new(value: usize) -> Option<Self> {
        match NonZeroUsize::new(value) {
            Some(x) => Some(Self(x)),
            None => None,
        }
    }

    /// Get the numeric value of the `Pid`.
    pub const fn get(self) -> usize {
        self.0.get()
    }

    pub(crate) fn from_index(i: usize) -> Self {
        match Self::new(i + 1) {
            Some(pid) => pid,
            None => unreachable!(),
        }
    }

    pub(crate) fn index(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Implemented by a port to provide the hardware-dependent parts of the
/// kernel.
///
/// # Safety
///
/// The kernel relies on the described behavior of every method for memory
/// safety. In particular, `irq_disable` must really prevent interrupt
/// handlers from running until the matching `irq_restore`, and
/// `context_switch` must not return to a thread before the thread is chosen
/// again by the kernel.
pub unsafe trait Port: Sync + Sized + 'static {
    /// The saved interrupt mask returned by [`Self::irq_disable`].
    type IrqState: Copy;

    /// The architecture-owned state of a thread (e.g., its saved context).
    /// The kernel keeps one instance per thread table slot at a fixed
    /// address.
    type ThreadState: Default + Send + Sync + 'static;

    /// The code a thread starts executing.
    type Entry: Send;

    /// Mask interrupts and return the previous mask state. Must be callable
    /// from any context, including when interrupts are already masked.
    fn irq_disable(&self) -> Self::IrqState;

    /// Restore the interrupt mask state returned by the matching
    /// [`Self::irq_disable`].
    fn irq_restore(&self, state: Self::IrqState);

    /// Return `true` if the caller is an interrupt handler.
    fn irq_is_in(&self) -> bool;

    /// Prepare `state` so that switching to it starts executing `entry` on
    /// `stack`.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. `state` does not represent a
    /// live thread.
    unsafe fn initialize_thread_state(
        &self,
        state: &Self::ThreadState,
        stack: NonNull<[u8]>,
        entry: Self::Entry,
    );

    /// Save the context of `from` and restore the context of `to`. `None`
    /// designates the idle context, which doesn't belong to any thread.
    ///
    /// Called with interrupts masked and the kernel state unlocked. Returns
    /// when `from` is resumed by another call to this method, at which point
    /// interrupts are still masked.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. `from` must represent the
    /// calling context.
    unsafe fn context_switch(
        &self,
        from: Option<&Self::ThreadState>,
        to: Option<&Self::ThreadState>,
    );

    /// Discard the context of `from`, which is terminating, and restore the
    /// context of `to`.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. `from` must represent the
    /// calling context.
    unsafe fn exit_and_switch(
        &self,
        from: &Self::ThreadState,
        to: Option<&Self::ThreadState>,
    ) -> !;

    /// Read the monotonic tick source.
    fn now(&self) -> Ticks;

    /// Request a call to [`Kernel::handle_tick`] from an interrupt context
    /// when [`Self::now`] reaches `at`. Replaces the previous request. A
    /// call with `at` in the past must fire as soon as possible.
    fn set_alarm(&self, at: Ticks);
}

/// The kernel instance: the scheduler context holding the thread table, the
/// run queues and the timeout queue.
///
/// `N` is the size of the thread table.
pub struct Kernel<P: Port, const N: usize = 32> {
    port: P,
    state: spin::Mutex<state::State<N>>,
    port_thread_states: [P::ThreadState; N],
    /// Set when a scheduling decision was requested in an interrupt context.
    switch_request: AtomicBool,
}

impl<P: Port, const N: usize> Kernel<P, N> {
    /// Construct a kernel with no threads. The CPU is idle until the first
    /// thread is created.
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: spin::Mutex::new(state::State::new()),
            port_thread_states: core::array::from_fn(|_| P::ThreadState::default()),
            switch_request: AtomicBool::new(false),
        }
    }

    /// Get a reference to the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Read the tick source.
    pub fn now(&self) -> Ticks {
        self.port.now()
    }

    fn port_thread_state(&self, pid: Pid) -> &P::ThreadState {
        &self.port_thread_states[pid.index()]
    }
}

impl<P: Port, const N: usize> fmt::Debug for Kernel<P, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.state.try_lock() {
            Some(state) => f.debug_struct("Kernel").field("state", &*state).finish(),
            None => f.write_str("Kernel(< locked >)"),
        }
    }
}
