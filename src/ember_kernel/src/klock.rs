//! Kernel state locking mechanism
//!
//! The kernel state is protected by masking interrupts ("CPU Lock"). On top
//! of that, the state lives in a spin lock, which never spins in practice
//! because only one context executes at a time; it turns the masked section
//! into a borrow that the compiler can check.
use core::{fmt, mem, ops, sync::atomic::Ordering};

use crate::{state::State, Kernel, Pid, Port};

/// Cell type that can be accessed only while holding a [`CpuLockGuard`].
///
/// Kernel objects that live outside the kernel state (e.g., [`Mutex`]) keep
/// their fields in `CpuLockCell`s.
///
/// [`Mutex`]: crate::Mutex
pub(crate) struct CpuLockCell<T>(spin::Mutex<T>);

impl<T> CpuLockCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(spin::Mutex::new(x))
    }

    pub(crate) fn get<P: Port, const N: usize>(&self, _lock: &CpuLockGuard<'_, P, N>) -> T
    where
        T: Copy,
    {
        *self.0.lock()
    }

    pub(crate) fn replace<P: Port, const N: usize>(
        &self,
        _lock: &mut CpuLockGuard<'_, P, N>,
        x: T,
    ) -> T {
        mem::replace(&mut *self.0.lock(), x)
    }

    pub(crate) fn write<P: Port, const N: usize, R>(
        &self,
        _lock: &mut CpuLockGuard<'_, P, N>,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        f(&mut *self.0.lock())
    }
}

impl<T: fmt::Debug> fmt::Debug for CpuLockCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.try_lock() {
            Some(x) => write!(f, "CpuLockCell({:?})", &*x),
            None => f.write_str("CpuLockCell(< locked >)"),
        }
    }
}

/// Restores the interrupt mask when dropped.
struct IrqRestore<'a, P: Port> {
    port: &'a P,
    prev: P::IrqState,
}

impl<P: Port> Drop for IrqRestore<'_, P> {
    fn drop(&mut self) {
        self.port.irq_restore(self.prev);
    }
}

/// Mask interrupts, lock the kernel state and get an RAII guard.
///
/// Panics if the kernel state is already locked by the current context.
pub(crate) fn lock_cpu<P: Port, const N: usize>(kernel: &Kernel<P, N>) -> CpuLockGuard<'_, P, N> {
    let irq = IrqRestore {
        port: &kernel.port,
        prev: kernel.port.irq_disable(),
    };
    let state = match kernel.state.try_lock() {
        Some(state) => state,
        None => panic!("the kernel state is already locked"),
    };
    CpuLockGuard { state, kernel, irq }
}

/// RAII guard for a CPU Lock state.
pub(crate) struct CpuLockGuard<'a, P: Port, const N: usize> {
    // Fields are dropped in declaration order. The kernel state must be
    // unlocked before interrupts are unmasked.
    state: spin::MutexGuard<'a, State<N>>,
    kernel: &'a Kernel<P, N>,
    irq: IrqRestore<'a, P>,
}

impl<'a, P: Port, const N: usize> CpuLockGuard<'a, P, N> {
    pub(crate) fn port(&self) -> &'a P {
        &self.kernel.port
    }

    /// Let the scheduler choose the thread to run and switch to it.
    ///
    /// In an interrupt context, this only records the request; the switch
    /// happens in [`Kernel::isr_end`]. Otherwise, if another thread is
    /// chosen, this returns when the current thread is chosen again.
    pub(crate) fn dispatch(mut self) -> Self {
        let kernel = self.kernel;
        if kernel.port.irq_is_in() {
            kernel.switch_request.store(true, Ordering::Relaxed);
            return self;
        }
        kernel.switch_request.store(false, Ordering::Relaxed);

        let prev = self.state.running;
        let next = self.state.choose_next();
        if prev == next {
            return self;
        }

        log::trace!("context switch {prev:?} -> {next:?}");

        // Keep interrupts masked across the switch. The kernel state is
        // unlocked so that the next context can lock it.
        let Self { state, kernel, irq } = self;
        drop(state);

        // Safety: We are the kernel, and `prev` is the current context
        unsafe {
            kernel.port.context_switch(
                prev.map(|pid| kernel.port_thread_state(pid)),
                next.map(|pid| kernel.port_thread_state(pid)),
            );
        }

        let state = match kernel.state.try_lock() {
            Some(state) => state,
            None => panic!("the kernel state was left locked by a context switch"),
        };
        Self { state, kernel, irq }
    }

    /// Terminate the current thread `me` and switch to the next thread.
    /// The caller must have removed `me` from the run queue.
    pub(crate) fn exit_and_dispatch(mut self, me: Pid) -> ! {
        let next = self.state.choose_next();
        debug_assert_ne!(next, Some(me));

        log::trace!("exit {me:?} -> {next:?}");

        let Self { state, kernel, irq } = self;
        drop(state);

        // `me` will never restore the interrupt mask it saved
        mem::forget(irq);

        // Safety: We are the kernel, and `me` is the current context
        unsafe {
            kernel.port.exit_and_switch(
                kernel.port_thread_state(me),
                next.map(|pid| kernel.port_thread_state(pid)),
            )
        }
    }
}

impl<P: Port, const N: usize> ops::Deref for CpuLockGuard<'_, P, N> {
    type Target = State<N>;
    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl<P: Port, const N: usize> ops::DerefMut for CpuLockGuard<'_, P, N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}
