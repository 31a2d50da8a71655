//! The simulated CPU
//!
//! The CPU is a token passed between host threads. The context holding it
//! (`Cpu::running`) is the only one that executes; every other context is
//! parked in [`Port::context_switch`] waiting for the token to come back.
use ember_kernel::{Port, Ticks};
use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    collections::VecDeque,
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    ptr::NonNull,
    sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    thread,
    time::{Duration, Instant},
};

use crate::{
    timer::{self, TimerCmd},
    Entry, Isr, SimConfig, SimKernel,
};

/// A context that can hold the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ctx {
    /// The context that services interrupts while no thread is running.
    Idle,
    /// A kernel thread, identified by the address of its [`SimThreadState`].
    Thread(usize),
}

impl Ctx {
    fn of(state: Option<&SimThreadState>) -> Self {
        match state {
            Some(state) => Self::Thread(state as *const SimThreadState as usize),
            None => Self::Idle,
        }
    }
}

/// The role of a host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The backing thread of the idle context.
    Idle,
    /// The backing thread of a kernel thread.
    Thread(usize),
}

impl ThreadRole {
    fn ctx(self) -> Option<Ctx> {
        match self {
            Self::Unknown => None,
            Self::Idle => Some(Ctx::Idle),
            Self::Thread(addr) => Some(Ctx::Thread(addr)),
        }
    }
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the simulator.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

/// Assert that the current thread is managed by the simulator.
fn expect_worker_thread() -> Ctx {
    match THREAD_ROLE.with(|r| r.get()).ctx() {
        Some(ctx) => ctx,
        None => panic!("kernel functions can't be called from a host thread outside the simulator"),
    }
}

/// The unwinding payload that ends a host thread without reporting a
/// panic.
pub(crate) struct ThreadExit;

/// The state of the simulated CPU.
pub(crate) struct Cpu {
    running: Ctx,
    irq_masked: bool,
    in_isr: bool,
    pending: VecDeque<Isr>,
    /// The first panic that escaped a simulated context.
    pub(crate) panic: Option<Box<dyn Any + Send>>,
    pub(crate) shutdown: bool,
    pub(crate) main_done: bool,
}

/// The state shared by the port, the simulator and the host threads.
pub(crate) struct Shared {
    cpu: Mutex<Cpu>,
    cpu_cond: Condvar,
    kernel: OnceCell<Weak<SimKernel>>,
    timer_cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
    origin: Instant,
    pub(crate) config: SimConfig,
}

impl Shared {
    pub(crate) fn new(config: SimConfig, timer_cmd_send: mpsc::Sender<TimerCmd>) -> Self {
        Self {
            cpu: Mutex::new(Cpu {
                running: Ctx::Idle,
                irq_masked: false,
                in_isr: false,
                pending: VecDeque::new(),
                panic: None,
                shutdown: false,
                main_done: false,
            }),
            cpu_cond: Condvar::new(),
            kernel: OnceCell::new(),
            timer_cmd_send: SpinMutex::new(Some(timer_cmd_send)),
            origin: Instant::now(),
            config,
        }
    }

    pub(crate) fn set_kernel(&self, kernel: Weak<SimKernel>) {
        if self.kernel.set(kernel).is_err() {
            panic!("the kernel is already set");
        }
    }

    fn kernel(&self) -> Option<Arc<SimKernel>> {
        self.kernel.get()?.upgrade()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Cpu> {
        // A panic never leaves `Cpu` inconsistent
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<'a>(
        &self,
        cpu: MutexGuard<'a, Cpu>,
        condition: impl FnMut(&mut Cpu) -> bool,
    ) -> MutexGuard<'a, Cpu> {
        self.cpu_cond
            .wait_while(cpu, condition)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// [`Self::wait_while`] with a timeout.
    pub(crate) fn wait_timeout_while<'a>(
        &self,
        cpu: MutexGuard<'a, Cpu>,
        timeout: Duration,
        condition: impl FnMut(&mut Cpu) -> bool,
    ) -> MutexGuard<'a, Cpu> {
        self.cpu_cond
            .wait_timeout_while(cpu, timeout, condition)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    pub(crate) fn notify(&self) {
        self.cpu_cond.notify_all();
    }

    /// Record a panic that escaped a simulated context and shut down.
    fn fail_locked(&self, cpu: &mut Cpu, e: Box<dyn Any + Send>) {
        if e.is::<ThreadExit>() {
            return;
        }
        log::debug!("a simulated context panicked, shutting down");
        if cpu.panic.is_none() {
            cpu.panic = Some(e);
        }
        cpu.shutdown = true;
        self.notify();
    }

    fn fail(&self, e: Box<dyn Any + Send>) {
        let mut cpu = self.lock();
        self.fail_locked(&mut cpu, e);
    }

    /// Stop every simulated context. Parked contexts and contexts entering
    /// the kernel unwind with [`ThreadExit`].
    pub(crate) fn shutdown(&self) {
        let mut cpu = self.lock();
        cpu.shutdown = true;
        self.notify();
        drop(cpu);

        // Stop the timer thread
        *self.timer_cmd_send.lock() = None;
    }

    /// Queue an interrupt handler. It's taken right away if the caller
    /// holds the CPU with interrupts unmasked.
    pub(crate) fn pend(&self, isr: Isr) {
        let mut cpu = self.lock();
        cpu.pending.push_back(isr);
        self.notify();

        let here = THREAD_ROLE.with(|r| r.get()).ctx();
        if here == Some(cpu.running) {
            self.take_interrupts(cpu);
        }
    }

    /// Service pending interrupts while the current context has interrupts
    /// unmasked.
    fn take_interrupts<'a>(&'a self, mut cpu: MutexGuard<'a, Cpu>) {
        while !cpu.irq_masked && !cpu.in_isr && !cpu.shutdown && !thread::panicking() {
            let Some(kernel) = self.kernel() else {
                break;
            };
            let Some(isr) = cpu.pending.pop_front() else {
                break;
            };

            // Interrupts are masked on entry to a handler
            cpu.in_isr = true;
            cpu.irq_masked = true;
            drop(cpu);

            log::trace!("interrupt handler enter");
            let result = panic::catch_unwind(AssertUnwindSafe(|| isr(&kernel)));
            log::trace!("interrupt handler exit");

            cpu = self.lock();
            cpu.in_isr = false;
            cpu.irq_masked = false;
            if let Err(e) = result {
                self.fail_locked(&mut cpu, e);
                break;
            }
            drop(cpu);

            kernel.isr_end();

            cpu = self.lock();
        }
    }

    /// Give the CPU to `to`, spawning its backing host thread if it hasn't
    /// started yet.
    fn hand_over(self: &Arc<Self>, cpu: &mut Cpu, to: Option<&SimThreadState>) {
        let ctx = Ctx::of(to);
        log::trace!("switching to {ctx:?}");
        cpu.running = ctx;

        if let Some(to) = to {
            let mut tsm = to.tsm.lock();
            match mem::replace(&mut *tsm, Tsm::Running) {
                Tsm::Dormant(entry) => self.start_thread(ctx, entry),
                Tsm::Running => {}
                Tsm::Uninit => panic!("switching to an uninitialized thread {to:p}"),
            }
        }

        self.notify();
    }

    fn start_thread(self: &Arc<Self>, ctx: Ctx, entry: Entry) {
        let Ctx::Thread(addr) = ctx else {
            unreachable!()
        };
        let shared = Arc::clone(self);

        spawn_host_thread(format!("ember-{addr:#x}"), move || {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Thread(addr)));

            let Some(kernel) = shared.kernel() else {
                return;
            };

            let cpu = shared.wait_while(shared.lock(), |cpu| {
                cpu.running != ctx && !cpu.shutdown
            });
            if cpu.shutdown {
                return;
            }

            log::debug!("thread {addr:#x} is now running");

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                // A thread starts with interrupts unmasked
                let mut cpu = cpu;
                cpu.irq_masked = false;
                shared.take_interrupts(cpu);

                entry(&kernel);
                kernel.thread_exit();
            }));

            if let Err(e) = result {
                shared.fail(e);
            }
            log::trace!("host thread of {addr:#x} exits");
        });

        log::trace!("spawned a host thread for {addr:#x}");
    }

    /// The body of the idle context's host thread.
    pub(crate) fn run_idle(self: &Arc<Self>) {
        THREAD_ROLE.with(|role| role.set(ThreadRole::Idle));

        let result = panic::catch_unwind(AssertUnwindSafe(|| loop {
            let mut cpu = self.wait_while(self.lock(), |cpu| {
                !cpu.shutdown && !(cpu.running == Ctx::Idle && !cpu.pending.is_empty())
            });
            if cpu.shutdown {
                break;
            }

            // The idle context runs with interrupts unmasked
            cpu.irq_masked = false;
            self.take_interrupts(cpu);
        }));

        if let Err(e) = result {
            self.fail(e);
        }
        log::trace!("idle thread exits");
    }

    fn now(&self) -> Ticks {
        timer::duration_to_ticks(self.config.tick, self.origin.elapsed())
    }

    fn set_alarm(&self, at: Ticks) {
        let at = self
            .origin
            .checked_add(timer::ticks_to_duration(self.config.tick, at));
        if let Some(timer_cmd_send) = &*self.timer_cmd_send.lock() {
            // The receiver is gone only during shutdown
            let _ = timer_cmd_send.send(TimerCmd::SetAlarm { at });
        }
    }
}

/// Spawn a host thread, panicking if the host refuses.
pub(crate) fn spawn_host_thread(
    name: String,
    f: impl FnOnce() + Send + 'static,
) -> thread::JoinHandle<()> {
    match thread::Builder::new().name(name).spawn(f) {
        Ok(join_handle) => join_handle,
        Err(e) => panic!("failed to spawn a host thread: {e}"),
    }
}

/// The port-owned state of a kernel thread.
#[derive(Default)]
pub struct SimThreadState {
    /// The thread's state in the thread state machine.
    ///
    /// Only accessed with interrupts masked, so `SpinMutex` never spins.
    tsm: SpinMutex<Tsm>,
}

/// Thread state machine
///
/// These don't exactly align with the thread statuses defined in the
/// kernel.
#[derive(Default)]
enum Tsm {
    /// The context is not initialized, or the thread has exited.
    #[default]
    Uninit,
    /// The context is initialized, but the thread hasn't started running.
    Dormant(Entry),
    /// The thread has a backing host thread.
    Running,
}

impl fmt::Debug for SimThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tsm = match self.tsm.try_lock().as_deref() {
            Some(Tsm::Uninit) => "Uninit",
            Some(Tsm::Dormant(_)) => "Dormant",
            Some(Tsm::Running) => "Running",
            None => "< locked >",
        };
        f.debug_struct("SimThreadState").field("tsm", &tsm).finish()
    }
}

/// The simulator's implementation of [`Port`].
pub struct SimPort {
    shared: Arc<Shared>,
}

impl SimPort {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Get the simulator configuration.
    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    /// Pend a simulated interrupt. `f` is called in an interrupt context.
    ///
    /// Can be called from any host thread. When called by the context
    /// holding the CPU with interrupts unmasked, the interrupt is taken
    /// before this method returns.
    pub fn pend_interrupt(&self, f: impl FnOnce(&SimKernel) + Send + 'static) {
        log::trace!("pend_interrupt");
        self.shared.pend(Box::new(f));
    }
}

impl fmt::Debug for SimPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SimPort")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

unsafe impl Port for SimPort {
    type IrqState = bool;
    type ThreadState = SimThreadState;
    type Entry = Entry;

    fn irq_disable(&self) -> bool {
        let here = expect_worker_thread();
        let mut cpu = self.shared.lock();

        if cpu.shutdown && !thread::panicking() {
            drop(cpu);
            panic::resume_unwind(Box::new(ThreadExit));
        }

        if cpu.running != here {
            let running = cpu.running;
            drop(cpu);
            panic!("{here:?} entered the kernel while {running:?} holds the CPU");
        }

        mem::replace(&mut cpu.irq_masked, true)
    }

    fn irq_restore(&self, masked: bool) {
        let mut cpu = self.shared.lock();
        cpu.irq_masked = masked;
        if !masked {
            self.shared.take_interrupts(cpu);
        }
    }

    fn irq_is_in(&self) -> bool {
        self.shared.lock().in_isr
    }

    unsafe fn initialize_thread_state(
        &self,
        state: &SimThreadState,
        _stack: NonNull<[u8]>,
        entry: Entry,
    ) {
        log::trace!("initialize_thread_state({state:p})");
        let mut tsm = state.tsm.lock();
        if let Tsm::Running = *tsm {
            drop(tsm);
            panic!("the thread state {state:p} is still in use");
        }
        *tsm = Tsm::Dormant(entry);
    }

    unsafe fn context_switch(&self, from: Option<&SimThreadState>, to: Option<&SimThreadState>) {
        let from = Ctx::of(from);
        let mut cpu = self.shared.lock();
        self.shared.hand_over(&mut cpu, to);

        let cpu = self
            .shared
            .wait_while(cpu, |cpu| cpu.running != from && !cpu.shutdown);
        if cpu.running != from {
            drop(cpu);
            log::trace!("{from:?} is stopped by the shutdown");
            panic::resume_unwind(Box::new(ThreadExit));
        }
    }

    unsafe fn exit_and_switch(&self, from: &SimThreadState, to: Option<&SimThreadState>) -> ! {
        log::trace!("exit_and_switch({from:p})");
        *from.tsm.lock() = Tsm::Uninit;

        let mut cpu = self.shared.lock();
        self.shared.hand_over(&mut cpu, to);
        drop(cpu);

        // Unwind to the host thread's entry point, which exits quietly
        panic::resume_unwind(Box::new(ThreadExit))
    }

    fn now(&self) -> Ticks {
        self.shared.now()
    }

    fn set_alarm(&self, at: Ticks) {
        log::trace!("set_alarm({at})");
        self.shared.set_alarm(at);
    }
}
