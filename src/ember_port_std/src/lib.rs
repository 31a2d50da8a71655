#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use ember_kernel::{CreateFlags, CreateThreadError, Kernel, Pid, Priority};
use std::{
    panic,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

mod cpu;
mod timer;

pub use self::cpu::{SimPort, SimThreadState};

/// The kernel type run by the simulator.
pub type SimKernel = Kernel<SimPort>;

/// The entry point of a simulated thread.
pub type Entry = Box<dyn FnOnce(&SimKernel) + Send>;

/// A simulated interrupt handler.
pub type Isr = Box<dyn FnOnce(&SimKernel) + Send>;

/// Run-time parameters of the simulator.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// The stack size of the threads created by [`spawn`] and
    /// [`Simulator::run_main`]. The stacks are only used for bookkeeping.
    pub stack_size: usize,
    /// The length of a kernel tick.
    pub tick: Duration,
    /// How long [`Simulator::run_main`] waits for the main thread to finish
    /// before it reports a deadlock.
    pub deadlock_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            stack_size: 4096,
            tick: Duration::from_millis(1),
            deadlock_timeout: Duration::from_secs(10),
        }
    }
}

/// A simulated system: a kernel instance and the host threads backing it.
pub struct Simulator {
    kernel: Arc<SimKernel>,
    shared: Arc<cpu::Shared>,
    idle_join_handle: Option<thread::JoinHandle<()>>,
    timer_join_handle: Option<thread::JoinHandle<()>>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    /// Construct a simulator with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let _ = env_logger::try_init();

        let (timer_cmd_send, timer_cmd_recv) = mpsc::channel();
        let shared = Arc::new(cpu::Shared::new(config, timer_cmd_send));
        let kernel = Arc::new(Kernel::new(SimPort::new(Arc::clone(&shared))));
        shared.set_kernel(Arc::downgrade(&kernel));

        log::trace!("starting the timer thread");
        let timer_join_handle = {
            let shared = Arc::clone(&shared);
            cpu::spawn_host_thread("ember-timer".to_owned(), move || {
                timer::run(shared, timer_cmd_recv)
            })
        };

        log::trace!("starting the idle thread");
        let idle_join_handle = {
            let shared = Arc::clone(&shared);
            cpu::spawn_host_thread("ember-idle".to_owned(), move || shared.run_idle())
        };

        Self {
            kernel,
            shared,
            idle_join_handle: Some(idle_join_handle),
            timer_join_handle: Some(timer_join_handle),
        }
    }

    /// Get the kernel. Its methods can only be called from simulated
    /// contexts (threads and interrupt handlers).
    pub fn kernel(&self) -> &Arc<SimKernel> {
        &self.kernel
    }

    /// Pend a simulated interrupt from an external host thread.
    pub fn pend_interrupt(&self, f: impl FnOnce(&SimKernel) + Send + 'static) {
        self.kernel.port().pend_interrupt(f);
    }

    /// Create a thread running `f` at `priority` and wait until `f` returns.
    ///
    /// Other threads may still exist when this method returns. They stop
    /// when the simulator is dropped.
    ///
    /// Panics if a simulated context panics (propagating the panic), or if
    /// `f` doesn't return within [`SimConfig::deadlock_timeout`].
    pub fn run_main(&self, priority: Priority, f: impl FnOnce(&SimKernel) + Send + 'static) {
        self.shared.lock().main_done = false;

        let shared = Arc::clone(&self.shared);
        let entry: Entry = Box::new(move |k| {
            f(k);

            let mut cpu = shared.lock();
            cpu.main_done = true;
            shared.notify();
        });
        let stack = leak_stack(self.shared.config.stack_size);

        // Threads can only be created from a simulated context
        self.pend_interrupt(move |k| {
            if let Err(e) = k.thread_create(stack, priority, CreateFlags::empty(), entry, "main") {
                panic!("failed to create the main thread: {e:?}");
            }
        });

        let mut cpu = self.shared.wait_timeout_while(
            self.shared.lock(),
            self.shared.config.deadlock_timeout,
            |cpu| !cpu.main_done && cpu.panic.is_none(),
        );

        // Propagate any panic that occurred in a simulated context
        if let Some(e) = cpu.panic.take() {
            drop(cpu);
            panic::resume_unwind(e);
        }

        if !cpu.main_done {
            drop(cpu);
            log::debug!("{:?}", self.kernel);
            panic!("the program deadlocked before the main thread finished");
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        log::trace!("shutting down the simulator");
        self.shared.shutdown();

        for join_handle in [self.idle_join_handle.take(), self.timer_join_handle.take()]
            .into_iter()
            .flatten()
        {
            let _ = join_handle.join();
        }
    }
}

/// Create a thread that runs `f` and then exits.
///
/// Must be called from a simulated context. The stack is allocated with the
/// size [`SimConfig::stack_size`].
pub fn spawn(
    k: &SimKernel,
    priority: Priority,
    flags: CreateFlags,
    name: &'static str,
    f: impl FnOnce(&SimKernel) + Send + 'static,
) -> Result<Pid, CreateThreadError> {
    let stack = leak_stack(k.port().config().stack_size);
    k.thread_create(stack, priority, flags, Box::new(f), name)
}

fn leak_stack(size: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; size].into_boxed_slice())
}
