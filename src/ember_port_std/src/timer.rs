//! The tick source
//!
//! A host thread waits for the alarm time requested by the kernel and pends
//! an interrupt that calls [`Kernel::handle_tick`].
//!
//! [`Kernel::handle_tick`]: ember_kernel::Kernel::handle_tick
use ember_kernel::Ticks;
use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

use crate::cpu::Shared;

pub(crate) enum TimerCmd {
    /// Replace the alarm. `None` means the alarm time is not representable
    /// and will never be reached.
    SetAlarm { at: Option<Instant> },
}

pub(crate) fn run(shared: Arc<Shared>, timer_cmd_recv: mpsc::Receiver<TimerCmd>) {
    let mut next_deadline: Option<Instant> = None;
    loop {
        let recv_result = if let Some(next_deadline) = next_deadline {
            timer_cmd_recv.recv_timeout(next_deadline.saturating_duration_since(Instant::now()))
        } else {
            timer_cmd_recv
                .recv()
                .map_err(|_| mpsc::RecvTimeoutError::Disconnected)
        };
        match recv_result {
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::trace!("alarm");
                shared.pend(Box::new(|k| k.handle_tick()));
                next_deadline = None;
            }
            Ok(TimerCmd::SetAlarm { at }) => {
                next_deadline = at;
            }
        }
    }
    log::trace!("timer thread exits");
}

fn tick_nanos(tick: Duration) -> u64 {
    u64::try_from(tick.as_nanos()).unwrap_or(u64::MAX).max(1)
}

/// The time elapsed by `ticks` ticks. Saturates instead of overflowing.
pub(crate) fn ticks_to_duration(tick: Duration, ticks: Ticks) -> Duration {
    Duration::from_nanos(tick_nanos(tick).saturating_mul(ticks))
}

/// The number of whole ticks in `duration`.
pub(crate) fn duration_to_ticks(tick: Duration, duration: Duration) -> Ticks {
    let ticks = duration.as_nanos() / u128::from(tick_nanos(tick));
    Ticks::try_from(ticks).unwrap_or(Ticks::MAX)
}
