//! Monotonic clock access and the absolute-deadline sleeper.

use std::io;

use tracing::trace;

use crate::error::RangingError;
use crate::time::{Deadline, Timespec};

/// Why an absolute sleep returned before its deadline.
#[derive(Debug)]
pub enum SleepError {
    /// A signal woke the thread. The deadline still stands.
    Interrupted,
    /// The sleep primitive failed.
    Failed(io::Error),
}

/// A monotonic clock with an absolute-deadline sleep.
pub trait Clock {
    /// Current reading of the monotonic clock.
    fn now(&self) -> Result<Timespec, RangingError>;

    /// Suspends the calling thread until `deadline`.
    ///
    /// May return [`SleepError::Interrupted`] early; callers retry to the same
    /// deadline.
    fn sleep_until(&self, deadline: Deadline) -> Result<(), SleepError>;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Result<Timespec, RangingError> {
        (**self).now()
    }

    fn sleep_until(&self, deadline: Deadline) -> Result<(), SleepError> {
        (**self).sleep_until(deadline)
    }
}

/// Sleeps for `span` measured on `clock`.
///
/// The deadline is fixed once from a single clock reading. Signal interruptions
/// resume the sleep towards that same deadline, so repeated wake-ups do not
/// stretch the total. Every other failure is returned as
/// [`RangingError::ClockUnavailable`].
pub fn sleep_for<C: Clock + ?Sized>(clock: &C, span: Timespec) -> Result<(), RangingError> {
    let start = clock.now()?;
    let deadline = Deadline::after(start, span)
        .ok_or_else(|| RangingError::ClockUnavailable(format!("deadline {start} + {span} overflows")))?;

    loop {
        match clock.sleep_until(deadline) {
            Ok(()) => return Ok(()),
            Err(SleepError::Interrupted) => {
                trace!(deadline = %deadline.instant(), "sleep interrupted, resuming");
                continue;
            }
            Err(SleepError::Failed(e)) => {
                return Err(RangingError::ClockUnavailable(format!("sleep failed: {e}")));
            }
        }
    }
}

/// The system `CLOCK_MONOTONIC`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Creates a handle to the system monotonic clock.
    pub const fn new() -> Self {
        MonotonicClock
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Result<Timespec, RangingError> {
        // SAFETY: an all-zero timespec is a valid value on every libc target.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        // SAFETY: `ts` is a valid, exclusively borrowed timespec.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            let e = io::Error::last_os_error();
            return Err(RangingError::ClockUnavailable(format!("clock_gettime: {e}")));
        }
        if ts.tv_sec < 0 || ts.tv_nsec < 0 {
            return Err(RangingError::ClockUnavailable("clock_gettime returned a negative time".into()));
        }
        Ok(Timespec::normalize(ts.tv_sec as u64, ts.tv_nsec as u64))
    }

    fn sleep_until(&self, deadline: Deadline) -> Result<(), SleepError> {
        let at = deadline.instant();
        // SAFETY: an all-zero timespec is a valid value on every libc target.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = libc::time_t::try_from(at.secs())
            .map_err(|_| SleepError::Failed(io::Error::new(io::ErrorKind::InvalidInput, "deadline out of range")))?;
        ts.tv_nsec = at.subsec_nanos() as _;

        // SAFETY: `ts` is valid for reads and the remainder pointer may be null
        // for absolute sleeps.
        let rc = unsafe {
            libc::clock_nanosleep(libc::CLOCK_MONOTONIC, libc::TIMER_ABSTIME, &ts, std::ptr::null_mut())
        };
        match rc {
            0 => Ok(()),
            libc::EINTR => Err(SleepError::Interrupted),
            errno => Err(SleepError::Failed(io::Error::from_raw_os_error(errno))),
        }
    }
}
