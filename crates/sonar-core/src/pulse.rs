//! Trigger pulse emission.

use crate::backend::{GpioBackend, Level};
use crate::clock::{Clock, sleep_for};
use crate::error::RangingError;
use crate::time::Timespec;

/// How the trigger pulse is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseStrategy {
    /// One hardware-timed call to the backend. No software jitter.
    Hardware,
    /// Set high, sleep on the clock, set low. Subject to scheduling jitter.
    Manual,
}

impl PulseStrategy {
    /// Emits one high pulse of `width` on `pin`.
    ///
    /// A failed write aborts the pulse and is returned as is.
    pub fn emit<C: Clock + ?Sized>(
        self,
        backend: &mut dyn GpioBackend,
        clock: &C,
        pin: u8,
        width: Timespec,
    ) -> Result<(), RangingError> {
        match self {
            PulseStrategy::Hardware => backend.trigger_pulse(pin, width),
            PulseStrategy::Manual => {
                backend.write_line(pin, Level::High)?;
                sleep_for(clock, width)?;
                backend.write_line(pin, Level::Low)
            }
        }
    }

    /// Short name for logs.
    pub const fn name(self) -> &'static str {
        match self {
            PulseStrategy::Hardware => "hardware",
            PulseStrategy::Manual => "manual",
        }
    }
}
