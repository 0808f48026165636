//! Error types for the ranging core.
//!
//! Every failure a measurement cycle can hit is a [`RangingError`]. The binary
//! decides what to do with it through [`RangingError::fatal_reason`].

use thiserror::Error;

use crate::time::Timespec;

/// Errors that can occur while configuring the sensor or taking a measurement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangingError {
    /// The monotonic clock could not be read, a deadline overflowed, or the
    /// sleep primitive failed for a reason other than a signal.
    #[error("timing unavailable: {0}")]
    ClockUnavailable(String),
    /// A read or write on a GPIO line failed.
    #[error("I/O failure on GPIO line {pin}: {reason}")]
    LineIo {
        /// Pin the operation targeted.
        pin: u8,
        /// Backend-provided detail.
        reason: String,
    },
    /// An edge callback could not be registered or torn down.
    #[error("edge callback failure on GPIO line {pin}: {reason}")]
    CallbackRegistration {
        /// Pin the callback targets.
        pin: u8,
        /// Backend-provided detail.
        reason: String,
    },
    /// No echo edge arrived within the timeout window.
    ///
    /// This is expected now and then during normal operation.
    #[error("no echo observed within {timeout}")]
    EchoTimeout {
        /// The timeout that elapsed.
        timeout: Timespec,
    },
    /// The GPIO backend could not be started.
    #[error("GPIO backend failed to initialise: {0}")]
    Initialization(String),
    /// A line could not be configured, or the requested strategy is not
    /// available on this backend.
    #[error("cannot configure GPIO line {pin}: {reason}")]
    LineSetup {
        /// Pin being configured.
        pin: u8,
        /// What went wrong.
        reason: String,
    },
}

/// Why the process gave up, as reported by the outer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// The backend never came up.
    Initialization,
    /// Lines or strategies could not be configured.
    Configuration,
    /// A sampling cycle failed.
    Measurement,
}

impl FatalReason {
    /// Process exit status for this reason. Each reason gets its own code.
    pub const fn exit_code(self) -> u8 {
        match self {
            FatalReason::Initialization => 2,
            FatalReason::Configuration => 3,
            FatalReason::Measurement => 4,
        }
    }
}

impl core::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FatalReason::Initialization => write!(f, "initialization failure"),
            FatalReason::Configuration => write!(f, "configuration failure"),
            FatalReason::Measurement => write!(f, "measurement failure"),
        }
    }
}

impl RangingError {
    /// Classifies the error for the process exit path.
    pub fn fatal_reason(&self) -> FatalReason {
        match self {
            RangingError::Initialization(_) => FatalReason::Initialization,
            RangingError::LineSetup { .. } => FatalReason::Configuration,
            RangingError::ClockUnavailable(_)
            | RangingError::LineIo { .. }
            | RangingError::CallbackRegistration { .. }
            | RangingError::EchoTimeout { .. } => FatalReason::Measurement,
        }
    }

    /// Whether the error is a missed echo rather than a hardware or timing fault.
    pub fn is_echo_timeout(&self) -> bool {
        matches!(self, RangingError::EchoTimeout { .. })
    }
}
