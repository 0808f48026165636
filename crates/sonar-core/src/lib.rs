#![warn(missing_docs)]
#![doc = "Time-of-flight ultrasonic ranging core."]
#![doc = ""]
#![doc = "This crate emits a trigger pulse, waits for the echo edge (either through an"]
#![doc = "edge callback or by busy-polling the echo line), and converts the elapsed time"]
#![doc = "into millimetres. Hardware access goes through the [`GpioBackend`] trait."]

pub mod backend;
pub mod clock;
pub mod edge;
pub mod error;
pub mod pulse;
pub mod sampler;
pub mod sampling;
pub mod sim;
pub mod time;

pub use backend::{
    CallbackHandle, CallbackLevel, Capabilities, Direction, Edge, EdgeCallback, EdgeReport,
    GpioBackend, Level, Line, LineRole, Session, Tick,
};
#[cfg(feature = "rpi")]
pub use backend::pi::RppalBackend;
pub use clock::{Clock, MonotonicClock, SleepError, sleep_for};
pub use edge::{BusyPollWaiter, EdgeEvent, EdgeRequest, EdgeWaiter, InterruptWaiter};
pub use error::{FatalReason, RangingError};
pub use pulse::PulseStrategy;
pub use sampler::{DistanceSampler, Measurement, PulseMode, SamplerConfig, WaitMode};
pub use sampling::{CycleOutcome, LoopState, Pace, SamplingLoop, TimeoutPolicy};
pub use time::{Deadline, Timespec};
