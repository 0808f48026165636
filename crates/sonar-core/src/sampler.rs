//! One measurement cycle: pulse, wait for the echo, convert to millimetres.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{Capabilities, Edge, GpioBackend, Line, Session};
use crate::clock::Clock;
use crate::edge::{BusyPollWaiter, EdgeEvent, EdgeRequest, EdgeWaiter, InterruptWaiter};
use crate::error::RangingError;
use crate::pulse::PulseStrategy;
use crate::time::Timespec;

/// Half the speed of sound in air, in millimetres per nanosecond.
///
/// Sound covers 0.000343 mm/ns; the echo travels there and back.
pub const HALF_SPEED_OF_SOUND_MM_PER_NS: f64 = 0.0001715;

/// A distance reading in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    distance_mm: f64,
}

impl Measurement {
    /// Distance for an echo that took `elapsed` for the round trip.
    pub fn from_round_trip(elapsed: Timespec) -> Self {
        Measurement { distance_mm: elapsed.as_nanos() as f64 * HALF_SPEED_OF_SOUND_MM_PER_NS }
    }

    /// The distance in millimetres.
    pub const fn millimetres(&self) -> f64 {
        self.distance_mm
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} mm", self.distance_mm)
    }
}

/// Which pulse strategy to use.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PulseMode {
    /// Hardware pulse when the backend has one, manual otherwise.
    #[default]
    Auto,
    /// Always the hardware pulse.
    Hardware,
    /// Always the manual high-sleep-low sequence.
    Manual,
}

/// Which edge wait strategy to use.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Edge callbacks when the backend has them, busy-polling otherwise.
    #[default]
    Auto,
    /// Always edge callbacks.
    Interrupt,
    /// Always busy-polling.
    BusyPoll,
}

/// Wiring and timing of one sensor.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    /// Output pin wired to the sensor's trigger input.
    pub trigger_pin: u8,
    /// Input pin wired to the sensor's echo output.
    pub echo_pin: u8,
    /// Trigger pulse width in microseconds.
    pub pulse_width_us: u64,
    /// How long to wait for the echo, in microseconds.
    pub echo_timeout_us: u64,
    /// Sleep between checks of the edge callback, in microseconds.
    pub poll_interval_us: u64,
    /// Pulse strategy.
    pub pulse: PulseMode,
    /// Edge wait strategy.
    pub wait: WaitMode,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            trigger_pin: 18,
            echo_pin: 24,
            pulse_width_us: 10,
            echo_timeout_us: 500_000,
            poll_interval_us: 1_000,
            pulse: PulseMode::Auto,
            wait: WaitMode::Auto,
        }
    }
}

impl SamplerConfig {
    /// Trigger pulse width.
    pub const fn pulse_width(&self) -> Timespec {
        Timespec::from_micros(self.pulse_width_us)
    }

    /// Echo timeout.
    pub const fn echo_timeout(&self) -> Timespec {
        Timespec::from_micros(self.echo_timeout_us)
    }

    /// Edge callback poll interval.
    pub const fn poll_interval(&self) -> Timespec {
        Timespec::from_micros(self.poll_interval_us)
    }

    fn validate(&self) -> Result<(), RangingError> {
        if self.trigger_pin == self.echo_pin {
            return Err(RangingError::LineSetup {
                pin: self.echo_pin,
                reason: "trigger and echo must be different pins".into(),
            });
        }
        if self.pulse_width_us == 0 {
            return Err(RangingError::LineSetup { pin: self.trigger_pin, reason: "pulse width must be positive".into() });
        }
        if self.echo_timeout_us == 0 {
            return Err(RangingError::LineSetup { pin: self.echo_pin, reason: "echo timeout must be positive".into() });
        }
        if self.poll_interval_us == 0 {
            return Err(RangingError::LineSetup { pin: self.echo_pin, reason: "poll interval must be positive".into() });
        }
        Ok(())
    }

    fn pulse_strategy(&self, caps: Capabilities) -> Result<PulseStrategy, RangingError> {
        match (self.pulse, caps.hardware_pulse) {
            (PulseMode::Auto, true) | (PulseMode::Hardware, true) => Ok(PulseStrategy::Hardware),
            (PulseMode::Auto, false) | (PulseMode::Manual, _) => Ok(PulseStrategy::Manual),
            (PulseMode::Hardware, false) => Err(RangingError::LineSetup {
                pin: self.trigger_pin,
                reason: "backend has no hardware pulse".into(),
            }),
        }
    }

    fn edge_waiter(&self, caps: Capabilities) -> Result<Box<dyn EdgeWaiter>, RangingError> {
        match (self.wait, caps.edge_callbacks) {
            (WaitMode::Auto, true) | (WaitMode::Interrupt, true) => {
                Ok(Box::new(InterruptWaiter::new(self.poll_interval())))
            }
            (WaitMode::Auto, false) | (WaitMode::BusyPoll, _) => Ok(Box::new(BusyPollWaiter)),
            (WaitMode::Interrupt, false) => Err(RangingError::LineSetup {
                pin: self.echo_pin,
                reason: "backend has no edge callbacks".into(),
            }),
        }
    }
}

/// Takes distance measurements with one sensor.
///
/// Owns the backend session and both lines for its whole life.
pub struct DistanceSampler<B: GpioBackend, C: Clock> {
    session: Session<B>,
    clock: C,
    trigger: Line,
    echo: Line,
    pulse: PulseStrategy,
    waiter: Box<dyn EdgeWaiter>,
    config: SamplerConfig,
}

impl<B: GpioBackend, C: Clock> DistanceSampler<B, C> {
    /// Opens `backend`, configures both lines and picks the strategies.
    ///
    /// The backend is shut down again if anything after initialisation fails.
    pub fn new(backend: B, clock: C, config: SamplerConfig) -> Result<Self, RangingError> {
        config.validate()?;
        let mut session = Session::open(backend)?;

        let caps = session.capabilities();
        let pulse = config.pulse_strategy(caps)?;
        let waiter = config.edge_waiter(caps)?;

        let trigger = Line::trigger(config.trigger_pin);
        let echo = Line::echo(config.echo_pin);
        session.configure_line(echo.pin, echo.role.direction())?;
        session.configure_line(trigger.pin, trigger.role.direction())?;

        info!(
            trigger = trigger.pin,
            echo = echo.pin,
            pulse = pulse.name(),
            wait = waiter.name(),
            "sensor configured"
        );

        Ok(DistanceSampler { session, clock, trigger, echo, pulse, waiter, config })
    }

    /// Runs one cycle and returns the distance.
    ///
    /// A missed echo is [`RangingError::EchoTimeout`]; no value is produced for
    /// a failed cycle.
    pub fn measure(&mut self) -> Result<Measurement, RangingError> {
        let backend: &mut dyn GpioBackend = &mut *self.session;

        self.pulse.emit(backend, &self.clock, self.trigger.pin, self.config.pulse_width())?;

        let request = EdgeRequest { pin: self.echo.pin, edge: Edge::Falling, timeout: self.config.echo_timeout() };
        match self.waiter.wait_for_edge(backend, &self.clock, request)? {
            EdgeEvent::Fired { elapsed, .. } => {
                let measurement = Measurement::from_round_trip(elapsed);
                debug!(%elapsed, distance_mm = measurement.millimetres(), wait = self.waiter.name(), "echo received");
                Ok(measurement)
            }
            EdgeEvent::TimedOut => Err(RangingError::EchoTimeout { timeout: request.timeout }),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// The pulse strategy that was selected.
    pub fn pulse_strategy(&self) -> PulseStrategy {
        self.pulse
    }

    /// Name of the edge wait strategy that was selected.
    pub fn wait_strategy(&self) -> &'static str {
        self.waiter.name()
    }

    /// The clock the sampler sleeps on.
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<B: GpioBackend, C: Clock> fmt::Debug for DistanceSampler<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistanceSampler")
            .field("trigger", &self.trigger)
            .field("echo", &self.echo)
            .field("pulse", &self.pulse)
            .field("wait", &self.waiter.name())
            .finish_non_exhaustive()
    }
}
