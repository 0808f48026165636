//! The GPIO backend seam.
//!
//! Everything the ranging core needs from the hardware is expressed through
//! [`GpioBackend`]. [`Session`] wraps a backend so it is initialised once and
//! shut down on every exit path.

#[cfg(feature = "rpi")]
pub mod pi;

use core::fmt;
use core::ops::{Deref, DerefMut};

use tracing::{info, warn};

use crate::error::RangingError;
use crate::time::Timespec;

/// A backend tick counter value. Wraps around; compare with wrapping arithmetic.
pub type Tick = u32;

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Line is low.
    Low,
    /// Line is high.
    High,
}

impl Level {
    /// The opposite level.
    pub const fn inverted(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "low"),
            Level::High => write!(f, "high"),
        }
    }
}

/// A level transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Low to high.
    Rising,
    /// High to low.
    Falling,
}

impl Edge {
    /// Level the line holds before this edge.
    pub const fn from_level(self) -> Level {
        match self {
            Edge::Rising => Level::Low,
            Edge::Falling => Level::High,
        }
    }

    /// Level the line holds after this edge.
    pub const fn to_level(self) -> Level {
        self.from_level().inverted()
    }

    /// Whether going from `before` to `after` is this edge.
    pub fn matches(self, before: Level, after: Level) -> bool {
        before == self.from_level() && after == self.to_level()
    }
}

/// Direction a line is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The line is read.
    Input,
    /// The line is driven.
    Output,
}

/// Role of a line in the sensor wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRole {
    /// Output that starts a ranging cycle.
    Trigger,
    /// Input that carries the echo pulse.
    Echo,
}

impl LineRole {
    /// The direction this role needs.
    pub const fn direction(self) -> Direction {
        match self {
            LineRole::Trigger => Direction::Output,
            LineRole::Echo => Direction::Input,
        }
    }
}

/// A configured GPIO line: a pin with a fixed role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line {
    /// Pin number in the backend's numbering.
    pub pin: u8,
    /// What the line is used for.
    pub role: LineRole,
}

impl Line {
    /// Trigger line on `pin`.
    pub const fn trigger(pin: u8) -> Self {
        Line { pin, role: LineRole::Trigger }
    }

    /// Echo line on `pin`.
    pub const fn echo(pin: u8) -> Self {
        Line { pin, role: LineRole::Echo }
    }
}

/// Level delivered to an edge callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackLevel {
    /// The line went low.
    Low,
    /// The line went high.
    High,
    /// No edge arrived within the registration's timeout.
    Timeout,
}

impl CallbackLevel {
    /// The observed level, `None` for a timeout.
    pub const fn level(self) -> Option<Level> {
        match self {
            CallbackLevel::Low => Some(Level::Low),
            CallbackLevel::High => Some(Level::High),
            CallbackLevel::Timeout => None,
        }
    }
}

impl From<Level> for CallbackLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Low => CallbackLevel::Low,
            Level::High => CallbackLevel::High,
        }
    }
}

/// What an edge callback is told when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeReport {
    /// Level after the edge, or the timeout sentinel.
    pub level: CallbackLevel,
    /// Backend tick at the moment of the event.
    pub tick: Tick,
}

/// Callback invoked from the backend's event context.
pub type EdgeCallback = Box<dyn FnMut(EdgeReport) + Send + 'static>;

/// Identifies a live callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(pub u64);

/// Optional features a backend may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// The backend can run a callback when an input line changes.
    pub edge_callbacks: bool,
    /// The backend can emit a hardware-timed pulse in one call.
    pub hardware_pulse: bool,
}

/// Hardware access used by the ranging core.
pub trait GpioBackend: Send {
    /// Brings the backend up. Called once by [`Session::open`].
    fn initialise(&mut self) -> Result<(), RangingError> {
        Ok(())
    }

    /// Releases the backend. Called once when the [`Session`] drops.
    fn shutdown(&mut self) {}

    /// Optional features this backend offers.
    fn capabilities(&self) -> Capabilities;

    /// Configures `pin` as an input or output.
    fn configure_line(&mut self, pin: u8, direction: Direction) -> Result<(), RangingError>;

    /// Drives an output line.
    fn write_line(&mut self, pin: u8, level: Level) -> Result<(), RangingError>;

    /// Samples an input line.
    fn read_line(&mut self, pin: u8) -> Result<Level, RangingError>;

    /// Current tick counter value.
    fn tick_now(&mut self) -> Result<Tick, RangingError>;

    /// Length of one tick in nanoseconds.
    fn tick_period_ns(&self) -> u32;

    /// Emits a hardware-timed high pulse of `width` on `pin`.
    ///
    /// Only called when [`Capabilities::hardware_pulse`] is set.
    fn trigger_pulse(&mut self, pin: u8, width: Timespec) -> Result<(), RangingError> {
        let _ = width;
        Err(RangingError::LineIo { pin, reason: "hardware pulse not supported".into() })
    }

    /// Registers `callback` for `edge` on `pin`.
    ///
    /// When `timeout` is non-zero and the backend supports it, the callback is
    /// invoked with [`CallbackLevel::Timeout`] if no edge arrives in time.
    fn register_edge_callback(
        &mut self,
        pin: u8,
        edge: Edge,
        timeout: Timespec,
        callback: EdgeCallback,
    ) -> Result<CallbackHandle, RangingError>;

    /// Removes a registration made by [`GpioBackend::register_edge_callback`].
    fn unregister_edge_callback(&mut self, handle: CallbackHandle) -> Result<(), RangingError>;
}

/// An initialised backend, shut down when dropped.
pub struct Session<B: GpioBackend> {
    backend: B,
}

impl<B: GpioBackend> Session<B> {
    /// Initialises `backend` and takes ownership of it.
    pub fn open(mut backend: B) -> Result<Self, RangingError> {
        backend.initialise()?;
        info!("GPIO backend initialised");
        Ok(Session { backend })
    }
}

impl<B: GpioBackend> Deref for Session<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.backend
    }
}

impl<B: GpioBackend> DerefMut for Session<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: GpioBackend> Drop for Session<B> {
    fn drop(&mut self) {
        self.backend.shutdown();
        info!("GPIO backend shut down");
    }
}

impl<B: GpioBackend> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

/// Tears a callback registration down exactly once.
///
/// [`Registration::release`] reports unregister failures; if the guard is
/// dropped on an error path instead, the failure is only logged.
pub(crate) struct Registration<'a> {
    backend: &'a mut dyn GpioBackend,
    pin: u8,
    handle: Option<CallbackHandle>,
}

impl<'a> Registration<'a> {
    pub(crate) fn new(backend: &'a mut dyn GpioBackend, pin: u8, handle: CallbackHandle) -> Self {
        Registration { backend, pin, handle: Some(handle) }
    }

    pub(crate) fn backend(&mut self) -> &mut (dyn GpioBackend + 'a) {
        &mut *self.backend
    }

    pub(crate) fn release(mut self) -> Result<(), RangingError> {
        match self.handle.take() {
            Some(handle) => self.backend.unregister_edge_callback(handle),
            None => Ok(()),
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.backend.unregister_edge_callback(handle) {
                warn!(pin = self.pin, error = %e, "failed to remove edge callback");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RigConfig, SimRig};

    #[test]
    fn test_edge_levels() {
        assert_eq!(Edge::Falling.from_level(), Level::High);
        assert_eq!(Edge::Falling.to_level(), Level::Low);
        assert!(Edge::Rising.matches(Level::Low, Level::High));
        assert!(!Edge::Rising.matches(Level::High, Level::Low));
        assert!(!Edge::Falling.matches(Level::Low, Level::Low));
    }

    #[test]
    fn test_callback_level() {
        assert_eq!(CallbackLevel::from(Level::High).level(), Some(Level::High));
        assert_eq!(CallbackLevel::Timeout.level(), None);
    }

    #[test]
    fn test_session_shuts_down_once() {
        let rig = SimRig::new(RigConfig::default());
        {
            let _session = Session::open(rig.gpio()).unwrap();
            assert!(rig.is_initialised());
            assert_eq!(rig.shutdowns(), 0);
        }
        assert_eq!(rig.shutdowns(), 1);
    }

    #[test]
    fn test_session_open_failure() {
        let rig = SimRig::new(RigConfig::default());
        rig.fail_initialise();
        let err = Session::open(rig.gpio()).unwrap_err();
        assert!(matches!(err, RangingError::Initialization(_)));
        assert_eq!(rig.shutdowns(), 0);
    }

    #[test]
    fn test_registration_guard_unregisters_on_drop() {
        let rig = SimRig::new(RigConfig::default());
        let mut gpio = rig.gpio();
        gpio.configure_line(24, Direction::Input).unwrap();
        let handle = gpio
            .register_edge_callback(24, Edge::Falling, Timespec::ZERO, Box::new(|_| {}))
            .unwrap();
        {
            let _guard = Registration::new(&mut gpio, 24, handle);
        }
        assert_eq!(rig.registrations(), 1);
        assert_eq!(rig.unregistrations(), 1);
        assert_eq!(rig.active_registrations(), 0);
    }
}
