//! A simulated sensor rig running on virtual time.
//!
//! [`SimRig`] hands out a [`SimClock`] and a [`SimGpio`] that share one virtual
//! timeline. Time only moves when the clock sleeps or when the echo line is
//! read (every read costs a configurable amount of time), so every timing
//! result is deterministic. A falling edge on any output line plays the
//! configured [`EchoProfile`] back on the echo pin, the way a real HC-SR04
//! answers its trigger.
//!
//! Edge callbacks run on the thread that advanced the clock, with the rig
//! locked. They must not call back into the rig.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{
    CallbackHandle, CallbackLevel, Capabilities, Direction, Edge, EdgeCallback, EdgeReport, GpioBackend,
    Level, Tick,
};
use crate::clock::{Clock, SleepError};
use crate::error::RangingError;
use crate::time::{Deadline, Timespec};

/// Nanoseconds per simulated tick (a microsecond counter).
pub const SIM_TICK_NS: u32 = 1_000;

/// Highest usable pin number on the simulated header.
pub const SIM_MAX_PIN: u8 = 53;

/// How the simulated sensor answers a trigger pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoProfile {
    /// The echo line goes high `latency` after the trigger falls and stays high
    /// for `width`.
    Respond {
        /// Delay from trigger fall to echo rise.
        latency: Timespec,
        /// Echo pulse width.
        width: Timespec,
    },
    /// Nothing comes back.
    Silent,
    /// The echo line rises and never falls.
    Stuck,
}

impl EchoProfile {
    /// An immediate echo whose width matches an object `distance_mm` away.
    pub fn for_distance_mm(distance_mm: f64) -> Self {
        let width_ns = (distance_mm.max(0.0) / crate::sampler::HALF_SPEED_OF_SOUND_MM_PER_NS).round() as u64;
        EchoProfile::Respond { latency: Timespec::ZERO, width: Timespec::from_nanos(width_ns) }
    }
}

/// Static properties of a rig.
#[derive(Debug, Clone, Copy)]
pub struct RigConfig {
    /// Pin the simulated sensor drives.
    pub echo_pin: u8,
    /// What the backend reports it can do.
    pub capabilities: Capabilities,
    /// Virtual time consumed by each `read_line`.
    pub read_cost: Timespec,
    /// Whether edge callbacks honour their timeout.
    pub native_timeouts: bool,
    /// Virtual clock reading at start.
    pub start: Timespec,
    /// Every n-th trigger gets no echo; 0 disables dropping.
    pub drop_every: u32,
}

impl Default for RigConfig {
    fn default() -> Self {
        RigConfig {
            echo_pin: 24,
            capabilities: Capabilities { edge_callbacks: true, hardware_pulse: false },
            read_cost: Timespec::from_micros(1),
            native_timeouts: true,
            start: Timespec::from_millis(1),
            drop_every: 0,
        }
    }
}

/// A write recorded by the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineWrite {
    /// Virtual time of the write.
    pub at: Timespec,
    /// Pin written.
    pub pin: u8,
    /// Level driven.
    pub level: Level,
}

struct SimRegistration {
    handle: CallbackHandle,
    pin: u8,
    edge: Edge,
    timeout_ns: u64,
    armed_at_ns: u64,
    callback: EdgeCallback,
}

struct RigState {
    config: RigConfig,
    now_ns: u64,
    echo: EchoProfile,
    directions: HashMap<u8, Direction>,
    levels: HashMap<u8, Level>,
    pending: Vec<(u64, u8, Level)>,
    registrations: Vec<SimRegistration>,
    next_handle: u64,
    writes: Vec<LineWrite>,
    triggers: u32,

    interrupts_pending: u32,
    interruptions_seen: u32,
    fail_next_sleep: bool,
    write_fault: Option<(u8, Level)>,
    read_fault: bool,
    registration_fault: bool,
    init_fault: bool,

    initialised: bool,
    shutdowns: u32,
    registered: u32,
    unregistered: u32,
}

impl RigState {
    fn now(&self) -> Timespec {
        Timespec::from_nanos(self.now_ns)
    }

    fn tick(&self) -> Tick {
        (self.now_ns / u64::from(SIM_TICK_NS)) as Tick
    }

    fn level(&self, pin: u8) -> Level {
        self.levels.get(&pin).copied().unwrap_or(Level::Low)
    }

    fn schedule(&mut self, at_ns: u64, pin: u8, level: Level) {
        self.pending.push((at_ns, pin, level));
        self.pending.sort_by_key(|&(at, _, _)| at);
    }

    /// Moves virtual time forward to `target_ns`, applying scheduled level
    /// changes and running callbacks in time order.
    fn advance_to(&mut self, target_ns: u64) {
        loop {
            let next_level = self.pending.first().map(|&(at, _, _)| at);
            let next_timeout = if self.config.native_timeouts {
                self.registrations
                    .iter()
                    .filter(|r| r.timeout_ns > 0)
                    .map(|r| r.armed_at_ns.saturating_add(r.timeout_ns))
                    .min()
            } else {
                None
            };

            let next = match (next_level, next_timeout) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => break,
            };
            if next > target_ns {
                break;
            }
            self.now_ns = self.now_ns.max(next);

            if next_level == Some(next) {
                let (_, pin, level) = self.pending.remove(0);
                self.apply_level(pin, level);
            } else {
                self.fire_timeouts();
            }
        }
        self.now_ns = self.now_ns.max(target_ns);
    }

    fn apply_level(&mut self, pin: u8, level: Level) {
        let before = self.level(pin);
        self.levels.insert(pin, level);
        if before == level {
            return;
        }
        let tick = self.tick();
        let now_ns = self.now_ns;
        for reg in self.registrations.iter_mut().filter(|r| r.pin == pin) {
            if reg.edge.matches(before, level) {
                (reg.callback)(EdgeReport { level: level.into(), tick });
            }
            reg.armed_at_ns = now_ns;
        }
    }

    fn fire_timeouts(&mut self) {
        let tick = self.tick();
        let now_ns = self.now_ns;
        for reg in self.registrations.iter_mut() {
            if reg.timeout_ns > 0 && reg.armed_at_ns.saturating_add(reg.timeout_ns) <= now_ns {
                (reg.callback)(EdgeReport { level: CallbackLevel::Timeout, tick });
                reg.armed_at_ns = now_ns;
            }
        }
    }

    fn play_echo(&mut self) {
        self.triggers += 1;
        let echo_pin = self.config.echo_pin;
        if self.config.drop_every > 0 && self.triggers % self.config.drop_every == 0 {
            debug!(trigger = self.triggers, "simulated echo dropped");
            return;
        }
        match self.echo {
            EchoProfile::Respond { latency, width } => {
                let rise = self.now_ns.saturating_add(sim_nanos(latency));
                let fall = rise.saturating_add(sim_nanos(width));
                self.schedule(rise, echo_pin, Level::High);
                self.schedule(fall, echo_pin, Level::Low);
            }
            EchoProfile::Stuck => {
                let now = self.now_ns;
                self.schedule(now, echo_pin, Level::High);
            }
            EchoProfile::Silent => {}
        }
    }
}

/// Virtual time is kept in nanoseconds; spans beyond that range saturate.
fn sim_nanos(t: Timespec) -> u64 {
    u64::try_from(t.as_nanos()).unwrap_or(u64::MAX)
}

/// Shared handle to a simulated sensor rig.
#[derive(Clone)]
pub struct SimRig {
    state: Arc<Mutex<RigState>>,
}

impl SimRig {
    /// Creates a rig answering with a 1 m echo.
    pub fn new(config: RigConfig) -> Self {
        let state = RigState {
            now_ns: sim_nanos(config.start),
            config,
            echo: EchoProfile::for_distance_mm(1000.0),
            directions: HashMap::new(),
            levels: HashMap::new(),
            pending: Vec::new(),
            registrations: Vec::new(),
            next_handle: 1,
            writes: Vec::new(),
            triggers: 0,
            interrupts_pending: 0,
            interruptions_seen: 0,
            fail_next_sleep: false,
            write_fault: None,
            read_fault: false,
            registration_fault: false,
            init_fault: false,
            initialised: false,
            shutdowns: 0,
            registered: 0,
            unregistered: 0,
        };
        SimRig { state: Arc::new(Mutex::new(state)) }
    }

    /// The rig's virtual clock.
    pub fn clock(&self) -> SimClock {
        SimClock { rig: self.clone() }
    }

    /// The rig's GPIO backend.
    pub fn gpio(&self) -> SimGpio {
        SimGpio { rig: self.clone() }
    }

    /// Sets how the sensor answers subsequent triggers.
    pub fn set_echo(&self, echo: EchoProfile) {
        self.state.lock().echo = echo;
    }

    /// Schedules `pin` to change to `level` at virtual time `at`.
    pub fn schedule_level(&self, pin: u8, at: Timespec, level: Level) {
        self.state.lock().schedule(sim_nanos(at), pin, level);
    }

    /// Current virtual time.
    pub fn now(&self) -> Timespec {
        self.state.lock().now()
    }

    /// Makes the next `count` absolute sleeps return early with a signal.
    pub fn inject_sleep_interrupts(&self, count: u32) {
        self.state.lock().interrupts_pending += count;
    }

    /// Makes the next absolute sleep fail outright.
    pub fn fail_next_sleep(&self) {
        self.state.lock().fail_next_sleep = true;
    }

    /// Makes every write of `level` to `pin` fail.
    pub fn fail_writes(&self, pin: u8, level: Level) {
        self.state.lock().write_fault = Some((pin, level));
    }

    /// Makes every line read fail.
    pub fn fail_reads(&self) {
        self.state.lock().read_fault = true;
    }

    /// Makes callback registration fail.
    pub fn fail_registration(&self) {
        self.state.lock().registration_fault = true;
    }

    /// Makes backend initialisation fail.
    pub fn fail_initialise(&self) {
        self.state.lock().init_fault = true;
    }

    /// Every write so far.
    pub fn writes(&self) -> Vec<LineWrite> {
        self.state.lock().writes.clone()
    }

    /// Number of trigger pulses the sensor has seen.
    pub fn triggers(&self) -> u32 {
        self.state.lock().triggers
    }

    /// Number of sleep interruptions delivered.
    pub fn sleep_interruptions(&self) -> u32 {
        self.state.lock().interruptions_seen
    }

    /// Number of callback registrations made.
    pub fn registrations(&self) -> u32 {
        self.state.lock().registered
    }

    /// Number of callback registrations removed.
    pub fn unregistrations(&self) -> u32 {
        self.state.lock().unregistered
    }

    /// Registrations currently live.
    pub fn active_registrations(&self) -> usize {
        self.state.lock().registrations.len()
    }

    /// Whether the backend has been initialised.
    pub fn is_initialised(&self) -> bool {
        self.state.lock().initialised
    }

    /// Number of backend shutdowns.
    pub fn shutdowns(&self) -> u32 {
        self.state.lock().shutdowns
    }

    /// Direction `pin` was configured with, if any.
    pub fn direction(&self, pin: u8) -> Option<Direction> {
        self.state.lock().directions.get(&pin).copied()
    }
}

impl core::fmt::Debug for SimRig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimRig")
            .field("now", &state.now())
            .field("echo", &state.echo)
            .field("registrations", &state.registrations.len())
            .finish()
    }
}

/// Virtual monotonic clock of a [`SimRig`].
#[derive(Debug, Clone)]
pub struct SimClock {
    rig: SimRig,
}

impl Clock for SimClock {
    fn now(&self) -> Result<Timespec, RangingError> {
        Ok(self.rig.state.lock().now())
    }

    fn sleep_until(&self, deadline: Deadline) -> Result<(), SleepError> {
        let mut state = self.rig.state.lock();
        if state.fail_next_sleep {
            state.fail_next_sleep = false;
            return Err(SleepError::Failed(io::Error::other("injected sleep failure")));
        }

        let Ok(target) = u64::try_from(deadline.instant().as_nanos()) else {
            return Err(SleepError::Failed(io::Error::other(format!(
                "deadline {} is past the end of simulated time",
                deadline.instant()
            ))));
        };
        if state.interrupts_pending > 0 {
            state.interrupts_pending -= 1;
            state.interruptions_seen += 1;
            // Wake halfway to the deadline.
            let midpoint = state.now_ns + target.saturating_sub(state.now_ns) / 2;
            state.advance_to(midpoint);
            return Err(SleepError::Interrupted);
        }

        state.advance_to(target);
        Ok(())
    }
}

/// GPIO backend of a [`SimRig`].
#[derive(Debug, Clone)]
pub struct SimGpio {
    rig: SimRig,
}

impl SimGpio {
    fn write(state: &mut RigState, pin: u8, level: Level) -> Result<(), RangingError> {
        if state.write_fault == Some((pin, level)) {
            return Err(RangingError::LineIo { pin, reason: format!("injected failure writing {level}") });
        }
        if state.directions.get(&pin) != Some(&Direction::Output) {
            return Err(RangingError::LineIo { pin, reason: "line is not configured as an output".into() });
        }
        let before = state.level(pin);
        let at = state.now();
        state.writes.push(LineWrite { at, pin, level });
        state.levels.insert(pin, level);
        if before == Level::High && level == Level::Low {
            state.play_echo();
        }
        Ok(())
    }
}

impl GpioBackend for SimGpio {
    fn initialise(&mut self) -> Result<(), RangingError> {
        let mut state = self.rig.state.lock();
        if state.init_fault {
            return Err(RangingError::Initialization("injected initialisation failure".into()));
        }
        state.initialised = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = self.rig.state.lock();
        state.registrations.clear();
        state.initialised = false;
        state.shutdowns += 1;
    }

    fn capabilities(&self) -> Capabilities {
        self.rig.state.lock().config.capabilities
    }

    fn configure_line(&mut self, pin: u8, direction: Direction) -> Result<(), RangingError> {
        if pin > SIM_MAX_PIN {
            return Err(RangingError::LineSetup { pin, reason: format!("pin out of range 0..={SIM_MAX_PIN}") });
        }
        let mut state = self.rig.state.lock();
        state.directions.insert(pin, direction);
        if direction == Direction::Output {
            state.levels.insert(pin, Level::Low);
        }
        Ok(())
    }

    fn write_line(&mut self, pin: u8, level: Level) -> Result<(), RangingError> {
        let mut state = self.rig.state.lock();
        Self::write(&mut state, pin, level)
    }

    fn read_line(&mut self, pin: u8) -> Result<Level, RangingError> {
        let mut state = self.rig.state.lock();
        if state.read_fault {
            return Err(RangingError::LineIo { pin, reason: "injected read failure".into() });
        }
        if !state.directions.contains_key(&pin) {
            return Err(RangingError::LineIo { pin, reason: "line is not configured".into() });
        }
        let target = state.now_ns.saturating_add(sim_nanos(state.config.read_cost));
        state.advance_to(target);
        Ok(state.level(pin))
    }

    fn tick_now(&mut self) -> Result<Tick, RangingError> {
        Ok(self.rig.state.lock().tick())
    }

    fn tick_period_ns(&self) -> u32 {
        SIM_TICK_NS
    }

    fn trigger_pulse(&mut self, pin: u8, width: Timespec) -> Result<(), RangingError> {
        let mut state = self.rig.state.lock();
        if !state.config.capabilities.hardware_pulse {
            return Err(RangingError::LineIo { pin, reason: "hardware pulse not supported".into() });
        }
        Self::write(&mut state, pin, Level::High)?;
        let target = state.now_ns.saturating_add(sim_nanos(width));
        state.advance_to(target);
        Self::write(&mut state, pin, Level::Low)
    }

    fn register_edge_callback(
        &mut self,
        pin: u8,
        edge: Edge,
        timeout: Timespec,
        callback: EdgeCallback,
    ) -> Result<CallbackHandle, RangingError> {
        let mut state = self.rig.state.lock();
        if !state.config.capabilities.edge_callbacks {
            return Err(RangingError::CallbackRegistration { pin, reason: "edge callbacks not supported".into() });
        }
        if state.registration_fault {
            return Err(RangingError::CallbackRegistration { pin, reason: "injected registration failure".into() });
        }
        if state.directions.get(&pin) != Some(&Direction::Input) {
            return Err(RangingError::CallbackRegistration { pin, reason: "line is not configured as an input".into() });
        }
        let handle = CallbackHandle(state.next_handle);
        state.next_handle += 1;
        state.registered += 1;
        let armed_at_ns = state.now_ns;
        state.registrations.push(SimRegistration {
            handle,
            pin,
            edge,
            timeout_ns: sim_nanos(timeout),
            armed_at_ns,
            callback,
        });
        Ok(handle)
    }

    fn unregister_edge_callback(&mut self, handle: CallbackHandle) -> Result<(), RangingError> {
        let mut state = self.rig.state.lock();
        let index = state
            .registrations
            .iter()
            .position(|r| r.handle == handle)
            .ok_or_else(|| RangingError::CallbackRegistration {
                pin: 0,
                reason: format!("unknown callback handle {}", handle.0),
            })?;
        state.registrations.remove(index);
        state.unregistered += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_falling_trigger_plays_echo() {
        let rig = SimRig::new(RigConfig::default());
        rig.set_echo(EchoProfile::Respond { latency: Timespec::from_micros(5), width: Timespec::from_micros(20) });
        let mut gpio = rig.gpio();
        gpio.configure_line(18, Direction::Output).unwrap();
        gpio.configure_line(24, Direction::Input).unwrap();

        gpio.write_line(18, Level::High).unwrap();
        gpio.write_line(18, Level::Low).unwrap();
        assert_eq!(rig.triggers(), 1);

        let mut highs = 0;
        for _ in 0..40 {
            if gpio.read_line(24).unwrap() == Level::High {
                highs += 1;
            }
        }
        // One read per microsecond; the echo is high for 20 of them.
        assert_eq!(highs, 20);
    }

    #[test]
    fn test_callback_timeout_fires_sentinel() {
        let rig = SimRig::new(RigConfig::default());
        let mut gpio = rig.gpio();
        let clock = rig.clock();
        gpio.configure_line(24, Direction::Input).unwrap();

        let timeouts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&timeouts);
        gpio.register_edge_callback(
            24,
            Edge::Falling,
            Timespec::from_millis(5),
            Box::new(move |report| {
                if report.level == CallbackLevel::Timeout {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

        crate::clock::sleep_for(&clock, Timespec::from_millis(4)).unwrap();
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        crate::clock::sleep_for(&clock, Timespec::from_millis(2)).unwrap();
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_to_input_is_rejected() {
        let rig = SimRig::new(RigConfig::default());
        let mut gpio = rig.gpio();
        gpio.configure_line(24, Direction::Input).unwrap();
        assert!(matches!(gpio.write_line(24, Level::High), Err(RangingError::LineIo { pin: 24, .. })));
    }

    #[test]
    fn test_pin_out_of_range() {
        let rig = SimRig::new(RigConfig::default());
        let mut gpio = rig.gpio();
        assert!(matches!(
            gpio.configure_line(60, Direction::Output),
            Err(RangingError::LineSetup { pin: 60, .. })
        ));
    }

    #[test]
    fn test_drop_every() {
        let rig = SimRig::new(RigConfig { drop_every: 2, ..RigConfig::default() });
        rig.set_echo(EchoProfile::Respond { latency: Timespec::ZERO, width: Timespec::from_micros(3) });
        let mut gpio = rig.gpio();
        gpio.configure_line(18, Direction::Output).unwrap();
        gpio.configure_line(24, Direction::Input).unwrap();

        let mut echoes = 0;
        for _ in 0..4 {
            gpio.write_line(18, Level::High).unwrap();
            gpio.write_line(18, Level::Low).unwrap();
            let high = (0..10).any(|_| gpio.read_line(24).unwrap() == Level::High);
            if high {
                echoes += 1;
            }
        }
        assert_eq!(echoes, 2);
    }
}
