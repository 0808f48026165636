//! Waiting for an edge on the echo line.
//!
//! Two strategies implement [`EdgeWaiter`]:
//!
//! - [`InterruptWaiter`] registers a backend callback and sleeps in short
//!   intervals until the callback has fired. Elapsed time comes from the tick
//!   the callback recorded, not from the coarser poll loop.
//! - [`BusyPollWaiter`] reads the line back to back until the pulse starts and
//!   again until it ends. It keeps a CPU busy for the whole echo.
//!
//! Both report elapsed time as a whole number of backend ticks and both give
//! up after the requested timeout.

use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use tracing::{debug, trace};

use crate::backend::{CallbackLevel, EdgeCallback, EdgeReport, Edge, GpioBackend, Level, Registration, Tick};
use crate::clock::{Clock, sleep_for};
use crate::error::RangingError;
use crate::time::Timespec;

/// Outcome of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeEvent {
    /// The edge arrived `elapsed` after the wait began; the line is now at `level`.
    Fired {
        /// Time from the start of the wait to the edge.
        elapsed: Timespec,
        /// Level after the edge.
        level: Level,
    },
    /// No edge within the timeout.
    TimedOut,
}

/// What to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRequest {
    /// Input pin to watch.
    pub pin: u8,
    /// Transition that ends the wait.
    pub edge: Edge,
    /// Give up after this long.
    pub timeout: Timespec,
}

/// A strategy for observing an edge on an input line.
pub trait EdgeWaiter: Send {
    /// Blocks until `request.edge` occurs on `request.pin` or the timeout
    /// elapses.
    fn wait_for_edge(
        &self,
        backend: &mut dyn GpioBackend,
        clock: &dyn Clock,
        request: EdgeRequest,
    ) -> Result<EdgeEvent, RangingError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Time covered by the ticks from `start` to `end`.
///
/// The subtraction wraps, so a counter overflow between the two readings
/// still gives the right span.
pub fn ticks_to_span(start: Tick, end: Tick, period_ns: u32) -> Timespec {
    Timespec::from_nanos(u64::from(end.wrapping_sub(start)) * u64::from(period_ns))
}

/// Time since a starting tick, summed reading by reading.
///
/// Each step between two readings wraps on its own, so the total stays right
/// past one trip around the tick counter as long as consecutive readings are
/// less than a full trip apart.
#[derive(Debug, Clone, Copy)]
struct Stopwatch {
    last: Tick,
    ticks: u64,
    period_ns: u32,
}

impl Stopwatch {
    fn start(at: Tick, period_ns: u32) -> Self {
        Stopwatch { last: at, ticks: 0, period_ns }
    }

    /// Folds in a new reading and returns the total so far.
    fn lap(&mut self, now: Tick) -> Timespec {
        self.ticks = self.ticks.saturating_add(u64::from(now.wrapping_sub(self.last)));
        self.last = now;
        Timespec::from_nanos(self.ticks.saturating_mul(u64::from(self.period_ns)))
    }
}

/// Hand-off between the callback context and the waiting thread.
///
/// The first report wins. Level and tick are written before `fired` is
/// published with release ordering, and read after it is observed with
/// acquire ordering.
#[derive(Debug, Default)]
struct EdgeSlot {
    claimed: AtomicBool,
    fired: AtomicBool,
    level: AtomicU8,
    tick: AtomicU32,
}

impl EdgeSlot {
    const LOW: u8 = 0;
    const HIGH: u8 = 1;
    const TIMEOUT: u8 = 2;

    fn record(&self, report: EdgeReport) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return;
        }
        let level = match report.level {
            CallbackLevel::Low => Self::LOW,
            CallbackLevel::High => Self::HIGH,
            CallbackLevel::Timeout => Self::TIMEOUT,
        };
        self.tick.store(report.tick, Ordering::Relaxed);
        self.level.store(level, Ordering::Relaxed);
        self.fired.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<EdgeReport> {
        if !self.fired.load(Ordering::Acquire) {
            return None;
        }
        let level = match self.level.load(Ordering::Relaxed) {
            Self::LOW => CallbackLevel::Low,
            Self::HIGH => CallbackLevel::High,
            _ => CallbackLevel::Timeout,
        };
        Some(EdgeReport { level, tick: self.tick.load(Ordering::Relaxed) })
    }
}

/// Waits through a backend edge callback, sleeping between checks.
#[derive(Debug, Clone, Copy)]
pub struct InterruptWaiter {
    poll_interval: Timespec,
}

impl InterruptWaiter {
    /// A waiter that checks for the edge every `poll_interval`.
    pub const fn new(poll_interval: Timespec) -> Self {
        InterruptWaiter { poll_interval }
    }

    /// Sleeps until the slot fills or the local deadline passes.
    ///
    /// Returns `None` when the backend never reported, not even a timeout.
    fn poll(
        &self,
        slot: &EdgeSlot,
        registration: &mut Registration<'_>,
        clock: &dyn Clock,
        mut watch: Stopwatch,
        give_up: Timespec,
    ) -> Result<Option<EdgeReport>, RangingError> {
        loop {
            sleep_for(clock, self.poll_interval)?;

            if let Some(report) = slot.take() {
                return Ok(Some(report));
            }

            let now = registration.backend().tick_now()?;
            if watch.lap(now) >= give_up {
                return Ok(None);
            }
        }
    }
}

impl Default for InterruptWaiter {
    fn default() -> Self {
        InterruptWaiter::new(Timespec::from_millis(1))
    }
}

impl EdgeWaiter for InterruptWaiter {
    fn wait_for_edge(
        &self,
        backend: &mut dyn GpioBackend,
        clock: &dyn Clock,
        request: EdgeRequest,
    ) -> Result<EdgeEvent, RangingError> {
        let period_ns = backend.tick_period_ns();
        let start = backend.tick_now()?;

        let slot = Arc::new(EdgeSlot::default());
        let callback: EdgeCallback = {
            let slot = Arc::clone(&slot);
            Box::new(move |report| slot.record(report))
        };
        let handle = backend.register_edge_callback(request.pin, request.edge, request.timeout, callback)?;
        let mut registration = Registration::new(backend, request.pin, handle);

        // Backends without native callback timeouts are cut off here.
        let grace = self.poll_interval.checked_add(self.poll_interval).unwrap_or(self.poll_interval);
        let give_up = request.timeout.checked_add(grace).unwrap_or(request.timeout);

        let outcome = self.poll(&slot, &mut registration, clock, Stopwatch::start(start, period_ns), give_up);
        let released = registration.release();
        let report = outcome?;
        released?;

        match report {
            Some(EdgeReport { level: CallbackLevel::Timeout, .. }) => Ok(EdgeEvent::TimedOut),
            Some(EdgeReport { level, tick }) => {
                let level = level.level().unwrap_or(request.edge.to_level());
                let elapsed = ticks_to_span(start, tick, period_ns);
                trace!(pin = request.pin, start, tick, %elapsed, "edge callback fired");
                Ok(EdgeEvent::Fired { elapsed, level })
            }
            None => {
                debug!(pin = request.pin, timeout = %request.timeout, "no callback before local deadline");
                Ok(EdgeEvent::TimedOut)
            }
        }
    }

    fn name(&self) -> &'static str {
        "interrupt"
    }
}

/// Waits by reading the line in a tight loop.
///
/// For a falling edge the pulse starts when the line reads high and ends when
/// it reads low; the reported time is the pulse width between those two reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusyPollWaiter;

impl BusyPollWaiter {
    /// Spins until `pin` reads `target`, returning the time of that read on
    /// `watch`, or `None` once `timeout` has passed on it.
    fn spin_until(
        backend: &mut dyn GpioBackend,
        pin: u8,
        target: Level,
        watch: &mut Stopwatch,
        timeout: Timespec,
    ) -> Result<Option<Timespec>, RangingError> {
        loop {
            let level = backend.read_line(pin)?;
            let elapsed = watch.lap(backend.tick_now()?);
            if level == target {
                return Ok(Some(elapsed));
            }
            if elapsed >= timeout {
                return Ok(None);
            }
            hint::spin_loop();
        }
    }
}

impl EdgeWaiter for BusyPollWaiter {
    fn wait_for_edge(
        &self,
        backend: &mut dyn GpioBackend,
        _clock: &dyn Clock,
        request: EdgeRequest,
    ) -> Result<EdgeEvent, RangingError> {
        let mut watch = Stopwatch::start(backend.tick_now()?, backend.tick_period_ns());
        let pulse_level = request.edge.from_level();
        let end_level = request.edge.to_level();

        let Some(pulse_start) = Self::spin_until(backend, request.pin, pulse_level, &mut watch, request.timeout)? else {
            debug!(pin = request.pin, "echo pulse never started");
            return Ok(EdgeEvent::TimedOut);
        };
        let Some(pulse_end) = Self::spin_until(backend, request.pin, end_level, &mut watch, request.timeout)? else {
            debug!(pin = request.pin, "echo pulse never ended");
            return Ok(EdgeEvent::TimedOut);
        };

        Ok(EdgeEvent::Fired { elapsed: pulse_end.saturating_sub(pulse_start), level: end_level })
    }

    fn name(&self) -> &'static str {
        "busy-poll"
    }
}
