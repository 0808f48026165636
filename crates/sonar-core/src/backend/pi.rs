//! Raspberry Pi GPIO through `rppal`.
//!
//! Edge callbacks use rppal's asynchronous interrupts, which run on a thread
//! owned by rppal. Event timestamps come from the kernel's `CLOCK_MONOTONIC`
//! and are turned into microsecond ticks, the same counter [`tick_now`]
//! reads. rppal callbacks carry no timeout, so the interrupt waiter's own
//! deadline ends a wait with a missing echo.
//!
//! [`tick_now`]: GpioBackend::tick_now

use std::collections::HashMap;
use std::time::Duration;

use rppal::gpio::{Event, Gpio, InputPin, Level as PinLevel, OutputPin, Trigger};
use tracing::warn;

use crate::backend::{
    CallbackHandle, CallbackLevel, Capabilities, Direction, Edge, EdgeCallback, EdgeReport, GpioBackend, Level,
    Tick,
};
use crate::clock::{Clock, MonotonicClock};
use crate::error::RangingError;
use crate::time::Timespec;

const TICK_NS: u32 = 1_000;

fn micros_tick(elapsed: Duration) -> Tick {
    elapsed.as_micros() as Tick
}

impl From<PinLevel> for Level {
    fn from(level: PinLevel) -> Self {
        match level {
            PinLevel::Low => Level::Low,
            PinLevel::High => Level::High,
        }
    }
}

impl From<Level> for PinLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Low => PinLevel::Low,
            Level::High => PinLevel::High,
        }
    }
}

/// GPIO on a Raspberry Pi, BCM pin numbering.
#[derive(Default)]
pub struct RppalBackend {
    gpio: Option<Gpio>,
    outputs: HashMap<u8, OutputPin>,
    inputs: HashMap<u8, InputPin>,
    registrations: HashMap<CallbackHandle, u8>,
    next_handle: u64,
    clock: MonotonicClock,
}

impl RppalBackend {
    /// A backend that opens the GPIO peripheral when the session starts.
    pub fn new() -> Self {
        RppalBackend::default()
    }

    fn input(&mut self, pin: u8) -> Result<&mut InputPin, RangingError> {
        self.inputs
            .get_mut(&pin)
            .ok_or_else(|| RangingError::LineIo { pin, reason: "line is not configured as an input".into() })
    }
}

impl GpioBackend for RppalBackend {
    fn initialise(&mut self) -> Result<(), RangingError> {
        let gpio = Gpio::new().map_err(|e| RangingError::Initialization(e.to_string()))?;
        self.gpio = Some(gpio);
        Ok(())
    }

    fn shutdown(&mut self) {
        for (handle, pin) in self.registrations.drain() {
            if let Some(input) = self.inputs.get_mut(&pin) {
                if let Err(e) = input.clear_async_interrupt() {
                    warn!(pin, handle = handle.0, error = %e, "failed to clear interrupt at shutdown");
                }
            }
        }
        // Dropping the pins restores their previous modes.
        self.outputs.clear();
        self.inputs.clear();
        self.gpio = None;
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { edge_callbacks: true, hardware_pulse: false }
    }

    fn configure_line(&mut self, pin: u8, direction: Direction) -> Result<(), RangingError> {
        let gpio = self
            .gpio
            .as_ref()
            .ok_or_else(|| RangingError::Initialization("GPIO used before initialisation".into()))?;
        let line = gpio.get(pin).map_err(|e| RangingError::LineSetup { pin, reason: e.to_string() })?;
        match direction {
            Direction::Output => {
                self.outputs.insert(pin, line.into_output_low());
            }
            Direction::Input => {
                self.inputs.insert(pin, line.into_input());
            }
        }
        Ok(())
    }

    fn write_line(&mut self, pin: u8, level: Level) -> Result<(), RangingError> {
        let output = self
            .outputs
            .get_mut(&pin)
            .ok_or_else(|| RangingError::LineIo { pin, reason: "line is not configured as an output".into() })?;
        output.write(level.into());
        Ok(())
    }

    fn read_line(&mut self, pin: u8) -> Result<Level, RangingError> {
        Ok(self.input(pin)?.read().into())
    }

    fn tick_now(&mut self) -> Result<Tick, RangingError> {
        let now = self.clock.now()?;
        Ok(micros_tick(now.into()))
    }

    fn tick_period_ns(&self) -> u32 {
        TICK_NS
    }

    fn register_edge_callback(
        &mut self,
        pin: u8,
        edge: Edge,
        _timeout: Timespec,
        mut callback: EdgeCallback,
    ) -> Result<CallbackHandle, RangingError> {
        let trigger = match edge {
            Edge::Rising => Trigger::RisingEdge,
            Edge::Falling => Trigger::FallingEdge,
        };
        let input = self
            .inputs
            .get_mut(&pin)
            .ok_or_else(|| RangingError::CallbackRegistration { pin, reason: "line is not configured as an input".into() })?;

        input
            .set_async_interrupt(trigger, None, move |event: Event| {
                let level = match event.trigger {
                    Trigger::RisingEdge => CallbackLevel::High,
                    _ => CallbackLevel::Low,
                };
                callback(EdgeReport { level, tick: micros_tick(event.timestamp) });
            })
            .map_err(|e| RangingError::CallbackRegistration { pin, reason: e.to_string() })?;

        let handle = CallbackHandle(self.next_handle);
        self.next_handle += 1;
        self.registrations.insert(handle, pin);
        Ok(handle)
    }

    fn unregister_edge_callback(&mut self, handle: CallbackHandle) -> Result<(), RangingError> {
        let pin = self.registrations.remove(&handle).ok_or_else(|| RangingError::CallbackRegistration {
            pin: 0,
            reason: format!("unknown callback handle {}", handle.0),
        })?;
        self.input(pin)?
            .clear_async_interrupt()
            .map_err(|e| RangingError::CallbackRegistration { pin, reason: e.to_string() })
    }
}
