//! The sampling loop: one measurement per interval until a fault or a stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spin_sleep::SpinSleeper;
use tracing::{error, info, trace, warn};

use crate::backend::GpioBackend;
use crate::clock::Clock;
use crate::error::RangingError;
use crate::sampler::{DistanceSampler, Measurement};

/// What to do when an echo does not come back in time.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Report a missed cycle and keep sampling.
    #[default]
    Continue,
    /// Treat the timeout like any other failure and stop.
    Fatal,
}

/// Where the loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Between cycles.
    Idle,
    /// A measurement is in flight.
    Measuring,
    /// A result is being handed upward.
    Reporting,
    /// An unrecoverable error occurred. Terminal.
    Faulted,
}

/// Result of one cycle as seen by the reporter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// The echo came back.
    Measured(Measurement),
    /// The echo was missed and the policy said to carry on.
    Missed,
}

/// Inter-cycle pacing.
pub trait Pace {
    /// Sleeps for roughly `interval`.
    fn pause(&mut self, interval: Duration);
}

impl Pace for SpinSleeper {
    fn pause(&mut self, interval: Duration) {
        self.sleep(interval);
    }
}

/// Drives a [`DistanceSampler`] at a fixed cadence.
pub struct SamplingLoop<B: GpioBackend, C: Clock, P: Pace> {
    sampler: DistanceSampler<B, C>,
    pacer: P,
    interval: Duration,
    policy: TimeoutPolicy,
    state: LoopState,
    fault: Option<RangingError>,
    cycles: u64,
    missed: u64,
}

impl<B: GpioBackend, C: Clock, P: Pace> SamplingLoop<B, C, P> {
    /// A loop measuring once every `interval`.
    pub fn new(sampler: DistanceSampler<B, C>, pacer: P, interval: Duration, policy: TimeoutPolicy) -> Self {
        SamplingLoop {
            sampler,
            pacer,
            interval,
            policy,
            state: LoopState::Idle,
            fault: None,
            cycles: 0,
            missed: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Cycles completed, missed ones included.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Cycles whose echo was missed.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// The sampler being driven.
    pub fn sampler(&self) -> &DistanceSampler<B, C> {
        &self.sampler
    }

    fn enter(&mut self, next: LoopState) {
        trace!(from = ?self.state, to = ?next, "sampling state");
        self.state = next;
    }

    /// Runs one cycle and leaves the loop in [`LoopState::Reporting`].
    ///
    /// Once the loop has faulted every call returns the same error.
    pub fn step(&mut self) -> Result<CycleOutcome, RangingError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }

        self.enter(LoopState::Measuring);
        let outcome = match self.sampler.measure() {
            Ok(measurement) => CycleOutcome::Measured(measurement),
            Err(e) if e.is_echo_timeout() && self.policy == TimeoutPolicy::Continue => {
                self.missed += 1;
                warn!(missed = self.missed, "{e}");
                CycleOutcome::Missed
            }
            Err(e) => {
                self.enter(LoopState::Faulted);
                error!(cycle = self.cycles, reason = %e.fatal_reason(), "sampling failed: {e}");
                self.fault = Some(e.clone());
                return Err(e);
            }
        };

        self.cycles += 1;
        self.enter(LoopState::Reporting);
        Ok(outcome)
    }

    /// Samples until `stop` is set or a cycle faults.
    ///
    /// `report` sees every outcome. Returns `Ok` only when stopped.
    pub fn run<F>(&mut self, stop: &AtomicBool, mut report: F) -> Result<(), RangingError>
    where
        F: FnMut(&CycleOutcome),
    {
        info!(interval_ms = self.interval.as_millis() as u64, policy = ?self.policy, "sampling loop started");
        while !stop.load(Ordering::Acquire) {
            let outcome = self.step()?;
            report(&outcome);
            self.enter(LoopState::Idle);
            self.pacer.pause(self.interval);
        }
        info!(cycles = self.cycles, missed = self.missed, "sampling loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capabilities, Level};
    use crate::sampler::SamplerConfig;
    use crate::sim::{EchoProfile, RigConfig, SimClock, SimGpio, SimRig};

    #[derive(Default)]
    struct RecordingPacer {
        pauses: Vec<Duration>,
    }

    impl Pace for RecordingPacer {
        fn pause(&mut self, interval: Duration) {
            self.pauses.push(interval);
        }
    }

    fn sampling_loop(rig: &SimRig, policy: TimeoutPolicy) -> SamplingLoop<SimGpio, SimClock, RecordingPacer> {
        let sampler = DistanceSampler::new(rig.gpio(), rig.clock(), SamplerConfig::default()).unwrap();
        SamplingLoop::new(sampler, RecordingPacer::default(), Duration::from_secs(1), policy)
    }

    #[test]
    fn test_step_cycle_states() {
        let rig = SimRig::new(RigConfig::default());
        let mut sampling = sampling_loop(&rig, TimeoutPolicy::Continue);
        assert_eq!(sampling.state(), LoopState::Idle);

        let outcome = sampling.step().unwrap();
        assert!(matches!(outcome, CycleOutcome::Measured(_)));
        assert_eq!(sampling.state(), LoopState::Reporting);
        assert_eq!(sampling.cycles(), 1);
    }

    #[test]
    fn test_continue_policy_keeps_sampling() {
        let rig = SimRig::new(RigConfig { drop_every: 2, ..RigConfig::default() });
        rig.set_echo(EchoProfile::for_distance_mm(400.0));
        let mut sampling = sampling_loop(&rig, TimeoutPolicy::Continue);

        let stop = AtomicBool::new(false);
        let mut outcomes = Vec::new();
        sampling
            .run(&stop, |outcome| {
                outcomes.push(*outcome);
                if outcomes.len() == 4 {
                    stop.store(true, Ordering::Release);
                }
            })
            .unwrap();

        assert_eq!(outcomes.len(), 4);
        assert!(matches!(outcomes[0], CycleOutcome::Measured(_)));
        assert_eq!(outcomes[1], CycleOutcome::Missed);
        assert!(matches!(outcomes[2], CycleOutcome::Measured(_)));
        assert_eq!(outcomes[3], CycleOutcome::Missed);
        assert_eq!(sampling.cycles(), 4);
        assert_eq!(sampling.missed(), 2);
        assert_eq!(sampling.state(), LoopState::Idle);
        assert_eq!(sampling.pacer.pauses, vec![Duration::from_secs(1); 4]);
    }

    #[test]
    fn test_fatal_policy_faults_on_timeout() {
        let rig = SimRig::new(RigConfig::default());
        rig.set_echo(EchoProfile::Silent);
        let mut sampling = sampling_loop(&rig, TimeoutPolicy::Fatal);

        let stop = AtomicBool::new(false);
        let err = sampling.run(&stop, |_| {}).unwrap_err();
        assert!(err.is_echo_timeout());
        assert_eq!(sampling.state(), LoopState::Faulted);

        // Faulted is terminal, even if the sensor recovers.
        rig.set_echo(EchoProfile::for_distance_mm(100.0));
        assert_eq!(sampling.step().unwrap_err(), err);
        assert_eq!(rig.triggers(), 1);
    }

    #[test]
    fn test_hardware_fault_is_fatal_under_continue_policy() {
        let rig = SimRig::new(RigConfig {
            capabilities: Capabilities { edge_callbacks: true, hardware_pulse: false },
            ..RigConfig::default()
        });
        let mut sampling = sampling_loop(&rig, TimeoutPolicy::Continue);
        rig.fail_writes(18, Level::High);

        let stop = AtomicBool::new(false);
        let mut reports = 0;
        let err = sampling.run(&stop, |_| reports += 1).unwrap_err();
        assert!(matches!(err, RangingError::LineIo { pin: 18, .. }));
        assert_eq!(reports, 0);
        assert_eq!(sampling.state(), LoopState::Faulted);
        assert!(sampling.pacer.pauses.is_empty());
    }

    #[test]
    fn test_stop_before_start() {
        let rig = SimRig::new(RigConfig::default());
        let mut sampling = sampling_loop(&rig, TimeoutPolicy::Continue);
        let stop = AtomicBool::new(true);
        sampling.run(&stop, |_| panic!("no cycle expected")).unwrap();
        assert_eq!(sampling.cycles(), 0);
        assert_eq!(rig.triggers(), 0);
    }
}
