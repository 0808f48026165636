use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use std::time::Duration;

use sonar_core::sim::{EchoProfile, RigConfig, SimRig};
use sonar_core::{Clock, CycleOutcome, DistanceSampler, GpioBackend, RangingError, SamplingLoop};
use spin_sleep::SpinSleeper;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::blackboard::{self, Blackboard};
use crate::bus::{Reading, ReadingTopic};
use crate::settings::{BackendKind, Settings};

/// Starts the sampling loop on its own thread.
///
/// The thread owns the GPIO backend for its whole life. It ends when `stop` is
/// set, or after sending the fatal error on `fault_tx`.
pub fn spawn(
    settings: Settings,
    topic: ReadingTopic,
    bb: Blackboard,
    stop: Arc<AtomicBool>,
    fault_tx: oneshot::Sender<RangingError>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("sensor".into()).spawn(move || {
        info!("Sensor thread started.");
        let result = match settings.backend.kind {
            BackendKind::Simulated => {
                let rig = SimRig::new(RigConfig {
                    echo_pin: settings.sensor.echo_pin,
                    drop_every: settings.simulation.drop_every,
                    ..RigConfig::default()
                });
                rig.set_echo(EchoProfile::for_distance_mm(settings.simulation.distance_mm));
                info!(distance_mm = settings.simulation.distance_mm, "using simulated sensor");
                sample(rig.gpio(), rig.clock(), &settings, &topic, &bb, &stop)
            }
            #[cfg(feature = "rpi")]
            BackendKind::Rppal => sample(
                sonar_core::RppalBackend::new(),
                sonar_core::MonotonicClock::new(),
                &settings,
                &topic,
                &bb,
                &stop,
            ),
            #[cfg(not(feature = "rpi"))]
            BackendKind::Rppal => Err(RangingError::Initialization("built without the `rpi` feature".into())),
        };

        match result {
            Ok(()) => info!("Sensor thread finished."),
            Err(e) => {
                error!("Sensor thread failed: {e}");
                blackboard::raise_fault(&bb, &e.to_string());
                let _ = fault_tx.send(e);
            }
        }
    })
}

fn sample<B: GpioBackend, C: Clock>(
    backend: B,
    clock: C,
    settings: &Settings,
    topic: &ReadingTopic,
    bb: &Blackboard,
    stop: &AtomicBool,
) -> Result<(), RangingError> {
    let sampler = DistanceSampler::new(backend, clock, settings.sensor)?;
    let mut sampling = SamplingLoop::new(
        sampler,
        SpinSleeper::default(),
        Duration::from_millis(settings.sampling.interval_ms),
        settings.sampling.on_timeout,
    );

    let mut seq = 0;
    sampling.run(stop, |outcome| {
        blackboard::record(bb, outcome);
        if let CycleOutcome::Measured(m) = outcome {
            seq += 1;
            topic.publish(Reading { seq, distance_mm: m.millimetres() });
        }
    })
}
