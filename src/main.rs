mod blackboard; // latest sensor status shared across threads
mod bus; // reading broadcast
mod sensor; // sensor thread running the sampling loop
mod settings; // configuration loading

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use blackboard::{Blackboard, raise_fault, snapshot};
use bus::{Reading, ReadingTopic};
use sonar_core::{FatalReason, RangingError};
use tokio::sync::{broadcast, oneshot};
use tokio::sync::oneshot::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{self, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    info!("Sonar ranger started.");

    match run().await {
        Ok(()) => {
            info!("Sonar ranger stopped.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let reason = fatal_reason(&e);
            error!(%reason, "{e:#}");
            ExitCode::from(reason.exit_code())
        }
    }
}

/// The sensor thread ended without reporting why, i.e. it panicked.
#[derive(Debug, thiserror::Error)]
#[error("sensor thread ended unexpectedly")]
struct SensorLost;

/// Maps a top-level error onto the exit status the process reports.
fn fatal_reason(e: &anyhow::Error) -> FatalReason {
    if let Some(ranging) = e.downcast_ref::<RangingError>() {
        ranging.fatal_reason()
    } else if e.downcast_ref::<SensorLost>().is_some() {
        FatalReason::Measurement
    } else if e.downcast_ref::<::config::ConfigError>().is_some() {
        FatalReason::Configuration
    } else {
        FatalReason::Initialization
    }
}

/// What the sensor thread reported before stopping on its own.
fn sensor_outcome(report: Result<RangingError, RecvError>) -> anyhow::Result<()> {
    match report {
        Ok(e) => Err(anyhow::Error::new(e).context("sensor stopped")),
        Err(_) => Err(SensorLost.into()),
    }
}

/// Folds the sensor thread's join result into the run outcome. An earlier
/// error wins.
fn after_join(outcome: anyhow::Result<()>, joined_cleanly: bool) -> anyhow::Result<()> {
    if joined_cleanly {
        outcome
    } else {
        warn!("Sensor thread did not shut down cleanly.");
        outcome.and(Err(SensorLost.into()))
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = settings::load_settings().context("loading configuration")?;
    let stale_after = Duration::from_millis(settings.sampling.stale_after_ms);

    let bb: Blackboard = Arc::default();
    let reading_topic = ReadingTopic::new(16);
    let stop = Arc::new(AtomicBool::new(false));
    let (fault_tx, fault_rx) = oneshot::channel::<RangingError>();

    let reporter = tokio::spawn(report_readings(reading_topic.subscribe()));
    let watchdog = tokio::spawn(watchdog(bb.clone(), stale_after));

    info!("Spawning sensor thread...");
    let sensor = sensor::spawn(settings, reading_topic, bb.clone(), Arc::clone(&stop), fault_tx)
        .context("spawning sensor thread")?;

    let outcome = tokio::select! {
        report = fault_rx => sensor_outcome(report),
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("Ctrl-C received, stopping sensor.");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("listening for Ctrl-C")),
        },
    };

    // The sensor thread notices within one sampling interval and releases the GPIO backend.
    stop.store(true, Ordering::Release);
    let joined = tokio::task::spawn_blocking(move || sensor.join()).await;
    let outcome = after_join(outcome, matches!(joined, Ok(Ok(()))));
    reporter.abort();
    watchdog.abort();

    let state = snapshot(&bb);
    info!(
        cycles = state.cycles,
        missed = state.missed,
        last_distance_mm = ?state.last_distance_mm,
        faults = ?state.faults,
        "Final sensor state."
    );
    outcome
}

async fn report_readings(mut rx: broadcast::Receiver<Arc<Reading>>) {
    loop {
        match rx.recv().await {
            Ok(reading) => info!(seq = reading.seq, "Measured Distance = {:.1} mm", reading.distance_mm),
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "Reporter lagging behind sensor."),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn watchdog(bb: Blackboard, stale_after: Duration) {
    info!("Watchdog task started.");
    let mut tick = tokio::time::interval((stale_after / 2).max(Duration::from_millis(10)));
    loop {
        tick.tick().await;
        let state = snapshot(&bb);
        let age = state.last_echo_ts.elapsed();
        if age > stale_after {
            warn!(?age, missed = state.missed, "No echo received recently.");
            raise_fault(&bb, "echo stale");
        }
    }
}
