use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use sonar_core::{SamplerConfig, TimeoutPolicy};
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const CONFIG_PATH_VAR: &str = "SONAR_CONFIG";
const ENV_PREFIX: &str = "SONAR";

/// Everything the application reads from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sensor: SamplerConfig,
    pub sampling: SamplingSettings,
    pub backend: BackendSettings,
    pub simulation: SimulationSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    /// Pause between measurements.
    pub interval_ms: u64,
    pub on_timeout: TimeoutPolicy,
    /// The watchdog complains when no echo has arrived for this long.
    pub stale_after_ms: u64,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        SamplingSettings { interval_ms: 1_000, on_timeout: TimeoutPolicy::Continue, stale_after_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Simulated,
    Rppal,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Distance of the simulated obstacle.
    pub distance_mm: f64,
    /// Every n-th pulse gets no echo. 0 never drops.
    pub drop_every: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings { distance_mm: 1_000.0, drop_every: 0 }
    }
}

/// Loads settings from the TOML file (`SONAR_CONFIG` or `config/default.toml`)
/// and `SONAR_*` environment variables, in that order.
pub fn load_settings() -> Result<Settings, ConfigError> {
    let (path, required) = match std::env::var(CONFIG_PATH_VAR) {
        Ok(path) => (path, true),
        Err(_) => (DEFAULT_CONFIG_PATH.to_string(), false),
    };
    info!("Attempting to load configuration from {}", path);

    let settings = Config::builder()
        .add_source(File::new(&path, FileFormat::Toml).required(required))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|config| config.try_deserialize::<Settings>())
        .and_then(validate);

    match settings {
        Ok(settings) => {
            info!("Successfully loaded configuration: {:?}", settings);
            Ok(settings)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            Err(e)
        }
    }
}

fn validate(settings: Settings) -> Result<Settings, ConfigError> {
    if settings.sampling.interval_ms == 0 {
        return Err(ConfigError::Message("sampling.interval_ms must be positive".into()));
    }
    if settings.sampling.stale_after_ms == 0 {
        return Err(ConfigError::Message("sampling.stale_after_ms must be positive".into()));
    }
    if !settings.simulation.distance_mm.is_finite() || settings.simulation.distance_mm < 0.0 {
        return Err(ConfigError::Message("simulation.distance_mm must be a non-negative number".into()));
    }
    if settings.backend.kind == BackendKind::Rppal && !cfg!(feature = "rpi") {
        return Err(ConfigError::Message("backend.kind = \"rppal\" needs the `rpi` feature".into()));
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_core::{PulseMode, WaitMode};

    fn from_toml(toml: &str) -> Result<Settings, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .and_then(|config| config.try_deserialize::<Settings>())
            .and_then(validate)
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = from_toml("").unwrap();
        assert_eq!(settings.sensor, SamplerConfig::default());
        assert_eq!(settings.sampling.interval_ms, 1_000);
        assert_eq!(settings.sampling.on_timeout, TimeoutPolicy::Continue);
        assert_eq!(settings.backend.kind, BackendKind::Simulated);
    }

    #[test]
    fn test_shipped_default_file_parses() {
        let settings = from_toml(include_str!("../config/default.toml")).unwrap();
        assert_eq!(settings.sensor.trigger_pin, 18);
        assert_eq!(settings.sensor.echo_pin, 24);
        assert_eq!(settings.sensor.echo_timeout_us, 500_000);
    }

    #[test]
    fn test_partial_override() {
        let settings = from_toml(
            r#"
            [sensor]
            echo_pin = 23
            wait = "busy_poll"
            pulse = "manual"

            [sampling]
            on_timeout = "fatal"
            "#,
        )
        .unwrap();
        assert_eq!(settings.sensor.echo_pin, 23);
        assert_eq!(settings.sensor.trigger_pin, 18);
        assert_eq!(settings.sensor.wait, WaitMode::BusyPoll);
        assert_eq!(settings.sensor.pulse, PulseMode::Manual);
        assert_eq!(settings.sampling.on_timeout, TimeoutPolicy::Fatal);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(from_toml("[sampling]\ninterval_ms = 0").is_err());
        assert!(from_toml("[sensor]\nwait = \"sometimes\"").is_err());
        assert!(from_toml("[simulation]\ndistance_mm = -5.0").is_err());
    }

    #[cfg(not(feature = "rpi"))]
    #[test]
    fn test_rppal_needs_feature() {
        assert!(from_toml("[backend]\nkind = \"rppal\"").is_err());
    }
}
