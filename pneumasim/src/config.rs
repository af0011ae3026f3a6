//! Configuration management for pneumasim.
//!
//! Timing and calibration values come from built-in defaults, optionally
//! replaced by a JSON document supplied by the composing application, and
//! finally overridden by `PNEUMASIM_*` environment variables. Nothing is
//! persisted.

use crate::controller::calibration::{
    DEFAULT_PRESSURE_MAXIMA, DEFAULT_REGULATION, EXPECTED_FIRMWARE_VERSION,
};
use crate::error::{Error, Result};
use crate::transport::{PressureMaxima, RegulationParams};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Controller timing.
    pub timing: TimingConfig,

    /// Discovery behaviour.
    pub discovery: DiscoveryConfig,

    /// Values written to the device after each handshake.
    pub calibration: CalibrationConfig,

    /// Create demo devices instead of probing hardware.
    pub demo: bool,
}

/// Poll loop and deadline settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between transport polls
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Report progress every this many polls
    pub progress_every: u32,

    /// Deadline for pressurizing a single valve
    #[serde(with = "millis")]
    pub apply_timeout: Duration,

    /// Deadline multiplier when all valves are pressurized at once
    pub all_channels_factor: u32,

    /// Slack added on top of a timed evacuation's own duration
    #[serde(with = "millis")]
    pub evacuate_margin: Duration,

    /// Deadline for a pressure measurement
    #[serde(with = "millis")]
    pub measure_timeout: Duration,

    /// Wait for the serial number during the handshake
    #[serde(with = "millis")]
    pub identity_timeout: Duration,

    /// Bound on opening the port before the handshake
    #[serde(with = "millis")]
    pub open_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            progress_every: 5,
            apply_timeout: Duration::from_secs(20),
            all_channels_factor: 7,
            evacuate_margin: Duration::from_secs(10),
            measure_timeout: Duration::from_secs(5),
            identity_timeout: Duration::from_secs(2),
            open_timeout: Duration::from_secs(5),
        }
    }
}

/// Registry discovery settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Overall deadline for one discovery pass
    #[serde(with = "millis")]
    pub timeout: Duration,

    /// Bound on a liveness probe of an existing device
    #[serde(with = "millis")]
    pub liveness_timeout: Duration,

    /// Connection attempts allowed in flight at once
    pub max_parallel_probes: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(3),
            max_parallel_probes: 8,
        }
    }
}

/// Device calibration targets.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Firmware version the controller is tuned for
    pub expected_firmware: String,

    /// Per-valve pressure ceilings, millibar
    pub pressure_maxima: PressureMaxima,

    pub regulation_gain: u8,
    pub regulation_hysteresis_mb: u8,
    pub regulation_ramp_mb_per_s: u8,
}

impl CalibrationConfig {
    pub fn regulation(&self) -> RegulationParams {
        RegulationParams {
            gain: self.regulation_gain,
            hysteresis_mb: self.regulation_hysteresis_mb,
            ramp_mb_per_s: self.regulation_ramp_mb_per_s,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            expected_firmware: EXPECTED_FIRMWARE_VERSION.to_string(),
            pressure_maxima: DEFAULT_PRESSURE_MAXIMA,
            regulation_gain: DEFAULT_REGULATION.gain,
            regulation_hysteresis_mb: DEFAULT_REGULATION.hysteresis_mb,
            regulation_ramp_mb_per_s: DEFAULT_REGULATION.ramp_mb_per_s,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            discovery: DiscoveryConfig::default(),
            calibration: CalibrationConfig::default(),
            demo: false,
        }
    }
}

impl Config {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `PNEUMASIM_*` environment variables.
    ///
    /// Unset variables leave the current value alone; unparsable ones are
    /// an error rather than silently ignored.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(secs) = env_parse::<u64>("PNEUMASIM_DISCOVERY_TIMEOUT_SECS")? {
            self.discovery.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PNEUMASIM_LIVENESS_TIMEOUT_SECS")? {
            self.discovery.liveness_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("PNEUMASIM_MAX_PARALLEL_PROBES")? {
            self.discovery.max_parallel_probes = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("PNEUMASIM_POLL_INTERVAL_MS")? {
            self.timing.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = env_parse::<u64>("PNEUMASIM_OPEN_TIMEOUT_SECS")? {
            self.timing.open_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PNEUMASIM_APPLY_TIMEOUT_SECS")? {
            self.timing.apply_timeout = Duration::from_secs(secs);
        }
        if let Ok(version) = std::env::var("PNEUMASIM_EXPECTED_FIRMWARE") {
            self.calibration.expected_firmware = version;
        }
        if let Some(demo) = env_parse::<bool>("PNEUMASIM_DEMO")? {
            self.demo = demo;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, value))),
        Err(_) => Ok(None),
    }
}

// Durations are written as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_json_partial_override() {
        let config = Config::from_json(
            r#"{ "timing": { "poll_interval": 50 }, "discovery": { "max_parallel_probes": 2 } }"#,
        )
        .unwrap();
        assert_eq!(config.timing.poll_interval, Duration::from_millis(50));
        assert_eq!(config.timing.measure_timeout, Duration::from_secs(5));
        assert_eq!(config.discovery.max_parallel_probes, 2);
        assert_eq!(config.discovery.timeout, Duration::from_secs(30));
        assert!(!config.demo);
    }

    #[test]
    fn test_json_rejects_garbage() {
        assert!(matches!(Config::from_json("{ nope"), Err(Error::Config(_))));
    }

    #[test]
    fn test_json_roundtrip_keeps_calibration() {
        let config = Config::default();
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(Config::from_json(&text).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("PNEUMASIM_DISCOVERY_TIMEOUT_SECS", "12");
        std::env::set_var("PNEUMASIM_OPEN_TIMEOUT_SECS", "1");
        std::env::set_var("PNEUMASIM_DEMO", "true");
        let config = Config::from_env();
        std::env::remove_var("PNEUMASIM_DISCOVERY_TIMEOUT_SECS");
        std::env::remove_var("PNEUMASIM_OPEN_TIMEOUT_SECS");
        std::env::remove_var("PNEUMASIM_DEMO");

        let config = config.unwrap();
        assert_eq!(config.discovery.timeout, Duration::from_secs(12));
        assert_eq!(config.timing.open_timeout, Duration::from_secs(1));
        assert!(config.demo);
    }

    #[test]
    #[serial]
    fn test_env_rejects_unparsable() {
        std::env::set_var("PNEUMASIM_POLL_INTERVAL_MS", "fast");
        let result = Config::from_env();
        std::env::remove_var("PNEUMASIM_POLL_INTERVAL_MS");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
