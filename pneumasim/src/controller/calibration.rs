//! Device tuning constants.
//!
//! These values come from calibrating physical hardware, not from any
//! algorithm. Keep them as named constants; change them only together with
//! a firmware or valve-block revision.

use crate::transport::{PressureMaxima, RegulationParams};
use std::time::Duration;

/// Firmware the controller is tuned for. Older builds cannot reliably pump
/// several valves at once.
pub const EXPECTED_FIRMWARE_VERSION: &str = "V2.14";

/// Pressure ceiling written to every valve after connecting.
pub const DEFAULT_PRESSURE_MAXIMA: PressureMaxima = [200; 12];

pub const DEFAULT_REGULATION: RegulationParams = RegulationParams {
    gain: 40,
    hysteresis_mb: 2,
    ramp_mb_per_s: 25,
};

/// Accepted distance between requested and realized pressure.
pub const PRESSURE_TOLERANCE_MB: i32 = 3;

/// Valid apply-pressure targets.
pub const PRESSURE_RANGE_MB: std::ops::RangeInclusive<i32> = 1..=199;

/// Valid priming pressure before a single-valve evacuation.
pub const EVACUATION_BASE_RANGE_MB: std::ops::RangeInclusive<i32> = 10..=199;

/// Evacuation duration bounds for one valve and for all valves.
pub const EVACUATION_MS_RANGE: std::ops::RangeInclusive<u32> = 10..=10_000;
pub const EVACUATION_ALL_MS_RANGE: std::ops::RangeInclusive<u32> = 10..=40_000;

/// Per-valve seconds accepted by batched evacuation.
pub const BATCH_EVACUATION_SECONDS: std::ops::RangeInclusive<f64> = -7.0..=0.0;

/// Evacuating several valves together is faster than one after another.
pub const BATCH_EVACUATION_FACTOR: f64 = 0.9;

/// Batched evacuations shorter than this are skipped.
pub const MIN_BATCH_EVACUATION: Duration = Duration::from_millis(100);

/// Pump speed used for timed evacuation.
pub const EVACUATION_SPEED: u8 = 100;

/// A calibration pump cycle that finishes faster than this probably did
/// not reach its target and is repeated once.
pub const MIN_CALIBRATION_PUMP_TIME: Duration = Duration::from_secs(6);

/// Device family presets for pressure-mapping preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum MappingProfile {
    /// Full-size valve block.
    Standard,
    /// Small valve block with less dead volume.
    Compact,
}

impl MappingProfile {
    /// Pressure every valve is pumped to before evacuating.
    pub fn calibration_pressure_mb(self) -> u8 {
        match self {
            Self::Standard => 20,
            Self::Compact => 15,
        }
    }

    /// How long all valves are evacuated afterwards.
    pub fn evacuation_time(self) -> Duration {
        match self {
            Self::Standard => Duration::from_millis(12_000),
            Self::Compact => Duration::from_millis(7_000),
        }
    }
}
