//! Capability interface shared by real and demo simulators.
//!
//! Callers never see which variant they hold: the registry hands out
//! [`ControllerHandle`]s, and both [`Controller`] (real hardware) and
//! [`DemoSimulator`] (no hardware, for exercising user interfaces)
//! implement [`Simulator`].

use crate::config::Config;
use crate::controller::{
    calibration::PRESSURE_TOLERANCE_MB, ConnectError, Controller, DemoSimulator, DeviceState,
    MappingProfile, OperationError, OperationKind,
};
use crate::transport::Transport;
use crate::types::{Progress, ProgressSink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to a live simulator.
pub type ControllerHandle = Arc<dyn Simulator>;

/// How many simulators the installation drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum SetupKind {
    #[default]
    OneDevice,
    MultipleDevices,
}

/// Result of a completed pressurization.
///
/// A realized pressure outside tolerance is not an error, but it is never
/// hidden either: check [`PressureOutcome::within_tolerance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureOutcome {
    pub target_mb: i32,
    pub realized_mb: i32,
}

impl PressureOutcome {
    pub fn new(target_mb: i32, realized_mb: i32) -> Self {
        Self {
            target_mb,
            realized_mb,
        }
    }

    pub fn within_tolerance(&self) -> bool {
        self.deviation_mb().is_none()
    }

    /// Signed deviation from the target when it exceeds the tolerance.
    pub fn deviation_mb(&self) -> Option<i32> {
        let deviation = self.realized_mb - self.target_mb;
        (deviation.abs() > PRESSURE_TOLERANCE_MB).then_some(deviation)
    }
}

/// Snapshot of the operation occupying a simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationInfo {
    pub kind: OperationKind,
    /// Channel(s) addressed
    pub target: String,
    /// Requested value in millibar or milliseconds
    pub value: Option<i64>,
    pub elapsed: Duration,
    /// Time left before the current phase's deadline
    pub remaining: Option<Duration>,
    pub progress: Progress,
}

/// Operations every simulator variant supports.
///
/// Every method returns a typed result; argument validation happens before
/// any device traffic.
#[async_trait]
pub trait Simulator: Send + Sync + std::fmt::Debug {
    fn port_name(&self) -> &str;

    /// Serial number, while connected.
    fn device_id(&self) -> Option<String>;

    fn state(&self) -> DeviceState;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Firmware differs from the version this controller is tuned for.
    /// Operations still run, but simultaneous multi-valve pumping may be
    /// unreliable.
    fn firmware_outdated(&self) -> bool;

    fn is_demo(&self) -> bool {
        false
    }

    fn current_operation(&self) -> Option<OperationInfo>;

    /// Drive one valve (1–12) or all valves (255) to `target_mb` (1–199).
    async fn apply_pressure(
        &self,
        channel: u8,
        target_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<PressureOutcome, OperationError>;

    /// Drive an explicit set of 1–12 valves to `target_mb`.
    async fn apply_pressure_to_valves(
        &self,
        channels: &[u8],
        target_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<PressureOutcome, OperationError>;

    /// Evacuate one valve for `duration_ms`, after priming it to
    /// `base_pressure_mb`, or all valves (255) without priming.
    async fn evacuate_valve_by_time(
        &self,
        channel: u8,
        duration_ms: u32,
        base_pressure_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError>;

    /// Evacuate a set of valves together for `|per_channel_seconds|` each
    /// (-7..=0), shortened by the batching factor.
    async fn evacuate_valves_by_time(
        &self,
        channels: &[u8],
        per_channel_seconds: f64,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError>;

    /// Measure the pressure of one valve.
    async fn current_pressure(&self, channel: u8) -> Result<i32, OperationError>;

    /// Pump and evacuate every valve so a pressure mapping can start.
    async fn prepare_for_pressure_mapping(
        &self,
        profile: MappingProfile,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError>;

    /// Whether the last preparation succeeded; clears the flag.
    fn take_mapping_prepared(&self) -> bool;

    /// Stop the in-flight operation, if any.
    async fn abort_current_operation(&self) -> Result<(), OperationError>;

    /// Close the link. Calling it again is harmless.
    async fn disconnect(&self) -> Result<(), OperationError>;

    /// Check that the device still answers, waiting at most `timeout`.
    async fn probe_liveness(&self, timeout: Duration) -> bool;
}

/// Connect to the simulator on `port`.
///
/// With `is_demo` the transport is never touched and a [`DemoSimulator`]
/// is returned.
pub async fn connect(
    transport: &dyn Transport,
    port: &str,
    setup_kind: SetupKind,
    is_demo: bool,
    is_debug: bool,
    config: &Config,
) -> Result<ControllerHandle, ConnectError> {
    if is_demo {
        return Ok(Arc::new(DemoSimulator::new(port)));
    }
    let controller = Controller::connect(transport, port, setup_kind, is_debug, config).await?;
    Ok(Arc::new(controller))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(150, 150 => true; "exact")]
    #[test_case(150, 147 => true; "at lower tolerance")]
    #[test_case(150, 153 => true; "at upper tolerance")]
    #[test_case(150, 146 => false; "below")]
    #[test_case(150, 160 => false; "above")]
    fn test_tolerance(target: i32, realized: i32) -> bool {
        PressureOutcome::new(target, realized).within_tolerance()
    }

    #[test]
    fn test_deviation_is_signed() {
        assert_eq!(PressureOutcome::new(100, 90).deviation_mb(), Some(-10));
    }
}
