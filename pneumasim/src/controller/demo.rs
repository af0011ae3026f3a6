//! Hardware-free simulator for exercising user interfaces.
//!
//! Accepts the same arguments as a real controller and rejects the same bad
//! ones, but every valid operation succeeds immediately. Pressures are
//! remembered so reads look plausible.

use super::{
    batch_evacuation_time, validate_evacuation, validate_pressure, DeviceState, MappingProfile,
    OperationError,
};
use crate::simulator::{OperationInfo, PressureOutcome, Simulator};
use crate::tracing::prelude::*;
use crate::types::{self, ChannelSet, ChannelTarget, Progress, ProgressSink, CHANNEL_COUNT};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct DemoState {
    connected: bool,
    pressures: [i32; CHANNEL_COUNT as usize],
    mapping_prepared: bool,
}

/// A simulator that only pretends.
#[derive(Debug)]
pub struct DemoSimulator {
    port: String,
    serial: String,
    state: Mutex<DemoState>,
}

impl DemoSimulator {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            serial: format!("DEMO-{}", port),
            state: Mutex::new(DemoState {
                connected: true,
                pressures: [0; CHANNEL_COUNT as usize],
                mapping_prepared: false,
            }),
        }
    }

    fn ensure_connected(&self) -> Result<(), OperationError> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(OperationError::DeviceNotConnected)
        }
    }

    fn set_pressure(&self, channels: impl Iterator<Item = u8>, mb: i32) {
        let mut state = self.state.lock();
        for channel in channels {
            if let Some(slot) = state.pressures.get_mut(usize::from(channel) - 1) {
                *slot = mb;
            }
        }
    }

    fn expand(target: ChannelTarget) -> ChannelSet {
        match target {
            ChannelTarget::All => ChannelSet::all(),
            ChannelTarget::Single(channel) => {
                ChannelSet::new(&[channel]).unwrap_or_else(|_| ChannelSet::all())
            }
        }
    }
}

#[async_trait]
impl Simulator for DemoSimulator {
    fn port_name(&self) -> &str {
        &self.port
    }

    fn device_id(&self) -> Option<String> {
        self.state.lock().connected.then(|| self.serial.clone())
    }

    fn state(&self) -> DeviceState {
        if self.state.lock().connected {
            DeviceState::Ready
        } else {
            DeviceState::Disconnected
        }
    }

    fn firmware_outdated(&self) -> bool {
        false
    }

    fn is_demo(&self) -> bool {
        true
    }

    fn current_operation(&self) -> Option<OperationInfo> {
        None
    }

    async fn apply_pressure(
        &self,
        channel: u8,
        target_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<PressureOutcome, OperationError> {
        validate_pressure(target_mb)?;
        let target = ChannelTarget::from_raw(channel)?;
        self.ensure_connected()?;
        debug!(port = %self.port, channel = %target, target_mb, "Demo pressurize");
        self.set_pressure(Self::expand(target).iter(), target_mb);
        types::report(progress, Progress::DONE);
        Ok(PressureOutcome::new(target_mb, target_mb))
    }

    async fn apply_pressure_to_valves(
        &self,
        channels: &[u8],
        target_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<PressureOutcome, OperationError> {
        validate_pressure(target_mb)?;
        let set = ChannelSet::new(channels)?;
        self.ensure_connected()?;
        self.set_pressure(set.iter(), target_mb);
        types::report(progress, Progress::DONE);
        Ok(PressureOutcome::new(target_mb, target_mb))
    }

    async fn evacuate_valve_by_time(
        &self,
        channel: u8,
        duration_ms: u32,
        base_pressure_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError> {
        let target = ChannelTarget::from_raw(channel)?;
        validate_evacuation(target, duration_ms, base_pressure_mb)?;
        self.ensure_connected()?;
        self.set_pressure(Self::expand(target).iter(), 0);
        types::report(progress, Progress::DONE);
        Ok(())
    }

    async fn evacuate_valves_by_time(
        &self,
        channels: &[u8],
        per_channel_seconds: f64,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError> {
        let set = ChannelSet::new(channels)?;
        batch_evacuation_time(&set, per_channel_seconds)?;
        self.ensure_connected()?;
        self.set_pressure(set.iter(), 0);
        types::report(progress, Progress::DONE);
        Ok(())
    }

    async fn current_pressure(&self, channel: u8) -> Result<i32, OperationError> {
        let ChannelTarget::Single(channel) = ChannelTarget::from_raw(channel)? else {
            return Err(types::ChannelError::OutOfRange(channel).into());
        };
        self.ensure_connected()?;
        Ok(self.state.lock().pressures[usize::from(channel) - 1])
    }

    async fn prepare_for_pressure_mapping(
        &self,
        profile: MappingProfile,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError> {
        self.ensure_connected()?;
        debug!(port = %self.port, profile = %profile, "Demo mapping preparation");
        self.set_pressure(ChannelSet::all().iter(), 0);
        self.state.lock().mapping_prepared = true;
        types::report(progress, Progress::DONE);
        Ok(())
    }

    fn take_mapping_prepared(&self) -> bool {
        std::mem::take(&mut self.state.lock().mapping_prepared)
    }

    async fn abort_current_operation(&self) -> Result<(), OperationError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), OperationError> {
        self.state.lock().connected = false;
        Ok(())
    }

    async fn probe_liveness(&self, _timeout: Duration) -> bool {
        self.state.lock().connected
    }
}
