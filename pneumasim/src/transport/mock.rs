//! Scripted in-memory transport for tests.

use super::{
    ErrorCode, Link, LinkError, LinkSettings, PollState, PortDescriptor, PortEnumerator,
    PressureMaxima, RegulationParams, Transport,
};
use crate::types::{ChannelSet, ChannelTarget};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// How a simulated device responds.
#[derive(Debug, Clone)]
pub(crate) struct Behavior {
    pub serial: String,
    pub firmware: String,
    pub maxima: PressureMaxima,
    /// Polls until a set-pressure command completes; None never completes
    pub set_polls: Option<u32>,
    /// Pressure reported on completion; None reports the target
    pub realized_mb: Option<i32>,
    pub evacuate_polls: Option<u32>,
    pub measure_polls: Option<u32>,
    pub measured_mb: i32,
    /// Any poll after this many returns NotConnected
    pub lose_link_after: Option<u32>,
    /// Polls fail with a protocol error and these queued codes
    pub fault_codes: Vec<ErrorCode>,
    /// Inflate/evacuate polls never return
    pub hang_polls: bool,
    /// Serial-number queries never return
    pub hang_identity: bool,
    /// Delay before `open` succeeds
    pub open_delay: Duration,
    /// `open` never returns
    pub hang_open: bool,
    /// Time the device takes to acknowledge a cancel
    pub cancel_delay: Duration,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            serial: "SIM-0001".to_string(),
            firmware: crate::controller::calibration::EXPECTED_FIRMWARE_VERSION.to_string(),
            maxima: crate::controller::calibration::DEFAULT_PRESSURE_MAXIMA,
            set_polls: Some(3),
            realized_mb: None,
            evacuate_polls: Some(3),
            measure_polls: Some(1),
            measured_mb: 42,
            lose_link_after: None,
            fault_codes: Vec::new(),
            hang_polls: false,
            hang_identity: false,
            open_delay: Duration::ZERO,
            hang_open: false,
            cancel_delay: Duration::ZERO,
        }
    }
}

/// Calls observed by a simulated device.
#[derive(Debug, Default, Clone)]
pub(crate) struct CallLog {
    pub opens: u32,
    pub closes: u32,
    pub identity_queries: u32,
    pub set_starts: Vec<(String, u8)>,
    pub evacuate_starts: Vec<(String, Duration)>,
    pub measure_starts: Vec<u8>,
    pub polls: u32,
    pub cancels: u32,
    pub maxima_writes: u32,
    pub regulation_writes: u32,
}

#[derive(Debug)]
struct DeviceSim {
    behavior: Behavior,
    log: CallLog,
    present: bool,
    active_polls: u32,
    target_mb: i32,
    queued: VecDeque<ErrorCode>,
}

/// Handle on one simulated device, shared by the test and its links.
#[derive(Debug, Clone)]
pub(crate) struct MockDevice(Arc<Mutex<DeviceSim>>);

impl MockDevice {
    pub(crate) fn new(behavior: Behavior) -> Self {
        Self(Arc::new(Mutex::new(DeviceSim {
            behavior,
            log: CallLog::default(),
            present: true,
            active_polls: 0,
            target_mb: 0,
            queued: VecDeque::new(),
        })))
    }

    pub(crate) fn log(&self) -> CallLog {
        self.0.lock().log.clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.0.lock().behavior);
    }

    /// Simulate unplugging the device.
    pub(crate) fn unplug(&self) {
        self.0.lock().present = false;
    }

    fn behavior(&self) -> Behavior {
        self.0.lock().behavior.clone()
    }
}

/// Transport serving a fixed set of simulated ports.
#[derive(Debug, Default, Clone)]
pub(crate) struct MockTransport {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, port: &str, behavior: Behavior) -> MockDevice {
        let device = MockDevice::new(behavior);
        self.devices.lock().insert(port.to_string(), device.clone());
        device
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, port: &str, settings: &LinkSettings) -> Result<Box<dyn Link>, LinkError> {
        assert_eq!(*settings, LinkSettings::default());
        let device = self.devices.lock().get(port).cloned();
        let Some(device) = device else {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such port {}", port),
            )));
        };
        let behavior = device.behavior();
        if behavior.hang_open {
            std::future::pending::<()>().await;
        }
        if !behavior.open_delay.is_zero() {
            tokio::time::sleep(behavior.open_delay).await;
        }
        device.0.lock().log.opens += 1;
        Ok(Box::new(MockLink { device, open: true }))
    }
}

struct MockLink {
    device: MockDevice,
    open: bool,
}

impl MockLink {
    fn sim(&self) -> Result<parking_lot::MutexGuard<'_, DeviceSim>, LinkError> {
        let sim = self.device.0.lock();
        if !self.open || !sim.present {
            return Err(LinkError::NotConnected);
        }
        Ok(sim)
    }

    fn start(&mut self, target_mb: i32) -> Result<(), LinkError> {
        let mut sim = self.sim()?;
        sim.active_polls = 0;
        sim.target_mb = target_mb;
        Ok(())
    }

    /// Count a poll and decide whether the active command finished.
    fn step(&mut self, needed: impl Fn(&Behavior) -> Option<u32>) -> Result<bool, LinkError> {
        let mut sim = self.sim()?;
        sim.log.polls += 1;
        sim.active_polls += 1;
        if let Some(limit) = sim.behavior.lose_link_after {
            if sim.log.polls > limit {
                sim.present = false;
                return Err(LinkError::NotConnected);
            }
        }
        if !sim.behavior.fault_codes.is_empty() {
            let codes = sim.behavior.fault_codes.clone();
            sim.queued.extend(codes);
            return Err(LinkError::Protocol("command rejected".to_string()));
        }
        Ok(needed(&sim.behavior).is_some_and(|n| sim.active_polls >= n))
    }
}

#[async_trait]
impl Link for MockLink {
    async fn query_serial_number(&mut self, _timeout: Duration) -> Result<String, LinkError> {
        let hang = {
            let mut sim = self.sim()?;
            sim.log.identity_queries += 1;
            sim.behavior.hang_identity
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(self.sim()?.behavior.serial.clone())
    }

    async fn start_set_pressure(
        &mut self,
        target: ChannelTarget,
        target_mb: u8,
    ) -> Result<(), LinkError> {
        self.start(i32::from(target_mb))?;
        self.sim()?.log.set_starts.push((target.to_string(), target_mb));
        Ok(())
    }

    async fn start_set_pressure_multi(
        &mut self,
        channels: &ChannelSet,
        target_mb: u8,
    ) -> Result<(), LinkError> {
        self.start(i32::from(target_mb))?;
        self.sim()?.log.set_starts.push((channels.to_string(), target_mb));
        Ok(())
    }

    async fn poll_set_pressure(&mut self) -> Result<PollState, LinkError> {
        let done = self.step(|b| b.set_polls)?;
        let sim = self.sim()?;
        let current_mb = if done {
            sim.behavior.realized_mb.unwrap_or(sim.target_mb)
        } else {
            sim.target_mb * sim.active_polls.min(10) as i32 / 10
        };
        Ok(PollState { done, current_mb })
    }

    async fn start_inflate_evacuate(
        &mut self,
        target: ChannelTarget,
        _speed: u8,
        duration: Duration,
        _inflate: bool,
    ) -> Result<(), LinkError> {
        self.start(0)?;
        self.sim()?.log.evacuate_starts.push((target.to_string(), duration));
        Ok(())
    }

    async fn start_inflate_evacuate_multi(
        &mut self,
        channels: &ChannelSet,
        _speed: u8,
        duration: Duration,
        _inflate: bool,
    ) -> Result<(), LinkError> {
        self.start(0)?;
        self.sim()?.log.evacuate_starts.push((channels.to_string(), duration));
        Ok(())
    }

    async fn poll_inflate_evacuate(&mut self) -> Result<bool, LinkError> {
        if self.sim()?.behavior.hang_polls {
            std::future::pending::<()>().await;
        }
        self.step(|b| b.evacuate_polls)
    }

    async fn start_measure_pressure(&mut self, channel: u8) -> Result<(), LinkError> {
        self.start(0)?;
        self.sim()?.log.measure_starts.push(channel);
        Ok(())
    }

    async fn poll_measure_pressure(&mut self) -> Result<PollState, LinkError> {
        let done = self.step(|b| b.measure_polls)?;
        let current_mb = self.sim()?.behavior.measured_mb;
        Ok(PollState { done, current_mb })
    }

    async fn cancel_active_command(&mut self) -> Result<(), LinkError> {
        let delay = self.sim()?.behavior.cancel_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.sim()?.log.cancels += 1;
        Ok(())
    }

    async fn pop_next_error(&mut self) -> Option<ErrorCode> {
        self.device.0.lock().queued.pop_front()
    }

    async fn pressure_maxima(&mut self) -> Result<PressureMaxima, LinkError> {
        Ok(self.sim()?.behavior.maxima)
    }

    async fn set_pressure_maxima(&mut self, maxima: &PressureMaxima) -> Result<(), LinkError> {
        let mut sim = self.sim()?;
        sim.behavior.maxima = *maxima;
        sim.log.maxima_writes += 1;
        Ok(())
    }

    async fn set_regulation(&mut self, _params: &RegulationParams) -> Result<(), LinkError> {
        self.sim()?.log.regulation_writes += 1;
        Ok(())
    }

    async fn firmware_version(&mut self) -> Result<String, LinkError> {
        Ok(self.sim()?.behavior.firmware.clone())
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.device.0.lock().log.closes += 1;
        }
    }
}

/// Port listing fixed by the test.
#[derive(Debug, Default, Clone)]
pub(crate) struct MockPorts(Arc<Mutex<Vec<PortDescriptor>>>);

impl MockPorts {
    pub(crate) fn new(ports: Vec<PortDescriptor>) -> Self {
        Self(Arc::new(Mutex::new(ports)))
    }

    pub(crate) fn set(&self, ports: Vec<PortDescriptor>) {
        *self.0.lock() = ports;
    }
}

impl PortEnumerator for MockPorts {
    fn ports(&self) -> Result<Vec<PortDescriptor>, LinkError> {
        Ok(self.0.lock().clone())
    }
}
