//! Physical transport boundary for simulator connections.
//!
//! The byte-level protocol, framing and checksums belong to the vendor
//! driver. This module only describes what the controller needs from it:
//! a [`Transport`] that opens a [`Link`] to one port, and a [`Link`] that
//! issues and polls device commands. Links are single-owner; nothing here
//! assumes the driver is safe to use from two tasks on the same handle.
//!
//! Port enumeration lives in [`ports`].

pub mod ports;

#[cfg(test)]
pub(crate) mod mock;

use crate::types::{ChannelSet, ChannelTarget, CHANNEL_COUNT};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_serial::{DataBits, Parity, StopBits};

pub use ports::{PortDescriptor, PortEnumerator, PortKind, SystemPorts};

/// Baud rate of the only supported serial profile.
pub const BAUD_RATE: u32 = 57_600;

/// Errors reported by the vendor transport.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The device is not (or no longer) reachable over this link.
    #[error("device not connected")]
    NotConnected,

    /// The driver gave up waiting for a reply.
    #[error("transport timed out")]
    Timeout,

    /// The device answered with something the driver could not use.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// Serial line settings passed to [`Transport::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

impl Default for LinkSettings {
    /// 57600 8N1, the only profile simulators speak.
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
        }
    }
}

/// Snapshot returned while a pressure command is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollState {
    pub done: bool,
    pub current_mb: i32,
}

/// Error code queued by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u16);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:03}", self.0)
    }
}

/// Per-valve pressure ceilings stored in the device, in millibar.
pub type PressureMaxima = [u8; CHANNEL_COUNT as usize];

/// Parameters of the device's pressure regulation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegulationParams {
    /// Proportional gain, in device units.
    pub gain: u8,
    /// Acceptable deviation before the regulator reacts, in millibar.
    pub hysteresis_mb: u8,
    /// Pump ramp limit, in millibar per second.
    pub ramp_mb_per_s: u8,
}

/// Opens links to simulators.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the serial link on `port`.
    async fn open(&self, port: &str, settings: &LinkSettings) -> Result<Box<dyn Link>, LinkError>;
}

/// An open session with one simulator.
///
/// Every call may fail with [`LinkError::NotConnected`] once the device is
/// gone.
#[async_trait]
pub trait Link: Send {
    /// Read the device serial number, waiting at most `timeout`.
    async fn query_serial_number(&mut self, timeout: Duration) -> Result<String, LinkError>;

    /// Begin driving `target` towards `target_mb`.
    async fn start_set_pressure(
        &mut self,
        target: ChannelTarget,
        target_mb: u8,
    ) -> Result<(), LinkError>;

    /// Begin driving every valve in `channels` towards `target_mb`.
    async fn start_set_pressure_multi(
        &mut self,
        channels: &ChannelSet,
        target_mb: u8,
    ) -> Result<(), LinkError>;

    async fn poll_set_pressure(&mut self) -> Result<PollState, LinkError>;

    /// Begin a timed inflate (`inflate == true`) or evacuate.
    async fn start_inflate_evacuate(
        &mut self,
        target: ChannelTarget,
        speed: u8,
        duration: Duration,
        inflate: bool,
    ) -> Result<(), LinkError>;

    /// Like [`Link::start_inflate_evacuate`] for an explicit set of valves.
    async fn start_inflate_evacuate_multi(
        &mut self,
        channels: &ChannelSet,
        speed: u8,
        duration: Duration,
        inflate: bool,
    ) -> Result<(), LinkError>;

    /// Returns true once the timed command has finished.
    async fn poll_inflate_evacuate(&mut self) -> Result<bool, LinkError>;

    /// Begin a pressure measurement on one valve.
    async fn start_measure_pressure(&mut self, channel: u8) -> Result<(), LinkError>;

    async fn poll_measure_pressure(&mut self) -> Result<PollState, LinkError>;

    /// Cancel whatever asynchronous command is running.
    async fn cancel_active_command(&mut self) -> Result<(), LinkError>;

    /// Pop the oldest queued device error, if any.
    async fn pop_next_error(&mut self) -> Option<ErrorCode>;

    async fn pressure_maxima(&mut self) -> Result<PressureMaxima, LinkError>;

    async fn set_pressure_maxima(&mut self, maxima: &PressureMaxima) -> Result<(), LinkError>;

    async fn set_regulation(&mut self, params: &RegulationParams) -> Result<(), LinkError>;

    async fn firmware_version(&mut self) -> Result<String, LinkError>;

    /// Close the session. Further calls fail with `NotConnected`.
    async fn close(&mut self);
}

/// Transport for builds that link no vendor driver. Every open fails, so
/// only demo simulators can be used.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDriver;

#[async_trait]
impl Transport for NoDriver {
    async fn open(&self, port: &str, _settings: &LinkSettings) -> Result<Box<dyn Link>, LinkError> {
        Err(LinkError::Protocol(format!("no vendor driver to open {}", port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_8n1() {
        let settings = LinkSettings::default();
        assert_eq!(settings.baud_rate, 57_600);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.stop_bits, StopBits::One);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode(7).to_string(), "E007");
        assert_eq!(ErrorCode(1234).to_string(), "E1234");
    }

    #[tokio::test]
    async fn test_no_driver_refuses() {
        let result = NoDriver.open("COM3", &LinkSettings::default()).await;
        assert!(matches!(result, Err(LinkError::Protocol(_))));
    }
}
