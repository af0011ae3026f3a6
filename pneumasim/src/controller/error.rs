//! Controller error types.

use super::OperationKind;
use crate::transport::{ErrorCode, LinkError};
use crate::types::ChannelError;
use std::time::Duration;
use thiserror::Error;

/// Why a connection attempt failed.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to open port: {0}")]
    Open(#[source] LinkError),

    #[error("port did not open within {0:?}")]
    OpenTimeout(Duration),

    #[error("device did not report a serial number")]
    NoIdentity,

    #[error("device not connected")]
    NotConnected,

    #[error("no serial number within {0:?}")]
    IdentityTimeout(Duration),

    #[error("identity query failed: {0}")]
    Identity(#[source] LinkError),

    #[error("calibration failed: {0}")]
    Calibration(#[source] LinkError),
}

/// Why a device operation failed.
#[derive(Error, Debug)]
pub enum OperationError {
    #[error("pressure {0} mb is out of range")]
    InvalidPressure(i32),

    #[error("evacuation time {0} is out of range")]
    InvalidEvacuationTime(String),

    #[error("evacuation base pressure {0} mb is out of range")]
    InvalidEvacuationBaseValue(i32),

    #[error("device is busy with another operation")]
    DeviceBusy,

    #[error("device not connected")]
    DeviceNotConnected,

    #[error("{kind} timed out after {after:?}")]
    OperationTimeout { kind: OperationKind, after: Duration },

    #[error("invalid channel argument: {0}")]
    ArgumentRange(#[from] ChannelError),

    #[error("operation aborted")]
    Aborted,

    #[error("device reported errors: {}", format_codes(.codes))]
    DeviceFault { codes: Vec<ErrorCode> },

    #[error("priming before evacuation failed: {0}")]
    Priming(#[source] Box<OperationError>),

    #[error("unhandled transport error: {0}")]
    Unhandled(#[source] LinkError),
}

fn format_codes(codes: &[ErrorCode]) -> String {
    codes
        .iter()
        .map(ErrorCode::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let fault = OperationError::DeviceFault {
            codes: vec![ErrorCode(7), ErrorCode(112)],
        };
        assert_eq!(fault.to_string(), "device reported errors: E007, E112");

        let timeout = OperationError::OperationTimeout {
            kind: OperationKind::QueryPressure,
            after: Duration::from_secs(5),
        };
        assert_eq!(timeout.to_string(), "QueryPressure timed out after 5s");

        let primed = OperationError::Priming(Box::new(OperationError::DeviceBusy));
        assert!(primed.to_string().contains("device is busy"));
    }
}
