//! Common error types for pneumasim.
//!
//! Each layer owns a typed error: [`LinkError`] for the transport boundary,
//! [`ConnectError`] for handshakes and [`OperationError`] for device
//! operations. The crate-level [`Error`] unifies them for callers that do
//! not care which layer failed.

use thiserror::Error;

pub use crate::controller::{ConnectError, OperationError};
pub use crate::transport::LinkError;

/// Main error type for pneumasim operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport link errors
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Connection handshake errors
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Device operation errors
    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
