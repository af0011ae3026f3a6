//! Control and discovery of multi-channel pneumatic simulators.
//!
//! A [`Registry`] finds simulators on serial ports and keeps the set of
//! connected ones. Each is driven through a [`Simulator`]: a hardware
//! [`controller::Controller`] or a [`controller::DemoSimulator`] when no
//! hardware is around.

pub mod config;
pub mod controller;
pub mod error;
pub mod registry;
pub mod simulator;
pub mod tracing;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use registry::{QuickConnectSpec, Registry};
pub use simulator::{ControllerHandle, PressureOutcome, SetupKind, Simulator};
