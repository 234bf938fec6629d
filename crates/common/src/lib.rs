//! Common utilities for hid-bridge
//!
//! This crate provides shared functionality for the bridge binary and its
//! tests: error handling, logging setup and the channel bridge between the
//! Tokio runtime and the USB worker thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{BridgeEvent, ControlBridge, ControlCommand, ControlWorker, create_control_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
