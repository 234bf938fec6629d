//! USB subsystem
//!
//! Finds boot-protocol mice, keeps one interrupt read in flight per device
//! and turns completed reads into decoded reports.
//!
//! - `discovery`: enumeration, filtering, open/configure/claim
//! - `backend`: the asynchronous I/O seam ([`UsbBackend`])
//! - `reader`: the rusb implementation of that seam
//! - `transfers`: the per-device completion state machine
//! - `registry`: slot arena owning claimed devices and their buffers

pub mod backend;
pub mod device;
pub mod discovery;
pub mod reader;
pub mod registry;
pub mod transfers;

pub use backend::{Completion, TransferError, TransferStatus, UsbBackend, usb_error_code};
pub use device::{DeviceInfo, EndpointInfo, HidDevice, InterruptDevice};
pub use discovery::{Candidate, DiscoveryError, discover, scan};
pub use reader::ReaderBackend;
pub use registry::{DeviceRegistry, SlotStats};
pub use transfers::{Effect, EnginePolicy, RetireReason, StreamState};
