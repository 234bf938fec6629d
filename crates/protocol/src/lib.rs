//! Report and device types for hid-bridge
//!
//! This crate holds the pure data side of the bridge: the boot-mouse report
//! layout and its decoder, the events derived from decoded reports, the
//! interface filter used during discovery and the identifiers shared by the
//! worker thread and its controllers. Nothing in here performs I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{DecodePolicy, decode};
//!
//! let report = decode(&[0x01, 0x00, 0x00, 0xFE, 0x0A, 0x00, 0xF6, 0xFF]);
//! assert!(report.buttons.left);
//! assert_eq!(report.scroll, -2);
//! assert_eq!(report.dx, 10);
//! assert_eq!(report.dy, -10);
//!
//! // Strict decoding rejects truncated payloads
//! assert!(DecodePolicy::Strict.decode(&[0x01, 0x02]).is_err());
//! ```

pub mod error;
pub mod events;
pub mod filter;
pub mod report;
pub mod types;

pub use error::{DecodeError, Result};
pub use events::{InputEvent, LogicalKey};
pub use filter::{
    HID_CLASS, HID_PROTOCOL_KEYBOARD, HID_PROTOCOL_MOUSE, HID_SUBCLASS_BOOT, InterfaceFilter,
};
pub use report::{BOOT_MOUSE_REPORT_LEN, Buttons, DecodePolicy, MouseReport, decode};
pub use types::{DeviceSpeed, DeviceSummary, SlotId};
