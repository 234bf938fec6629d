//! Device identifiers and summaries
//!
//! These types cross the boundary between the USB worker thread and the
//! async side of the bridge, so they are plain data and serializable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable index of a device in the registry
///
/// Assigned once at discovery and never reused for another device, even
/// after the device at that slot has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
    Unknown,
}

/// Summary of a matched interface, used for listing and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Registry slot, if the device has been claimed
    pub slot: Option<SlotId>,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// Interface number carrying the interrupt-IN endpoint
    pub interface: u8,
    /// Endpoint address (direction bit set)
    pub endpoint: u8,
    /// wMaxPacketSize of the endpoint
    pub max_packet_size: u16,
    /// Product string (if available)
    pub product: Option<String>,
    pub speed: DeviceSpeed,
    /// Whether a read is currently outstanding
    pub streaming: bool,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} bus {:03} addr {:03} if {} ep {:#04x} maxp {}",
            self.vendor_id,
            self.product_id,
            self.bus_number,
            self.device_address,
            self.interface,
            self.endpoint,
            self.max_packet_size
        )
    }
}
