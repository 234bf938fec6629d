//! USB device abstraction
//!
//! A claimed device exposing one interrupt-IN endpoint. The registry owns
//! these records; the backend only ever borrows them to start a read.

use protocol::{DeviceSpeed, DeviceSummary, SlotId};
use rusb::{Context, DeviceHandle};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identification of a physical device, used for logging and correlation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// Product string (if available)
    pub product: Option<String>,
    pub speed: DeviceSpeed,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// The interrupt-IN endpoint selected during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address (direction bit set)
    pub address: u8,
    /// Interface number
    pub interface: u8,
    /// Alternate setting of the interface
    pub setting: u8,
    /// bConfigurationValue of the configuration holding the interface
    pub config: u8,
    /// wMaxPacketSize, bounds the read buffer
    pub max_packet_size: u16,
    /// bInterval polling interval
    pub interval: u8,
}

impl EndpointInfo {
    /// Size of the receive buffer for one read
    pub fn buffer_len(&self) -> usize {
        usize::from(self.max_packet_size.max(1))
    }
}

/// A claimed device a read can be submitted against
pub trait InterruptDevice {
    fn info(&self) -> &DeviceInfo;

    fn endpoint(&self) -> &EndpointInfo;

    /// Release the interface claim and close the device.
    ///
    /// Called exactly once, after the device's read has retired.
    fn release(self)
    where
        Self: Sized;

    fn summary(&self, slot: SlotId, streaming: bool) -> DeviceSummary {
        let info = self.info();
        let endpoint = self.endpoint();
        DeviceSummary {
            slot: Some(slot),
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            bus_number: info.bus_number,
            device_address: info.device_address,
            interface: endpoint.interface,
            endpoint: endpoint.address,
            max_packet_size: endpoint.max_packet_size,
            product: info.product.clone(),
            speed: info.speed,
            streaming,
        }
    }
}

/// Opened, configured and claimed rusb device
pub struct HidDevice {
    info: DeviceInfo,
    endpoint: EndpointInfo,
    /// Shared with the reader thread while it is alive
    handle: Arc<DeviceHandle<Context>>,
    /// Whether discovery detached a kernel driver from the interface
    kernel_driver_detached: bool,
}

impl HidDevice {
    pub(crate) fn new(
        info: DeviceInfo,
        endpoint: EndpointInfo,
        handle: DeviceHandle<Context>,
        kernel_driver_detached: bool,
    ) -> Self {
        Self {
            info,
            endpoint,
            handle: Arc::new(handle),
            kernel_driver_detached,
        }
    }

    pub(crate) fn shared_handle(&self) -> Arc<DeviceHandle<Context>> {
        Arc::clone(&self.handle)
    }
}

impl InterruptDevice for HidDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn endpoint(&self) -> &EndpointInfo {
        &self.endpoint
    }

    fn release(self) {
        let HidDevice {
            info,
            endpoint,
            handle,
            kernel_driver_detached,
        } = self;

        let mut handle = match Arc::try_unwrap(handle) {
            Ok(handle) => handle,
            Err(_) => {
                // Last reference closes the device when the reader exits
                warn!(
                    "Device {} still referenced by its reader, deferring close",
                    info
                );
                return;
            }
        };

        if let Err(e) = handle.release_interface(endpoint.interface) {
            warn!(
                "Failed to release interface {} on {}: {} (status {})",
                endpoint.interface,
                info,
                e,
                crate::usb::usb_error_code(e)
            );
        }

        // Reattach kernel driver to restore device to kernel control
        if kernel_driver_detached {
            match handle.attach_kernel_driver(endpoint.interface) {
                Ok(()) => debug!(
                    "Reattached kernel driver to interface {} on {}",
                    endpoint.interface, info
                ),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {} on {}: {}",
                    endpoint.interface, info, e
                ),
            }
        }

        drop(handle);
        debug!("Closed device {}", info);
    }
}

/// Map rusb device speed to protocol DeviceSpeed
pub fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}
