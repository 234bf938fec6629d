//! Test utilities for hid-bridge
//!
//! Helpers for building device summaries and raw reports in tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_summary, encode_boot_mouse_report};
//!
//! let summary = create_mock_summary(0, 0x046d, 0xc077);
//! assert_eq!(summary.vendor_id, 0x046d);
//!
//! let raw = encode_boot_mouse_report(0x01, -2, 10, -10);
//! assert_eq!(raw, [0x01, 0x00, 0x00, 0xFE, 0x0A, 0x00, 0xF6, 0xFF]);
//! ```

use protocol::{DeviceSpeed, DeviceSummary, SlotId};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock summary for a claimed boot mouse
pub fn create_mock_summary(slot: usize, vendor_id: u16, product_id: u16) -> DeviceSummary {
    DeviceSummary {
        slot: Some(SlotId(slot)),
        vendor_id,
        product_id,
        bus_number: 1,
        device_address: (slot % 127) as u8 + 1,
        interface: 0,
        endpoint: 0x81,
        max_packet_size: 8,
        product: Some(format!("Test Mouse {}", slot)),
        speed: DeviceSpeed::Low,
        streaming: false,
    }
}

/// Build an 8-byte boot-mouse report from its fields
pub fn encode_boot_mouse_report(buttons: u8, scroll: i8, dx: i16, dy: i16) -> [u8; 8] {
    let dx = dx.to_le_bytes();
    let dy = dy.to_le_bytes();
    [
        buttons,
        0x00,
        0x00,
        scroll as u8,
        dx[0],
        dx[1],
        dy[0],
        dy[1],
    ]
}

/// Run a future with a timeout
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
