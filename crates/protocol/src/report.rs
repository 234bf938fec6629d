//! HID boot-mouse report decoding
//!
//! Layout (8 bytes):
//! ```text
//! Byte 0:    Button bitfield
//!            Bit 0 = Left, Bit 1 = Right, Bit 2 = Middle
//! Byte 1-2:  Reserved
//! Byte 3:    Scroll wheel (signed)
//! Byte 4-5:  X displacement (signed, little-endian)
//! Byte 6-7:  Y displacement (signed, little-endian)
//! ```
//!
//! Bits and bytes outside of these fields are ignored, never validated.

use crate::error::{DecodeError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Fixed length of a boot-mouse report in bytes
pub const BOOT_MOUSE_REPORT_LEN: usize = 8;

const BUTTON_LEFT: u8 = 0x01;
const BUTTON_RIGHT: u8 = 0x02;
const BUTTON_MIDDLE: u8 = 0x04;

/// Button state carried in byte 0 of the report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buttons {
    pub left: bool,
    pub right: bool,
    pub middle: bool,
}

impl Buttons {
    /// Extract the three button bits, ignoring the remaining five
    pub fn from_bits(bits: u8) -> Self {
        Self {
            left: bits & BUTTON_LEFT != 0,
            right: bits & BUTTON_RIGHT != 0,
            middle: bits & BUTTON_MIDDLE != 0,
        }
    }

    pub fn any(&self) -> bool {
        self.left || self.right || self.middle
    }
}

/// Decoded boot-mouse report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseReport {
    pub buttons: Buttons,
    /// Scroll wheel delta
    pub scroll: i8,
    /// Relative X movement
    pub dx: i16,
    /// Relative Y movement
    pub dy: i16,
}

impl MouseReport {
    /// Returns `true` when a button is held or there is any movement.
    pub fn has_activity(&self) -> bool {
        self.buttons.any() || self.scroll != 0 || self.dx != 0 || self.dy != 0
    }
}

/// Decode a report from fixed offsets.
///
/// Total over any input: bytes missing from a short buffer read as zero and
/// bytes past the fixed length are ignored.
pub fn decode(raw: &[u8]) -> MouseReport {
    let mut bytes = [0u8; BOOT_MOUSE_REPORT_LEN];
    let present = raw.len().min(BOOT_MOUSE_REPORT_LEN);
    bytes[..present].copy_from_slice(&raw[..present]);

    MouseReport {
        buttons: Buttons::from_bits(bytes[0]),
        scroll: bytes[3] as i8,
        dx: LittleEndian::read_i16(&bytes[4..6]),
        dy: LittleEndian::read_i16(&bytes[6..8]),
    }
}

/// How payloads shorter than [`BOOT_MOUSE_REPORT_LEN`] are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Decode whatever bytes are present. Empty payloads produce no report.
    #[default]
    Lenient,
    /// Reject anything shorter than a full report.
    Strict,
}

impl DecodePolicy {
    /// Decode a completed payload under this policy
    pub fn decode(&self, payload: &[u8]) -> Result<MouseReport> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }

        if *self == DecodePolicy::Strict && payload.len() < BOOT_MOUSE_REPORT_LEN {
            return Err(DecodeError::Short {
                expected: BOOT_MOUSE_REPORT_LEN,
                actual: payload.len(),
            });
        }

        Ok(decode(payload))
    }
}
