//! Interface matching criteria used during discovery

use serde::{Deserialize, Serialize};

/// USB interface class code for HID
pub const HID_CLASS: u8 = 0x03;
/// HID interface subclass for boot-protocol devices
pub const HID_SUBCLASS_BOOT: u8 = 0x01;
/// HID boot interface protocol: keyboard
pub const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
/// HID boot interface protocol: mouse
pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

/// Class/subclass/protocol triple an interface must match
///
/// `subclass` is optional: many mice only advertise the boot subclass on
/// one of their interfaces, and matching on class + protocol alone finds
/// them as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceFilter {
    pub class: u8,
    pub subclass: Option<u8>,
    pub protocol: u8,
}

impl InterfaceFilter {
    /// HID boot-protocol mouse
    pub const fn boot_mouse() -> Self {
        Self {
            class: HID_CLASS,
            subclass: Some(HID_SUBCLASS_BOOT),
            protocol: HID_PROTOCOL_MOUSE,
        }
    }

    pub fn matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        class == self.class
            && protocol == self.protocol
            && self.subclass.is_none_or(|s| s == subclass)
    }
}

impl Default for InterfaceFilter {
    fn default() -> Self {
        Self::boot_mouse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_mouse_matches() {
        let filter = InterfaceFilter::boot_mouse();
        assert!(filter.matches(3, 1, 2));
        assert!(!filter.matches(3, 1, 1)); // keyboard
        assert!(!filter.matches(3, 0, 2)); // non-boot subclass
        assert!(!filter.matches(8, 1, 2)); // mass storage
    }

    #[test]
    fn test_any_subclass() {
        let filter = InterfaceFilter {
            subclass: None,
            ..InterfaceFilter::boot_mouse()
        };
        assert!(filter.matches(3, 0, 2));
        assert!(filter.matches(3, 1, 2));
    }
}
