//! Key-bridge events derived from mouse reports
//!
//! The key bridge remaps the three mouse buttons to three fixed keys and
//! reports all of them on every completed transfer, followed by a sync
//! marker, whether or not anything changed.

use crate::report::MouseReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical keys the mouse buttons are remapped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalKey {
    /// Driven by the left button
    L,
    /// Driven by the right button
    S,
    /// Driven by the middle button
    Enter,
}

impl LogicalKey {
    /// Linux input event code for this key
    pub fn code(&self) -> u16 {
        match self {
            LogicalKey::L => 38,
            LogicalKey::S => 31,
            LogicalKey::Enter => 28,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogicalKey::L => "KEY_L",
            LogicalKey::S => "KEY_S",
            LogicalKey::Enter => "KEY_ENTER",
        }
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One event handed to an input device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    Key { key: LogicalKey, pressed: bool },
    Sync,
}

impl InputEvent {
    /// Expand a report into the unconditional key-bridge sequence:
    /// left, right and middle key states followed by a sync marker.
    pub fn from_report(report: &MouseReport) -> [InputEvent; 4] {
        [
            InputEvent::Key {
                key: LogicalKey::L,
                pressed: report.buttons.left,
            },
            InputEvent::Key {
                key: LogicalKey::S,
                pressed: report.buttons.right,
            },
            InputEvent::Key {
                key: LogicalKey::Enter,
                pressed: report.buttons.middle,
            },
            InputEvent::Sync,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::decode;

    #[test]
    fn test_key_sequence_for_left_click() {
        let report = decode(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let events = InputEvent::from_report(&report);

        assert_eq!(
            events,
            [
                InputEvent::Key {
                    key: LogicalKey::L,
                    pressed: true
                },
                InputEvent::Key {
                    key: LogicalKey::S,
                    pressed: false
                },
                InputEvent::Key {
                    key: LogicalKey::Enter,
                    pressed: false
                },
                InputEvent::Sync,
            ]
        );
    }

    #[test]
    fn test_idle_report_still_syncs() {
        let events = InputEvent::from_report(&MouseReport::default());
        assert_eq!(events[3], InputEvent::Sync);
        assert!(events[..3].iter().all(|e| matches!(
            e,
            InputEvent::Key { pressed: false, .. }
        )));
    }

    #[test]
    fn test_key_codes() {
        assert_eq!(LogicalKey::L.code(), 38);
        assert_eq!(LogicalKey::S.code(), 31);
        assert_eq!(LogicalKey::Enter.code(), 28);
        assert_eq!(LogicalKey::Enter.to_string(), "KEY_ENTER");
    }
}
