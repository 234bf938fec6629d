//! Event sinks
//!
//! A sink receives every decoded report, in completion order, on the
//! dispatch thread. Sinks must not block for long; they run between
//! completions of every device.

use crate::usb::DeviceInfo;
use protocol::{InputEvent, LogicalKey, MouseReport};
use serde::Serialize;
use std::io::Write;
use tracing::warn;

/// Consumer of decoded reports
pub trait EventSink {
    fn emit(&mut self, device: &DeviceInfo, report: &MouseReport);
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn emit(&mut self, device: &DeviceInfo, report: &MouseReport) {
        (**self).emit(device, report)
    }
}

/// Human-readable one-line-per-report output
pub struct TextSink<W: Write> {
    out: W,
    activity_only: bool,
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W, activity_only: bool) -> Self {
        Self { out, activity_only }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn flag(pressed: bool) -> u8 {
    u8::from(pressed)
}

impl<W: Write> EventSink for TextSink<W> {
    fn emit(&mut self, device: &DeviceInfo, report: &MouseReport) {
        if self.activity_only && !report.has_activity() {
            return;
        }

        let result = writeln!(
            self.out,
            "[{}] Buttons: L={} R={} M={} | Movement: X={} Y={} | Scroll={}",
            device,
            flag(report.buttons.left),
            flag(report.buttons.right),
            flag(report.buttons.middle),
            report.dx,
            report.dy,
            report.scroll
        )
        .and_then(|_| self.out.flush());

        if let Err(e) = result {
            warn!("Failed to write report from {}: {}", device, e);
        }
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    vendor_id: u16,
    product_id: u16,
    bus: u8,
    address: u8,
    #[serde(flatten)]
    report: &'a MouseReport,
}

/// One JSON object per report
pub struct JsonSink<W: Write> {
    out: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EventSink for JsonSink<W> {
    fn emit(&mut self, device: &DeviceInfo, report: &MouseReport) {
        let line = JsonLine {
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            bus: device.bus_number,
            address: device.device_address,
            report,
        };

        let result = serde_json::to_writer(&mut self.out, &line)
            .map_err(std::io::Error::from)
            .and_then(|_| writeln!(self.out))
            .and_then(|_| self.out.flush());

        if let Err(e) = result {
            warn!("Failed to write report from {}: {}", device, e);
        }
    }
}

/// Logical input device the key bridge reports to
pub trait InputDevice {
    fn report_key(&mut self, key: LogicalKey, pressed: bool);
    fn sync(&mut self);
}

/// Prints input events in `evtest` notation
pub struct StdoutInput<W: Write> {
    out: W,
}

impl<W: Write> StdoutInput<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> InputDevice for StdoutInput<W> {
    fn report_key(&mut self, key: LogicalKey, pressed: bool) {
        if let Err(e) = writeln!(
            self.out,
            "EV_KEY {} ({}) {}",
            key,
            key.code(),
            flag(pressed)
        ) {
            warn!("Failed to write key event: {}", e);
        }
    }

    fn sync(&mut self) {
        let result = writeln!(self.out, "EV_SYN SYN_REPORT 0").and_then(|_| self.out.flush());
        if let Err(e) = result {
            warn!("Failed to write sync event: {}", e);
        }
    }
}

/// Maps the three buttons to three keys.
///
/// Every report produces all three key states and a sync, changed or not.
pub struct KeyBridgeSink<D: InputDevice> {
    input: D,
}

impl<D: InputDevice> KeyBridgeSink<D> {
    pub fn new(input: D) -> Self {
        Self { input }
    }

    pub fn into_inner(self) -> D {
        self.input
    }
}

impl<D: InputDevice> EventSink for KeyBridgeSink<D> {
    fn emit(&mut self, _device: &DeviceInfo, report: &MouseReport) {
        for event in InputEvent::from_report(report) {
            match event {
                InputEvent::Key { key, pressed } => self.input.report_key(key, pressed),
                InputEvent::Sync => self.input.sync(),
            }
        }
    }
}
