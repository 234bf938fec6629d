//! Test utilities for the bridge
//!
//! [`ScriptedBackend`] stands in for libusb: reads stay in flight until a
//! test completes them through the [`ScriptHandle`], cancels are queued and
//! delivered on the next dispatch, and every submit, cancel and release is
//! recorded. Devices created with [`ScriptHandle::mouse`] report a violation
//! if they are released while the backend still holds one of their reads.
//!
//! # Example
//!
//! ```
//! use bridge::lifecycle::Controller;
//! use bridge::test_utils::{RecordingSink, ScriptedBackend};
//! use bridge::usb::EnginePolicy;
//! use std::time::Duration;
//!
//! let (backend, script) = ScriptedBackend::new();
//! let devices = vec![script.mouse(0xc077)];
//! let mut controller =
//!     Controller::new(backend, devices, RecordingSink::default(), EnginePolicy::default());
//!
//! controller.start().unwrap();
//! script.complete(protocol::SlotId(0), &[0x01, 0, 0, 0, 0, 0, 0, 0]);
//! controller.dispatch(Duration::from_millis(1)).unwrap();
//! assert_eq!(controller.sink().reports.len(), 1);
//! ```

use crate::sink::{EventSink, InputDevice};
use crate::usb::{
    Completion, DeviceInfo, EndpointInfo, InterruptDevice, TransferError, TransferStatus,
    UsbBackend,
};
use protocol::{DeviceSpeed, InputEvent, LogicalKey, MouseReport, SlotId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct Inflight {
    product_id: u16,
    /// `None` once a completion has been scripted for the read
    buffer: Option<Vec<u8>>,
}

#[derive(Default)]
struct ScriptState {
    inflight: HashMap<SlotId, Inflight>,
    queued: VecDeque<Completion>,
    submits: Vec<SlotId>,
    cancels: Vec<SlotId>,
    forgotten: Vec<SlotId>,
    released: Vec<u16>,
    violations: Vec<String>,
    failing_submits: HashMap<SlotId, rusb::Error>,
    dispatch_failure: Option<TransferError>,
    ignore_cancels: bool,
}

fn lock(state: &Arc<Mutex<ScriptState>>) -> MutexGuard<'_, ScriptState> {
    state.lock().expect("script state poisoned")
}

/// In-memory [`UsbBackend`]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBackend {
    pub fn new() -> (Self, ScriptHandle) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            ScriptHandle { state },
        )
    }
}

impl UsbBackend for ScriptedBackend {
    type Device = MockDevice;

    fn submit(
        &mut self,
        slot: SlotId,
        device: &MockDevice,
        buffer: Vec<u8>,
    ) -> Result<(), TransferError> {
        let mut state = lock(&self.state);

        if let Some(err) = state.failing_submits.get(&slot) {
            return Err(TransferError::Usb(*err));
        }

        if state.inflight.contains_key(&slot) {
            state
                .violations
                .push(format!("second read submitted on slot {}", slot));
            return Err(TransferError::Busy(slot));
        }

        state.submits.push(slot);
        state.inflight.insert(
            slot,
            Inflight {
                product_id: device.info.product_id,
                buffer: Some(buffer),
            },
        );
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) -> Result<(), TransferError> {
        let mut state = lock(&self.state);
        state.cancels.push(slot);

        if state.ignore_cancels {
            return Ok(());
        }

        let buffer = state
            .inflight
            .get_mut(&slot)
            .and_then(|inflight| inflight.buffer.take());

        match buffer {
            Some(buffer) => {
                state.queued.push_back(Completion {
                    slot,
                    status: TransferStatus::Cancelled,
                    buffer,
                    actual_length: 0,
                });
                Ok(())
            }
            // Already completed or never submitted
            None => Err(TransferError::Usb(rusb::Error::NotFound)),
        }
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion),
    ) -> Result<(), TransferError> {
        let ready: Vec<Completion> = {
            let mut state = lock(&self.state);
            if let Some(err) = state.dispatch_failure.take() {
                return Err(err);
            }
            let ready: Vec<Completion> = state.queued.drain(..).collect();
            for completion in &ready {
                state.inflight.remove(&completion.slot);
            }
            ready
        };

        if ready.is_empty() {
            std::thread::sleep(timeout);
        }

        for completion in ready {
            on_complete(completion);
        }
        Ok(())
    }

    fn forget(&mut self, slot: SlotId) {
        let mut state = lock(&self.state);
        state.forgotten.push(slot);
        // A forgotten read can no longer touch the device
        state.inflight.remove(&slot);
        state.queued.retain(|completion| completion.slot != slot);
    }
}

/// Test-side control of a [`ScriptedBackend`]
#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptHandle {
    /// A boot mouse with an 8-byte endpoint, tied to this script
    pub fn mouse(&self, product_id: u16) -> MockDevice {
        MockDevice {
            script: Some(Arc::clone(&self.state)),
            ..MockDevice::mouse(product_id)
        }
    }

    /// Complete the slot's read with `payload`.
    ///
    /// Returns `false` if the slot has no read waiting for a result.
    pub fn complete(&self, slot: SlotId, payload: &[u8]) -> bool {
        let mut state = lock(&self.state);
        let Some(mut buffer) = state
            .inflight
            .get_mut(&slot)
            .and_then(|inflight| inflight.buffer.take())
        else {
            return false;
        };

        let len = payload.len().min(buffer.len());
        buffer[..len].copy_from_slice(&payload[..len]);
        state.queued.push_back(Completion {
            slot,
            status: TransferStatus::Completed,
            buffer,
            actual_length: len,
        });
        true
    }

    /// Retire the slot's read with a non-success status
    pub fn fail(&self, slot: SlotId, status: TransferStatus) -> bool {
        let mut state = lock(&self.state);
        let Some(buffer) = state
            .inflight
            .get_mut(&slot)
            .and_then(|inflight| inflight.buffer.take())
        else {
            return false;
        };

        state.queued.push_back(Completion {
            slot,
            status,
            buffer,
            actual_length: 0,
        });
        true
    }

    /// Make every submit on `slot` fail with `err`
    pub fn fail_submits(&self, slot: SlotId, err: rusb::Error) {
        lock(&self.state).failing_submits.insert(slot, err);
    }

    pub fn allow_submits(&self, slot: SlotId) {
        lock(&self.state).failing_submits.remove(&slot);
    }

    /// Make the next dispatch fail
    pub fn fail_next_dispatch(&self, err: TransferError) {
        lock(&self.state).dispatch_failure = Some(err);
    }

    /// Accept cancels without ever delivering their completion
    pub fn ignore_cancels(&self, ignore: bool) {
        lock(&self.state).ignore_cancels = ignore;
    }

    pub fn in_flight(&self, slot: SlotId) -> bool {
        lock(&self.state).inflight.contains_key(&slot)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.state).inflight.len()
    }

    pub fn submits(&self) -> Vec<SlotId> {
        lock(&self.state).submits.clone()
    }

    pub fn submits_for(&self, slot: SlotId) -> usize {
        lock(&self.state)
            .submits
            .iter()
            .filter(|s| **s == slot)
            .count()
    }

    pub fn cancels(&self) -> Vec<SlotId> {
        lock(&self.state).cancels.clone()
    }

    pub fn forgotten(&self) -> Vec<SlotId> {
        lock(&self.state).forgotten.clone()
    }

    /// Product ids of released devices, in release order
    pub fn released(&self) -> Vec<u16> {
        lock(&self.state).released.clone()
    }

    /// Ordering rules broken so far
    pub fn violations(&self) -> Vec<String> {
        lock(&self.state).violations.clone()
    }
}

/// Device double for [`ScriptedBackend`]
pub struct MockDevice {
    info: DeviceInfo,
    endpoint: EndpointInfo,
    script: Option<Arc<Mutex<ScriptState>>>,
}

impl MockDevice {
    /// A standalone boot mouse, not tied to any script
    pub fn mouse(product_id: u16) -> Self {
        Self {
            info: DeviceInfo {
                vendor_id: 0x046d,
                product_id,
                bus_number: 1,
                device_address: (product_id % 127) as u8 + 1,
                product: Some("Mock Mouse".to_string()),
                speed: DeviceSpeed::Low,
            },
            endpoint: EndpointInfo {
                address: 0x81,
                interface: 0,
                setting: 0,
                config: 1,
                max_packet_size: 8,
                interval: 10,
            },
            script: None,
        }
    }
}

impl InterruptDevice for MockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn endpoint(&self) -> &EndpointInfo {
        &self.endpoint
    }

    fn release(self) {
        let Some(script) = self.script else {
            return;
        };
        let mut state = lock(&script);
        let product_id = self.info.product_id;

        if state
            .inflight
            .values()
            .any(|inflight| inflight.product_id == product_id)
        {
            state.violations.push(format!(
                "device {:04x} released with a read in flight",
                product_id
            ));
        }
        if state.released.contains(&product_id) {
            state
                .violations
                .push(format!("device {:04x} released twice", product_id));
        }
        state.released.push(product_id);
    }
}

/// Sink that keeps every report
#[derive(Default)]
pub struct RecordingSink {
    pub reports: Vec<(u16, MouseReport)>,
}

impl EventSink for RecordingSink {
    fn emit(&mut self, device: &DeviceInfo, report: &MouseReport) {
        self.reports.push((device.product_id, *report));
    }
}

/// Input device that keeps every event
#[derive(Default)]
pub struct RecordingInput {
    pub events: Vec<InputEvent>,
}

impl InputDevice for RecordingInput {
    fn report_key(&mut self, key: LogicalKey, pressed: bool) {
        self.events.push(InputEvent::Key { key, pressed });
    }

    fn sync(&mut self) {
        self.events.push(InputEvent::Sync);
    }
}
