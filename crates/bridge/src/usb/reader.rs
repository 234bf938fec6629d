//! rusb transfer backend
//!
//! rusb exposes interrupt reads as blocking calls, so each slot gets a
//! reader thread that performs one read per request and posts the result to
//! a shared completion queue. From the controller's side this behaves like
//! libusb's asynchronous API: `submit` and `cancel` only enqueue intent, and
//! completions surface through `handle_events`.
//!
//! ```text
//! controller ── submit(buf) ──► [req queue] ──► usb-reader-N ── read_interrupt
//!     ▲                                              │
//!     └──── handle_events ◄── [completion queue] ◄───┘
//! ```
//!
//! Reads use a short timeout and loop, checking the slot's cancel flag
//! between attempts. A cancel therefore retires within one poll interval.

use crate::usb::backend::{Completion, TransferError, TransferStatus, UsbBackend};
use crate::usb::device::{HidDevice, InterruptDevice};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use protocol::SlotId;
use rusb::{Context, DeviceHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default timeout of a single blocking read attempt
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Reader {
    /// `None` once the slot has been forgotten
    requests: Option<Sender<Vec<u8>>>,
    cancel: Arc<AtomicBool>,
    outstanding: bool,
    thread: Option<JoinHandle<()>>,
}

/// Thread-per-device implementation of [`UsbBackend`]
pub struct ReaderBackend {
    readers: HashMap<SlotId, Reader>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    poll_interval: Duration,
}

impl ReaderBackend {
    pub fn new(poll_interval: Duration) -> Self {
        let (completion_tx, completion_rx) = channel::unbounded();
        Self {
            readers: HashMap::new(),
            completion_tx,
            completion_rx,
            poll_interval,
        }
    }

    fn spawn_reader(&self, slot: SlotId, device: &HidDevice) -> Result<Reader, TransferError> {
        let (request_tx, request_rx) = channel::bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));

        let ctx = ReadContext {
            slot,
            handle: device.shared_handle(),
            endpoint: device.endpoint().address,
            poll_interval: self.poll_interval,
            cancel: Arc::clone(&cancel),
            requests: request_rx,
            completions: self.completion_tx.clone(),
        };

        let thread = thread::Builder::new()
            .name(format!("usb-reader-{}", slot.0))
            .spawn(move || ctx.run())
            .map_err(|e| TransferError::Spawn(e.to_string()))?;

        debug!("Started reader for slot {} ({})", slot, device.info());

        Ok(Reader {
            requests: Some(request_tx),
            cancel,
            outstanding: false,
            thread: Some(thread),
        })
    }
}

impl Default for ReaderBackend {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl UsbBackend for ReaderBackend {
    type Device = HidDevice;

    fn submit(
        &mut self,
        slot: SlotId,
        device: &HidDevice,
        buffer: Vec<u8>,
    ) -> Result<(), TransferError> {
        if !self.readers.contains_key(&slot) {
            let reader = self.spawn_reader(slot, device)?;
            self.readers.insert(slot, reader);
        }

        let reader = self
            .readers
            .get_mut(&slot)
            .ok_or(TransferError::Disconnected)?;

        if reader.outstanding {
            return Err(TransferError::Busy(slot));
        }

        let requests = reader
            .requests
            .as_ref()
            .ok_or(TransferError::Disconnected)?;

        // A cancel aimed at the previous read must not kill this one
        reader.cancel.store(false, Ordering::Release);

        match requests.try_send(buffer) {
            Ok(()) => {
                reader.outstanding = true;
                trace!("Submitted read on slot {}", slot);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(TransferError::Busy(slot)),
            Err(TrySendError::Disconnected(_)) => Err(TransferError::Disconnected),
        }
    }

    fn cancel(&mut self, slot: SlotId) -> Result<(), TransferError> {
        match self.readers.get(&slot) {
            Some(reader) if reader.outstanding => {
                reader.cancel.store(true, Ordering::Release);
                Ok(())
            }
            _ => Err(TransferError::NotPending(slot)),
        }
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion),
    ) -> Result<(), TransferError> {
        let first = match self.completion_rx.recv_timeout(timeout) {
            Ok(completion) => completion,
            Err(RecvTimeoutError::Timeout) => return Ok(()),
            Err(RecvTimeoutError::Disconnected) => return Err(TransferError::Disconnected),
        };

        let mut next = Some(first);
        while let Some(completion) = next {
            if let Some(reader) = self.readers.get_mut(&completion.slot) {
                reader.outstanding = false;
            }
            on_complete(completion);
            next = self.completion_rx.try_recv().ok();
        }

        Ok(())
    }

    fn forget(&mut self, slot: SlotId) {
        let Some(mut reader) = self.readers.remove(&slot) else {
            return;
        };

        reader.cancel.store(true, Ordering::Release);
        // Closing the request queue ends the thread's loop
        reader.requests = None;

        let Some(thread) = reader.thread.take() else {
            return;
        };

        if reader.outstanding {
            warn!(
                "Reader for slot {} still has a read in flight, detaching it",
                slot
            );
            return;
        }

        if thread.join().is_err() {
            warn!("Reader for slot {} panicked", slot);
        } else {
            debug!("Stopped reader for slot {}", slot);
        }
    }
}

impl Drop for ReaderBackend {
    fn drop(&mut self) {
        let slots: Vec<SlotId> = self.readers.keys().copied().collect();
        for slot in slots {
            self.forget(slot);
        }
    }
}

/// Everything a reader thread owns
struct ReadContext {
    slot: SlotId,
    /// Keeps the device open until the thread exits
    handle: Arc<DeviceHandle<Context>>,
    endpoint: u8,
    poll_interval: Duration,
    cancel: Arc<AtomicBool>,
    requests: Receiver<Vec<u8>>,
    completions: Sender<Completion>,
}

impl ReadContext {
    fn run(self) {
        while let Ok(mut buffer) = self.requests.recv() {
            let (status, actual_length) = self.read_once(&mut buffer);
            trace!(
                "Slot {} read retired: {:?}, {} bytes",
                self.slot, status, actual_length
            );

            let completion = Completion {
                slot: self.slot,
                status,
                buffer,
                actual_length,
            };
            if self.completions.send(completion).is_err() {
                break;
            }
        }
        trace!("Reader for slot {} exiting", self.slot);
    }

    fn read_once(&self, buffer: &mut [u8]) -> (TransferStatus, usize) {
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return (TransferStatus::Cancelled, 0);
            }

            match self
                .handle
                .read_interrupt(self.endpoint, buffer, self.poll_interval)
            {
                Ok(len) => return (TransferStatus::Completed, len),
                Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => continue,
                Err(e) => return (status_for_error(e), 0),
            }
        }
    }
}

/// Transfer status a failed blocking read corresponds to
pub fn status_for_error(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Timeout => TransferStatus::TimedOut,
        _ => TransferStatus::Error,
    }
}
