//! Asynchronous transfer backend abstraction
//!
//! A backend accepts non-blocking interrupt reads, retires them in the
//! background and hands each retired read back through `handle_events`,
//! exactly once. The receive buffer moves into the backend on submit and
//! comes back inside the [`Completion`], so the backend and the decoder can
//! never touch it at the same time.

use crate::usb::device::InterruptDevice;
use protocol::SlotId;
use std::time::Duration;
use thiserror::Error;

/// Final status of a retired read, numbered like `libusb_transfer_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn code(&self) -> i32 {
        match self {
            TransferStatus::Completed => 0,
            TransferStatus::Error => 1,
            TransferStatus::TimedOut => 2,
            TransferStatus::Cancelled => 3,
            TransferStatus::Stall => 4,
            TransferStatus::NoDevice => 5,
            TransferStatus::Overflow => 6,
        }
    }

    /// Failures worth retrying with a fresh read
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferStatus::Error
                | TransferStatus::TimedOut
                | TransferStatus::Stall
                | TransferStatus::Overflow
        )
    }
}

/// One retired read
#[derive(Debug)]
pub struct Completion {
    pub slot: SlotId,
    pub status: TransferStatus,
    /// The buffer handed over on submit
    pub buffer: Vec<u8>,
    /// Bytes of `buffer` filled by the device
    pub actual_length: usize,
}

impl Completion {
    /// The valid part of the buffer
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Backend-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Slot {0} already has a read outstanding")]
    Busy(SlotId),

    #[error("Slot {0} has no read outstanding")]
    NotPending(SlotId),

    #[error("Completion queue disconnected")]
    Disconnected,

    #[error("Failed to start reader: {0}")]
    Spawn(String),
}

impl TransferError {
    /// Numeric status in libusb error numbering
    pub fn code(&self) -> i32 {
        match self {
            TransferError::Usb(e) => usb_error_code(*e),
            TransferError::Busy(_) => -6,
            TransferError::NotPending(_) => -5,
            TransferError::Disconnected => -99,
            TransferError::Spawn(_) => -11,
        }
    }
}

/// Map rusb::Error to its libusb error number
pub fn usb_error_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

/// The asynchronous I/O subsystem the transfer engine drives
pub trait UsbBackend {
    type Device: InterruptDevice;

    /// Queue a read of `buffer.len()` bytes on the device's endpoint.
    /// Returns immediately.
    fn submit(
        &mut self,
        slot: SlotId,
        device: &Self::Device,
        buffer: Vec<u8>,
    ) -> Result<(), TransferError>;

    /// Ask for the outstanding read to be cancelled. The cancelled
    /// completion still arrives through `handle_events`.
    fn cancel(&mut self, slot: SlotId) -> Result<(), TransferError>;

    /// Wait up to `timeout` for retired reads and hand each one to
    /// `on_complete`.
    fn handle_events(
        &mut self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion),
    ) -> Result<(), TransferError>;

    /// Drop per-slot backend state before the device is released
    fn forget(&mut self, slot: SlotId);
}
