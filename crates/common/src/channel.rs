//! Async channel bridge between Tokio runtime and the USB worker thread

use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::{DeviceSummary, SlotId};
use tracing::warn;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum ControlCommand {
    /// List all devices in the registry
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceSummary>>,
    },

    /// Start streaming from one device (input "open")
    OpenDevice {
        /// Registry slot of the device
        slot: SlotId,
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<crate::Result<()>>,
    },

    /// Stop streaming from one device and wait for its read to retire
    /// (input "close")
    CloseDevice {
        /// Registry slot of the device
        slot: SlotId,
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<crate::Result<()>>,
    },

    /// Cancel everything, drain, release and exit the worker
    Shutdown,
}

/// Events from the USB worker thread
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Initial reads submitted
    Started {
        /// Devices that are streaming
        devices: Vec<DeviceSummary>,
    },

    /// A device's stream ended without being asked to
    DeviceRetired {
        slot: SlotId,
        vendor_id: u16,
        product_id: u16,
        /// Human-readable retirement reason
        reason: String,
    },

    /// Worker finished cleanup and is exiting
    Stopped {
        /// Last USB status code, 0 on clean shutdown
        status: i32,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct ControlBridge {
    cmd_tx: Sender<ControlCommand>,
    event_rx: Receiver<BridgeEvent>,
}

impl ControlBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: ControlCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<BridgeEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the worker for its device list
    pub async fn list_devices(&self) -> crate::Result<Vec<DeviceSummary>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(ControlCommand::ListDevices { response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Start streaming from one device
    pub async fn open_device(&self, slot: SlotId) -> crate::Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(ControlCommand::OpenDevice { slot, response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))?
    }

    /// Stop streaming from one device
    pub async fn close_device(&self, slot: SlotId) -> crate::Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(ControlCommand::CloseDevice { slot, response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))?
    }

    /// Request a graceful shutdown
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send_command(ControlCommand::Shutdown).await
    }
}

/// Handle for USB thread (blocking)
pub struct ControlWorker {
    cmd_rx: Receiver<ControlCommand>,
    event_tx: Sender<BridgeEvent>,
}

impl ControlWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<ControlCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<ControlCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether every [`ControlBridge`] has been dropped
    pub fn is_orphaned(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Publish an event without blocking the dispatch loop
    ///
    /// A full queue drops the event; nobody listening is not an error.
    pub fn send_event(&self, event: BridgeEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
            }
        }
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (ControlBridge for Tokio, ControlWorker for USB thread)
pub fn create_control_bridge() -> (ControlBridge, ControlWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(256);

    (
        ControlBridge { cmd_tx, event_rx },
        ControlWorker { cmd_rx, event_tx },
    )
}
