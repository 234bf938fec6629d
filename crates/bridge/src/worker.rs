//! USB worker thread
//!
//! Dedicated thread that owns the controller and runs the dispatch loop.
//! Between dispatch rounds it drains commands from the Tokio side; events
//! flow back over the same bridge.

use crate::config::BridgeConfig;
use crate::lifecycle::{Controller, DispatchReport, LifecycleError};
use crate::sink::EventSink;
use crate::usb::{InterruptDevice, ReaderBackend, UsbBackend, discover};
use common::{BridgeEvent, ControlCommand, ControlWorker};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Wait limits used by the worker loop
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    /// Longest single dispatch wait, bounds command latency
    pub event_timeout: Duration,
    /// Longest wait for cancelled reads during close and shutdown
    pub drain_timeout: Duration,
}

impl WorkerTimings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            event_timeout: config.event_timeout(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

fn control_error(err: LifecycleError) -> common::Error {
    match err {
        LifecycleError::UnknownSlot(slot) => common::Error::UnknownSlot(slot),
        other => common::Error::Usb(other.to_string()),
    }
}

/// The controller plus its command channel
pub struct BridgeWorker<B: UsbBackend, S: EventSink> {
    controller: Controller<B, S>,
    control: ControlWorker,
    timings: WorkerTimings,
}

impl<B: UsbBackend, S: EventSink> BridgeWorker<B, S> {
    pub fn new(
        controller: Controller<B, S>,
        control: ControlWorker,
        timings: WorkerTimings,
    ) -> Self {
        Self {
            controller,
            control,
            timings,
        }
    }

    /// Run until shutdown is requested, the control side goes away or
    /// dispatch fails. Returns the exit status.
    pub fn run(mut self) -> i32 {
        info!("USB worker thread started");

        if let Err(e) = self.controller.start() {
            error!("Failed to start streaming: {}", e);
        }

        self.control.send_event(BridgeEvent::Started {
            devices: self.controller.summaries(),
        });

        if self.controller.registry().is_empty() {
            warn!("No devices to stream from");
        } else {
            self.run_loop();
        }

        let status = self
            .controller
            .shutdown(self.timings.event_timeout, self.timings.drain_timeout);
        self.control.send_event(BridgeEvent::Stopped { status });

        info!("USB worker thread stopped");
        status
    }

    fn run_loop(&mut self) {
        loop {
            match self.control.try_recv_command() {
                Some(ControlCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    return;
                }
                Some(cmd) => self.handle_command(cmd),
                None if self.control.is_orphaned() => {
                    info!("Control side closed, shutting down");
                    return;
                }
                None => {}
            }

            match self.controller.dispatch(self.timings.event_timeout) {
                Ok(report) => self.forward_retired(&report),
                Err(e) => {
                    error!("Stopping after dispatch failure: {}", e);
                    return;
                }
            }
        }
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: ControlCommand) {
        // Keep the loop alive if a handler panics
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::ListDevices { response } => {
                let devices = self.controller.summaries();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            ControlCommand::OpenDevice { slot, response } => {
                debug!("Opening slot {}", slot);
                let result = self.controller.open_device(slot).map_err(control_error);
                let _ = response.send(result);
            }

            ControlCommand::CloseDevice { slot, response } => {
                debug!("Closing slot {}", slot);
                let result = self
                    .controller
                    .close_device(slot, self.timings.event_timeout, self.timings.drain_timeout)
                    .map(|report| self.forward_retired(&report))
                    .map_err(control_error);
                let _ = response.send(result);
            }

            ControlCommand::Shutdown => {
                // Handled by the loop
            }
        }
    }

    /// Tell the Tokio side about streams that ended on their own
    fn forward_retired(&self, report: &DispatchReport) {
        for (slot, reason) in &report.retired {
            if reason.is_requested() {
                continue;
            }
            let Some(entry) = self.controller.registry().get(*slot) else {
                continue;
            };
            let info = entry.device.info();
            self.control.send_event(BridgeEvent::DeviceRetired {
                slot: *slot,
                vendor_id: info.vendor_id,
                product_id: info.product_id,
                reason: reason.to_string(),
            });
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread creates the libusb context, runs discovery and then the
/// dispatch loop. Failing to create the context is the only fatal error.
pub fn spawn_bridge_worker(
    config: BridgeConfig,
    control: ControlWorker,
    sink: Box<dyn EventSink + Send>,
) -> std::io::Result<JoinHandle<Result<i32, rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let context = rusb::Context::new().inspect_err(|e| {
                error!("Failed to initialize libusb: {}", e);
            })?;

            let devices = discover(&context, &config.interface_filter(), &config.usb.filters)?;

            let backend = ReaderBackend::new(config.poll_interval());
            let controller = Controller::new(backend, devices, sink, config.engine_policy());
            let timings = WorkerTimings::from_config(&config);
            let worker = BridgeWorker::new(controller, control, timings);
            Ok(worker.run())
        })
}
