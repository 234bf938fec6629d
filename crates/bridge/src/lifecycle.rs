//! Lifecycle controller
//!
//! Drives the registry through `Idle → Started → Running → Stopping →
//! Stopped`. All completions are processed on the thread that calls
//! [`Controller::dispatch`]; nothing here is shared across threads.
//!
//! Shutdown is cancel, then drain, then release. A device is released only
//! once its slot is idle, or when draining gave up, in which case the
//! backend is told to forget the slot first.

use crate::sink::EventSink;
use crate::usb::device::InterruptDevice;
use crate::usb::registry::{DeviceRegistry, Slot};
use crate::usb::transfers::{self, Effect, EnginePolicy, RetireReason, StreamState};
use crate::usb::{Completion, TransferError, TransferStatus, UsbBackend};
use protocol::{DeviceSummary, SlotId};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Started,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Started => "started",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("Cannot {action} while {phase}")]
    InvalidPhase { action: &'static str, phase: Phase },

    #[error("No device in slot {0}")]
    UnknownSlot(SlotId),

    #[error("Gave up waiting for {outstanding} read(s) to retire")]
    DrainTimeout { outstanding: usize },

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// What one or more dispatch rounds did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Completions delivered by the backend
    pub completions: usize,
    /// Reports handed to the sink
    pub emitted: usize,
    /// Streams that ended, in the order they ended
    pub retired: Vec<(SlotId, RetireReason)>,
}

impl DispatchReport {
    fn merge(&mut self, other: DispatchReport) {
        self.completions += other.completions;
        self.emitted += other.emitted;
        self.retired.extend(other.retired);
    }
}

/// Hand the slot's buffer to the backend for one read
fn submit_read<B: UsbBackend>(
    backend: &mut B,
    id: SlotId,
    slot: &mut Slot<B::Device>,
) -> Result<(), TransferError> {
    let buffer = slot.take_buffer();
    backend.submit(id, &slot.device, buffer)
}

/// Owns the backend, the registry and the sink
pub struct Controller<B: UsbBackend, S: EventSink> {
    backend: B,
    registry: DeviceRegistry<B::Device>,
    sink: S,
    policy: EnginePolicy,
    phase: Phase,
    last_error: Option<TransferError>,
}

impl<B: UsbBackend, S: EventSink> Controller<B, S> {
    pub fn new(backend: B, devices: Vec<B::Device>, sink: S, policy: EnginePolicy) -> Self {
        Self {
            backend,
            registry: DeviceRegistry::new(devices),
            sink,
            policy,
            phase: Phase::Idle,
            last_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &DeviceRegistry<B::Device> {
        &self.registry
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Reads in flight across all devices
    pub fn outstanding(&self) -> usize {
        self.registry.outstanding()
    }

    pub fn last_error(&self) -> Option<&TransferError> {
        self.last_error.as_ref()
    }

    /// Process exit status: last backend error code, 0 if there was none
    pub fn exit_code(&self) -> i32 {
        self.last_error
            .as_ref()
            .map(TransferError::code)
            .unwrap_or(0)
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.registry.summaries()
    }

    /// Submit the first read for every device.
    ///
    /// A device whose submit fails is dropped from the registry; the rest
    /// carry on. Returns the number of streams started.
    pub fn start(&mut self) -> Result<usize, LifecycleError> {
        if self.phase != Phase::Idle {
            return Err(LifecycleError::InvalidPhase {
                action: "start",
                phase: self.phase,
            });
        }

        let mut started = 0;
        for id in self.registry.ids() {
            let Some(slot) = self.registry.get_mut(id) else {
                continue;
            };

            match submit_read(&mut self.backend, id, slot) {
                Ok(()) => {
                    slot.state = StreamState::pending();
                    started += 1;
                }
                Err(e) => {
                    warn!(
                        "Failed to submit read for {} slot {}: {} (status {})",
                        slot.device.info(),
                        id,
                        e,
                        e.code()
                    );
                    self.drop_slot(id);
                }
            }
        }

        self.phase = Phase::Started;
        info!("Streaming from {} device(s)", started);
        Ok(started)
    }

    /// Wait up to `timeout` for completions and process them
    pub fn dispatch(&mut self, timeout: Duration) -> Result<DispatchReport, LifecycleError> {
        match self.phase {
            Phase::Started | Phase::Running | Phase::Stopping => {}
            phase => {
                return Err(LifecycleError::InvalidPhase {
                    action: "dispatch",
                    phase,
                });
            }
        }

        let mut completions = Vec::new();
        if let Err(e) = self
            .backend
            .handle_events(timeout, &mut |completion| completions.push(completion))
        {
            error!("Event dispatch failed: {} (status {})", e, e.code());
            self.last_error = Some(e.clone());
            return Err(e.into());
        }

        if self.phase == Phase::Started {
            self.phase = Phase::Running;
        }

        let mut report = DispatchReport {
            completions: completions.len(),
            ..Default::default()
        };
        for completion in completions {
            self.process(completion, &mut report);
        }

        Ok(report)
    }

    fn process(&mut self, completion: Completion, report: &mut DispatchReport) {
        let id = completion.slot;
        let Some(slot) = self.registry.get_mut(id) else {
            debug!("Dropping completion for released slot {}", id);
            return;
        };

        if completion.status == TransferStatus::Completed {
            debug!(
                "{} raw data ({} bytes): {:02x?}",
                slot.device.info(),
                completion.actual_length,
                completion.payload()
            );
        } else {
            debug!(
                "{} read retired with status {:?} ({})",
                slot.device.info(),
                completion.status,
                completion.status.code()
            );
        }

        let (next, effects) = transfers::on_complete(
            slot.state,
            &completion.status,
            completion.payload(),
            &self.policy,
        );
        slot.state = next;
        if completion.status.is_transient() {
            slot.stats.transient_errors += 1;
        }
        slot.store_buffer(completion.buffer);

        for effect in effects {
            match effect {
                Effect::Emit(decoded) => {
                    self.sink.emit(slot.device.info(), &decoded);
                    slot.stats.reports += 1;
                    report.emitted += 1;
                }
                Effect::Discard(e) => {
                    slot.stats.discarded += 1;
                    debug!("Discarded payload from {}: {}", slot.device.info(), e);
                }
                Effect::Resubmit => match submit_read(&mut self.backend, id, slot) {
                    Ok(()) => slot.stats.resubmits += 1,
                    Err(e) => {
                        warn!(
                            "Failed to resubmit read for {} slot {}: {} (status {})",
                            slot.device.info(),
                            id,
                            e,
                            e.code()
                        );
                        slot.state = StreamState::Idle;
                        report
                            .retired
                            .push((id, RetireReason::SubmitFailed { code: e.code() }));
                    }
                },
                Effect::Retire(reason) => {
                    if reason.is_requested() {
                        debug!("Stream on {} slot {} {}", slot.device.info(), id, reason);
                    } else {
                        warn!(
                            "Stream on {} slot {} ended: {} (status {})",
                            slot.device.info(),
                            id,
                            reason,
                            completion.status.code()
                        );
                    }
                    report.retired.push((id, reason));
                }
            }
        }
    }

    /// Request cancellation of every outstanding read.
    ///
    /// Only the first call does anything; later calls return 0.
    pub fn stop(&mut self) -> usize {
        match self.phase {
            Phase::Stopping | Phase::Stopped => return 0,
            _ => self.phase = Phase::Stopping,
        }

        let mut cancelled = 0;
        for id in self.registry.ids() {
            if self.cancel_slot(id) {
                cancelled += 1;
            }
        }

        info!("Stopping, cancelled {} read(s)", cancelled);
        cancelled
    }

    fn cancel_slot(&mut self, id: SlotId) -> bool {
        let Some(slot) = self.registry.get_mut(id) else {
            return false;
        };

        let (next, issue) = transfers::request_cancel(slot.state);
        slot.state = next;
        if !issue {
            return false;
        }

        // A failed cancel still leaves the completion to be drained
        if let Err(e) = self.backend.cancel(id) {
            warn!(
                "Failed to cancel read for {} slot {}: {} (status {})",
                slot.device.info(),
                id,
                e,
                e.code()
            );
        }
        true
    }

    /// Dispatch until no read is outstanding or `limit` runs out
    pub fn drain(
        &mut self,
        dispatch_timeout: Duration,
        limit: Duration,
    ) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + limit;

        loop {
            let outstanding = self.registry.outstanding();
            if outstanding == 0 {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::DrainTimeout { outstanding });
            }

            self.dispatch(dispatch_timeout.min(deadline - now))?;
        }
    }

    /// Stop, drain and release everything. Returns the exit status.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&mut self, dispatch_timeout: Duration, drain_limit: Duration) -> i32 {
        if self.phase == Phase::Stopped {
            return self.exit_code();
        }

        self.stop();

        match self.drain(dispatch_timeout, drain_limit) {
            Ok(()) => debug!("All reads retired"),
            Err(e) => warn!(
                "Drain aborted: {}; force-releasing {} device(s)",
                e,
                self.registry.len()
            ),
        }

        for id in self.registry.ids() {
            self.drop_slot(id);
        }

        self.phase = Phase::Stopped;
        let code = self.exit_code();
        info!("Stopped (status {})", code);
        code
    }

    /// Start streaming from one device
    pub fn open_device(&mut self, id: SlotId) -> Result<(), LifecycleError> {
        match self.phase {
            Phase::Idle | Phase::Started | Phase::Running => {}
            phase => {
                return Err(LifecycleError::InvalidPhase {
                    action: "open a device",
                    phase,
                });
            }
        }

        let slot = self
            .registry
            .get_mut(id)
            .ok_or(LifecycleError::UnknownSlot(id))?;

        if !slot.state.is_idle() {
            debug!("Slot {} already streaming", id);
            return Ok(());
        }

        submit_read(&mut self.backend, id, slot)?;
        slot.state = StreamState::pending();
        info!("Opened {} slot {}", slot.device.info(), id);

        if self.phase == Phase::Idle {
            self.phase = Phase::Started;
        }
        Ok(())
    }

    /// Stop streaming from one device and wait for its read to retire.
    ///
    /// Other devices keep streaming; their completions are processed while
    /// waiting and show up in the returned report.
    pub fn close_device(
        &mut self,
        id: SlotId,
        dispatch_timeout: Duration,
        limit: Duration,
    ) -> Result<DispatchReport, LifecycleError> {
        match self.phase {
            Phase::Started | Phase::Running => {}
            phase => {
                return Err(LifecycleError::InvalidPhase {
                    action: "close a device",
                    phase,
                });
            }
        }

        if self.registry.get(id).is_none() {
            return Err(LifecycleError::UnknownSlot(id));
        }

        self.cancel_slot(id);

        let deadline = Instant::now() + limit;
        let mut report = DispatchReport::default();
        loop {
            let outstanding = self
                .registry
                .get(id)
                .map(|slot| slot.state.outstanding())
                .unwrap_or(0);
            if outstanding == 0 {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::DrainTimeout { outstanding });
            }
            report.merge(self.dispatch(dispatch_timeout.min(deadline - now))?);
        }

        info!("Closed slot {}", id);
        Ok(report)
    }

    /// Forget a slot in the backend, then release its device
    fn drop_slot(&mut self, id: SlotId) {
        self.backend.forget(id);

        let Some(slot) = self.registry.remove(id) else {
            return;
        };

        let stats = slot.stats;
        info!(
            "{} slot {}: {} reports, {} discarded, {} transient errors, {} resubmits",
            slot.device.info(),
            id,
            stats.reports,
            stats.discarded,
            stats.transient_errors,
            stats.resubmits
        );

        if !slot.state.is_idle() {
            warn!(
                "Releasing {} slot {} with a read still in flight",
                slot.device.info(),
                id
            );
        }
        slot.device.release();
    }
}
