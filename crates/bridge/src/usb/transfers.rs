//! Per-device completion handling
//!
//! Each device slot carries a [`StreamState`]. A retired read is fed through
//! [`on_complete`], which returns the next state and the effects the caller
//! must carry out, in order. Keeping this free of I/O lets the controller
//! and the tests drive exactly the same transitions.
//!
//! Status classes:
//! - `Completed`: decode, emit, resubmit
//! - `Error`, `TimedOut`, `Stall`, `Overflow`: transient, resubmit quietly
//! - `Cancelled`, `NoDevice`: terminal, retire
//!
//! A slot in `Cancelling` never resubmits, whatever the status says.

use crate::usb::backend::TransferStatus;
use protocol::{DecodeError, DecodePolicy, MouseReport};
use std::fmt;

/// Where a device's read stream currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No read outstanding
    Idle,
    /// One read outstanding
    Pending {
        /// Transient failures since the last successful read
        transient_failures: u32,
    },
    /// One read outstanding and a cancel has been requested
    Cancelling,
}

impl StreamState {
    pub fn pending() -> Self {
        StreamState::Pending {
            transient_failures: 0,
        }
    }

    /// Reads in flight for this slot, always 0 or 1
    pub fn outstanding(&self) -> usize {
        match self {
            StreamState::Idle => 0,
            StreamState::Pending { .. } | StreamState::Cancelling => 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, StreamState::Idle)
    }
}

/// Why a stream stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Cancel acknowledged
    Cancelled,
    /// Device went away
    Disconnected,
    /// Transient failures exceeded the configured ceiling
    RetryLimit { failures: u32 },
    /// The backend refused a submit
    SubmitFailed { code: i32 },
}

impl RetireReason {
    /// Whether the stream ended because someone asked it to
    pub fn is_requested(&self) -> bool {
        matches!(self, RetireReason::Cancelled)
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetireReason::Cancelled => write!(f, "cancelled"),
            RetireReason::Disconnected => write!(f, "device disconnected"),
            RetireReason::RetryLimit { failures } => {
                write!(f, "gave up after {} transient failures", failures)
            }
            RetireReason::SubmitFailed { code } => write!(f, "submit failed (status {})", code),
        }
    }
}

/// Action requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Hand a decoded report to the sink
    Emit(MouseReport),
    /// Payload completed but was not decodable under the active policy
    Discard(DecodeError),
    /// Submit the next read for this slot
    Resubmit,
    /// Stream is over; slot is now idle
    Retire(RetireReason),
}

/// Knobs for the completion state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnginePolicy {
    pub decode: DecodePolicy,
    /// `None` resubmits after transient errors forever
    pub max_transient_retries: Option<u32>,
}

fn decode_effect(policy: &EnginePolicy, payload: &[u8]) -> Effect {
    match policy.decode.decode(payload) {
        Ok(report) => Effect::Emit(report),
        Err(e) => Effect::Discard(e),
    }
}

/// Advance a slot's stream after one of its reads retired
pub fn on_complete(
    state: StreamState,
    status: &TransferStatus,
    payload: &[u8],
    policy: &EnginePolicy,
) -> (StreamState, Vec<Effect>) {
    match state {
        // Nothing was outstanding; a stray completion changes nothing
        StreamState::Idle => (StreamState::Idle, Vec::new()),

        StreamState::Cancelling => {
            let mut effects = Vec::with_capacity(2);
            if *status == TransferStatus::Completed {
                effects.push(decode_effect(policy, payload));
            }
            let reason = match status {
                TransferStatus::NoDevice => RetireReason::Disconnected,
                _ => RetireReason::Cancelled,
            };
            effects.push(Effect::Retire(reason));
            (StreamState::Idle, effects)
        }

        StreamState::Pending { transient_failures } => match status {
            TransferStatus::Completed => (
                StreamState::pending(),
                vec![decode_effect(policy, payload), Effect::Resubmit],
            ),

            TransferStatus::Cancelled => (
                StreamState::Idle,
                vec![Effect::Retire(RetireReason::Cancelled)],
            ),

            TransferStatus::NoDevice => (
                StreamState::Idle,
                vec![Effect::Retire(RetireReason::Disconnected)],
            ),

            TransferStatus::Error
            | TransferStatus::TimedOut
            | TransferStatus::Stall
            | TransferStatus::Overflow => {
                let failures = transient_failures.saturating_add(1);
                match policy.max_transient_retries {
                    Some(max) if transient_failures >= max => (
                        StreamState::Idle,
                        vec![Effect::Retire(RetireReason::RetryLimit { failures })],
                    ),
                    _ => (
                        StreamState::Pending {
                            transient_failures: failures,
                        },
                        vec![Effect::Resubmit],
                    ),
                }
            }
        },
    }
}

/// Mark a slot as cancelling.
///
/// Returns `true` when a cancel should be issued to the backend. Idle and
/// already-cancelling slots need nothing more.
pub fn request_cancel(state: StreamState) -> (StreamState, bool) {
    match state {
        StreamState::Pending { .. } => (StreamState::Cancelling, true),
        other => (other, false),
    }
}
