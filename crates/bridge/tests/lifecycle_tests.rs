//! Lifecycle Integration Tests
//!
//! Drives the controller against the scripted backend.
//!
//! # Test Scenarios
//! - Startup with several devices and partial submit failure
//! - Completion ordering, resubmission and decoding
//! - Cancellation races and idempotent shutdown
//! - Per-device open/close cycles
//! - Drain failure and forced release
//!
//! Run with: `cargo test -p bridge --test lifecycle_tests`

use bridge::lifecycle::{Controller, LifecycleError, Phase};
use bridge::test_utils::{RecordingSink, ScriptHandle, ScriptedBackend};
use bridge::usb::{EnginePolicy, RetireReason, TransferError, TransferStatus};
use common::test_utils::encode_boot_mouse_report;
use protocol::{DecodePolicy, SlotId};
use std::time::Duration;

const TICK: Duration = Duration::from_millis(1);
const DRAIN: Duration = Duration::from_millis(200);

const LEFT_CLICK: [u8; 8] = [0x01, 0x00, 0x00, 0xFE, 0x0A, 0x00, 0xF6, 0xFF];

type TestController = Controller<ScriptedBackend, RecordingSink>;

fn setup(mice: &[u16], policy: EnginePolicy) -> (TestController, ScriptHandle) {
    let (backend, script) = ScriptedBackend::new();
    let devices = mice.iter().map(|pid| script.mouse(*pid)).collect();
    let controller = Controller::new(backend, devices, RecordingSink::default(), policy);
    (controller, script)
}

fn started(mice: &[u16]) -> (TestController, ScriptHandle) {
    let (mut controller, script) = setup(mice, EnginePolicy::default());
    controller.start().unwrap();
    (controller, script)
}

// ============================================================================
// Startup Tests
// ============================================================================

#[test]
fn test_one_read_per_device_at_start() {
    let (controller, script) = started(&[1, 2]);

    assert_eq!(script.submits(), vec![SlotId(0), SlotId(1)]);
    assert!(script.in_flight(SlotId(0)));
    assert!(script.in_flight(SlotId(1)));
    assert_eq!(controller.outstanding(), 2);
}

#[test]
fn test_failed_submit_drops_only_that_device() {
    let (mut controller, script) = setup(&[1, 2], EnginePolicy::default());
    script.fail_submits(SlotId(0), rusb::Error::NoMem);

    assert_eq!(controller.start().unwrap(), 1);
    assert_eq!(controller.phase(), Phase::Started);
    assert_eq!(controller.registry().ids(), vec![SlotId(1)]);
    assert_eq!(script.released(), vec![1]);
    assert_eq!(controller.outstanding(), 1);

    // The survivor keeps streaming
    assert!(script.complete(SlotId(1), &LEFT_CLICK));
    controller.dispatch(TICK).unwrap();
    assert_eq!(controller.sink().reports.len(), 1);
    assert!(script.in_flight(SlotId(1)));
}

// ============================================================================
// Streaming Tests
// ============================================================================

#[test]
fn test_completion_emits_and_resubmits() {
    let (mut controller, script) = started(&[1]);

    assert!(script.complete(SlotId(0), &LEFT_CLICK));
    let report = controller.dispatch(TICK).unwrap();

    assert_eq!(report.completions, 1);
    assert_eq!(report.emitted, 1);
    assert!(report.retired.is_empty());
    assert_eq!(controller.phase(), Phase::Running);

    let (pid, decoded) = controller.sink().reports[0];
    assert_eq!(pid, 1);
    assert!(decoded.buttons.left && !decoded.buttons.right && !decoded.buttons.middle);
    assert_eq!((decoded.scroll, decoded.dx, decoded.dy), (-2, 10, -10));

    assert_eq!(script.submits_for(SlotId(0)), 2);
    assert!(script.in_flight(SlotId(0)));
}

#[test]
fn test_sustained_stream_keeps_one_read_in_flight() {
    let (mut controller, script) = started(&[1, 2]);

    for i in 0..50i16 {
        let raw = encode_boot_mouse_report(0, 0, i, -i);
        assert!(script.complete(SlotId((i % 2) as usize), &raw));
        controller.dispatch(TICK).unwrap();
        assert!(controller.outstanding() <= 2);
        assert!(script.in_flight_count() <= 2);
    }

    assert_eq!(controller.sink().reports.len(), 50);
    assert!(script.violations().is_empty(), "{:?}", script.violations());

    let stats = controller.registry().get(SlotId(0)).unwrap().stats;
    assert_eq!(stats.reports, 25);
    assert_eq!(stats.resubmits, 25);
}

#[test]
fn test_completions_in_one_dispatch_all_processed() {
    let (mut controller, script) = started(&[1, 2, 3]);

    for slot in 0..3 {
        assert!(script.complete(SlotId(slot), &LEFT_CLICK));
    }
    let report = controller.dispatch(TICK).unwrap();

    assert_eq!(report.completions, 3);
    assert_eq!(report.emitted, 3);
    let pids: Vec<u16> = controller.sink().reports.iter().map(|(pid, _)| *pid).collect();
    assert_eq!(pids, vec![1, 2, 3]);
}

#[test]
fn test_errors_never_reach_the_sink() {
    let (mut controller, script) = started(&[1]);

    for status in [
        TransferStatus::Error,
        TransferStatus::Stall,
        TransferStatus::TimedOut,
        TransferStatus::Overflow,
    ] {
        assert!(script.fail(SlotId(0), status));
        let report = controller.dispatch(TICK).unwrap();
        assert_eq!(report.emitted, 0);
        assert!(script.in_flight(SlotId(0)));
    }

    assert!(controller.sink().reports.is_empty());
    let stats = controller.registry().get(SlotId(0)).unwrap().stats;
    assert_eq!(stats.transient_errors, 4);
}

#[test]
fn test_zero_length_completion_not_emitted_under_either_policy() {
    for decode in [DecodePolicy::Lenient, DecodePolicy::Strict] {
        let (mut controller, script) = setup(
            &[1],
            EnginePolicy {
                decode,
                max_transient_retries: None,
            },
        );
        controller.start().unwrap();

        assert!(script.complete(SlotId(0), &[]));
        let report = controller.dispatch(TICK).unwrap();

        assert_eq!(report.emitted, 0);
        assert!(controller.sink().reports.is_empty());
        assert!(script.in_flight(SlotId(0)));
        assert_eq!(
            controller.registry().get(SlotId(0)).unwrap().stats.discarded,
            1
        );
    }
}

#[test]
fn test_short_report_under_strict_policy() {
    let (mut controller, script) = setup(
        &[1],
        EnginePolicy {
            decode: DecodePolicy::Strict,
            max_transient_retries: None,
        },
    );
    controller.start().unwrap();

    assert!(script.complete(SlotId(0), &[0x01, 0x00, 0x00, 0x00]));
    assert_eq!(controller.dispatch(TICK).unwrap().emitted, 0);

    assert!(script.complete(SlotId(0), &LEFT_CLICK));
    assert_eq!(controller.dispatch(TICK).unwrap().emitted, 1);
}

#[test]
fn test_disconnect_retires_device() {
    let (mut controller, script) = started(&[1, 2]);

    assert!(script.fail(SlotId(0), TransferStatus::NoDevice));
    let report = controller.dispatch(TICK).unwrap();

    assert_eq!(report.retired, vec![(SlotId(0), RetireReason::Disconnected)]);
    assert!(!script.in_flight(SlotId(0)));
    assert_eq!(script.submits_for(SlotId(0)), 1);
    assert_eq!(controller.outstanding(), 1);
}

#[test]
fn test_retry_ceiling_retires_device() {
    let (mut controller, script) = setup(
        &[1],
        EnginePolicy {
            decode: DecodePolicy::Lenient,
            max_transient_retries: Some(2),
        },
    );
    controller.start().unwrap();

    let mut retired = Vec::new();
    for _ in 0..3 {
        assert!(script.fail(SlotId(0), TransferStatus::Stall));
        retired.extend(controller.dispatch(TICK).unwrap().retired);
    }

    assert_eq!(
        retired,
        vec![(SlotId(0), RetireReason::RetryLimit { failures: 3 })]
    );
    assert_eq!(controller.outstanding(), 0);
    assert_eq!(script.submits_for(SlotId(0)), 3);
}

#[test]
fn test_resubmit_failure_takes_device_out_of_rotation() {
    let (mut controller, script) = started(&[1, 2]);

    script.fail_submits(SlotId(0), rusb::Error::Busy);
    assert!(script.complete(SlotId(0), &LEFT_CLICK));
    let report = controller.dispatch(TICK).unwrap();

    assert_eq!(report.emitted, 1);
    assert_eq!(
        report.retired,
        vec![(SlotId(0), RetireReason::SubmitFailed { code: -6 })]
    );
    assert_eq!(controller.outstanding(), 1);
    assert!(controller.registry().get(SlotId(0)).is_some());
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[test]
fn test_completion_on_one_then_cancel_leaves_other_pending() {
    let (mut controller, script) = started(&[1, 2]);

    assert!(script.complete(SlotId(0), &LEFT_CLICK));
    controller.dispatch(TICK).unwrap();
    assert_eq!(controller.sink().reports.len(), 1);

    let report = controller.close_device(SlotId(0), TICK, DRAIN).unwrap();
    assert_eq!(report.retired, vec![(SlotId(0), RetireReason::Cancelled)]);
    assert!(!script.in_flight(SlotId(0)));

    // The other device's original read is untouched
    assert!(script.in_flight(SlotId(1)));
    assert_eq!(script.submits_for(SlotId(1)), 1);
    assert_eq!(script.cancels(), vec![SlotId(0)]);
    assert_eq!(controller.outstanding(), 1);

    // and still completes normally
    assert!(script.complete(SlotId(1), &LEFT_CLICK));
    assert_eq!(controller.dispatch(TICK).unwrap().emitted, 1);
    assert!(script.in_flight(SlotId(1)));
}

#[test]
fn test_undispatched_completion_then_cancel_leaves_other_pending() {
    let (mut controller, script) = started(&[1, 2]);

    // Slot 0's completion is queued but not yet dispatched when it is closed
    assert!(script.complete(SlotId(0), &LEFT_CLICK));
    let report = controller.close_device(SlotId(0), TICK, DRAIN).unwrap();

    assert_eq!(report.emitted, 1);
    assert_eq!(report.retired, vec![(SlotId(0), RetireReason::Cancelled)]);
    assert_eq!(script.submits_for(SlotId(0)), 1);

    assert!(script.in_flight(SlotId(1)));
    assert_eq!(script.submits_for(SlotId(1)), 1);
    assert!(!script.cancels().contains(&SlotId(1)));
    assert!(script.violations().is_empty(), "{:?}", script.violations());
}

#[test]
fn test_completion_racing_stop_is_emitted_and_all_cancelled() {
    let (mut controller, script) = started(&[1, 2]);

    // Slot 0 completes just before the cancel lands
    assert!(script.complete(SlotId(0), &LEFT_CLICK));
    assert_eq!(controller.stop(), 2);
    assert_eq!(controller.phase(), Phase::Stopping);

    let report = controller.dispatch(TICK).unwrap();

    // Cancellation wins: the report is delivered, nothing is resubmitted
    assert_eq!(report.emitted, 1);
    assert_eq!(script.submits_for(SlotId(0)), 1);
    assert!(report.retired.contains(&(SlotId(0), RetireReason::Cancelled)));
    assert!(report.retired.contains(&(SlotId(1), RetireReason::Cancelled)));
    assert_eq!(controller.outstanding(), 0);
}

#[test]
fn test_stop_twice_issues_no_extra_cancels() {
    let (mut controller, script) = started(&[1, 2]);

    assert_eq!(controller.stop(), 2);
    assert_eq!(controller.stop(), 0);
    assert_eq!(script.cancels().len(), 2);

    controller.drain(TICK, DRAIN).unwrap();
    assert_eq!(controller.stop(), 0);
    assert_eq!(script.cancels().len(), 2);
}

#[test]
fn test_shutdown_releases_after_retirement() {
    let (mut controller, script) = started(&[1, 2, 3]);

    assert!(script.complete(SlotId(1), &LEFT_CLICK));
    controller.dispatch(TICK).unwrap();

    let status = controller.shutdown(TICK, DRAIN);

    assert_eq!(status, 0);
    assert_eq!(controller.phase(), Phase::Stopped);
    assert_eq!(script.in_flight_count(), 0);
    assert_eq!(script.released(), vec![1, 2, 3]);
    assert!(script.violations().is_empty(), "{:?}", script.violations());
    assert!(controller.registry().is_empty());

    // Stopped is terminal
    assert!(matches!(
        controller.dispatch(TICK),
        Err(LifecycleError::InvalidPhase { .. })
    ));
    assert_eq!(controller.shutdown(TICK, DRAIN), 0);
    assert_eq!(script.released().len(), 3);
}

#[test]
fn test_every_submitted_read_retires() {
    let (mut controller, script) = started(&[1, 2]);

    for _ in 0..10 {
        script.complete(SlotId(0), &LEFT_CLICK);
        script.fail(SlotId(1), TransferStatus::Stall);
        controller.dispatch(TICK).unwrap();
    }
    controller.shutdown(TICK, DRAIN);

    assert_eq!(script.in_flight_count(), 0);
    assert!(script.violations().is_empty(), "{:?}", script.violations());
}

#[test]
fn test_drain_timeout_force_releases() {
    let (mut controller, script) = started(&[1, 2]);
    script.ignore_cancels(true);

    let status = controller.shutdown(TICK, Duration::from_millis(20));

    assert_eq!(status, 0);
    assert_eq!(controller.phase(), Phase::Stopped);
    assert_eq!(script.forgotten(), vec![SlotId(0), SlotId(1)]);
    assert_eq!(script.released(), vec![1, 2]);
    assert!(script.violations().is_empty(), "{:?}", script.violations());
}

#[test]
fn test_dispatch_failure_sets_exit_status() {
    let (mut controller, script) = started(&[1]);

    script.fail_next_dispatch(TransferError::Usb(rusb::Error::Io));
    assert!(matches!(
        controller.dispatch(TICK),
        Err(LifecycleError::Transfer(TransferError::Usb(rusb::Error::Io)))
    ));

    assert_eq!(controller.shutdown(TICK, DRAIN), -1);
    assert_eq!(script.released(), vec![1]);
}

#[test]
fn test_dispatch_failure_while_draining_still_releases() {
    let (mut controller, script) = started(&[1, 2]);

    controller.stop();
    script.fail_next_dispatch(TransferError::Usb(rusb::Error::NoDevice));
    let status = controller.shutdown(TICK, DRAIN);

    assert_eq!(status, -4);
    assert_eq!(script.released(), vec![1, 2]);
    assert!(script.violations().is_empty(), "{:?}", script.violations());
}

// ============================================================================
// Per-device Open/Close Tests
// ============================================================================

#[test]
fn test_close_one_device_keeps_others_streaming() {
    let (mut controller, script) = started(&[1, 2]);

    assert!(script.complete(SlotId(1), &LEFT_CLICK));
    let report = controller.close_device(SlotId(0), TICK, DRAIN).unwrap();

    assert_eq!(report.emitted, 1);
    assert!(!script.in_flight(SlotId(0)));
    assert!(script.in_flight(SlotId(1)));
    assert_eq!(controller.phase(), Phase::Running);
    assert!(script.released().is_empty());
}

#[test]
fn test_open_close_cycles() {
    let (mut controller, script) = setup(&[1], EnginePolicy::default());

    for cycle in 1..=3 {
        controller.open_device(SlotId(0)).unwrap();
        assert!(script.in_flight(SlotId(0)));

        assert!(script.complete(SlotId(0), &LEFT_CLICK));
        controller.dispatch(TICK).unwrap();
        assert_eq!(controller.sink().reports.len(), cycle);

        controller.close_device(SlotId(0), TICK, DRAIN).unwrap();
        assert!(!script.in_flight(SlotId(0)));
        assert_eq!(controller.outstanding(), 0);
    }

    assert_eq!(script.cancels().len(), 3);
    assert!(script.violations().is_empty(), "{:?}", script.violations());

    assert_eq!(controller.shutdown(TICK, DRAIN), 0);
    assert_eq!(script.released(), vec![1]);
}

#[test]
fn test_open_twice_is_single_read() {
    let (mut controller, script) = started(&[1]);

    controller.open_device(SlotId(0)).unwrap();
    assert_eq!(script.submits_for(SlotId(0)), 1);
    assert!(script.violations().is_empty());
}

#[test]
fn test_unknown_slot_rejected() {
    let (mut controller, _script) = started(&[1]);

    assert_eq!(
        controller.open_device(SlotId(9)),
        Err(LifecycleError::UnknownSlot(SlotId(9)))
    );
    assert_eq!(
        controller.close_device(SlotId(9), TICK, DRAIN),
        Err(LifecycleError::UnknownSlot(SlotId(9)))
    );
}

#[test]
fn test_open_after_stop_rejected() {
    let (mut controller, _script) = started(&[1]);
    controller.stop();

    assert!(matches!(
        controller.open_device(SlotId(0)),
        Err(LifecycleError::InvalidPhase {
            phase: Phase::Stopping,
            ..
        })
    ));
}
