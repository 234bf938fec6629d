//! USB HID interrupt-IN bridge
//!
//! Keeps one asynchronous interrupt read in flight per claimed boot mouse,
//! decodes every completed report and hands it to an [`sink::EventSink`].
//!
//! - [`usb`]: discovery, the transfer backend seam and the per-device state
//!   machine
//! - [`lifecycle`]: start, dispatch, stop, drain and release
//! - [`worker`]: the dedicated thread running the dispatch loop
//! - [`sink`]: text, JSON and key-bridge outputs
//! - [`config`]: TOML configuration

pub mod config;
pub mod lifecycle;
pub mod sink;
pub mod test_utils;
pub mod usb;
pub mod worker;

pub use config::{BridgeConfig, OutputFormat};
pub use lifecycle::{Controller, DispatchReport, LifecycleError, Phase};
pub use sink::{EventSink, InputDevice, JsonSink, KeyBridgeSink, StdoutInput, TextSink};
pub use worker::{BridgeWorker, WorkerTimings, spawn_bridge_worker};
