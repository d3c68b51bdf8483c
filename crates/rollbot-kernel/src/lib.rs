//! `rollbot-kernel` – safety and health.
//!
//! Nothing in this crate touches the device. It decides what may reach it.
//!
//! # Modules
//!
//! - [`safety_gate`] – [`SafetyGate`][safety_gate::SafetyGate]: validates and
//!   clamps drive requests, rate-limits them, holds the estop latch and owns
//!   the auto-stop timer. Every check runs synchronously on the caller's
//!   thread.
//! - [`auto_stop`] – [`AutoStop`][auto_stop::AutoStop]: the single pending
//!   "stop when the drive window ends" timer.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: the connection health
//!   state machine ticked by the runtime's supervisor thread.

pub mod auto_stop;
pub mod safety_gate;
pub mod watchdog;

pub use auto_stop::AutoStop;
pub use safety_gate::{LinkStatus, SafetyGate, clamp_duration, clamp_speed, wrap_heading};
pub use watchdog::{CyclePlan, Observation, Watchdog};
