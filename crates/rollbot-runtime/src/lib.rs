//! `rollbot-runtime` – the device worker and everything that feeds it.
//!
//! # Modules
//!
//! - [`worker`] – [`WorkerLoop`]: one OS thread running a Tokio
//!   current-thread runtime. All device I/O happens there; other threads
//!   submit futures and wait on a [`TaskHandle`].
//! - [`session`] – [`Session`]: connection lifecycle and per-operation retry.
//! - [`backoff`] – jittered exponential backoff between connect attempts.
//! - [`dispatcher`] – [`Dispatcher`]: runs the safety gate on the caller's
//!   thread, submits accepted work and tracks it until it finishes.
//! - [`watchdog`] – [`WatchdogRunner`]: periodic health checks and reconnects.
//! - [`context`] – [`RollbotContext`]: assembles the pieces above once.
//! - [`telemetry`] – tracing subscriber initialisation.

pub mod backoff;
pub mod context;
pub mod dispatcher;
pub mod session;
pub mod telemetry;
pub mod watchdog;
pub mod worker;

pub use context::{
    BusLedEcho, ContextBuilder, DEFAULT_SHUTDOWN_TIMEOUT, RollbotContext, ShutdownReport,
};
pub use dispatcher::Dispatcher;
pub use session::{ConnectPolicy, Session};
pub use watchdog::{WatchdogConfig, WatchdogRunner};
pub use worker::{TaskHandle, WorkerLoop};
