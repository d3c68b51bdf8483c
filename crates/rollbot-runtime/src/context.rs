//! [`RollbotContext`] – builds the core once and hands out its parts.
//!
//! The context owns the worker, the session, the dispatcher and the event
//! bus for one device. Nothing in the core is a global; everything that
//! needs a collaborator receives it from here.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rollbot_hal::SimToy;
//! use rollbot_runtime::RollbotContext;
//!
//! let ctx = RollbotContext::builder(Arc::new(SimToy::new()))
//!     .address("sim-0")
//!     .build()
//!     .unwrap();
//!
//! ctx.dispatcher().power(true).unwrap().wait(Duration::from_secs(2)).unwrap();
//! assert!(ctx.dispatcher().is_connected());
//!
//! let report = ctx.shutdown(Duration::from_millis(2500));
//! assert_eq!(report.commands_cancelled, 0);
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use rollbot_hal::{Discovery, LedEcho, ToyConnector};
use rollbot_kernel::SafetyGate;
use rollbot_middleware::{EventBus, Topic};
use rollbot_types::{CoreConfig, Event, EventPayload, Rgb, RollError};
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::session::{ConnectPolicy, Session};
use crate::watchdog::{WatchdogConfig, WatchdogRunner};
use crate::worker::WorkerLoop;

/// Default bound on a graceful shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(2500);

/// [`LedEcho`] that publishes every LED change on [`Topic::CommandStatus`].
#[derive(Clone)]
pub struct BusLedEcho {
    bus: EventBus,
}

impl BusLedEcho {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl LedEcho for BusLedEcho {
    fn echo(&self, color: Rgb) {
        self.bus.publish_to(
            Topic::CommandStatus,
            Event::new("rollbot-runtime::led", EventPayload::LedChanged(color)),
        );
    }
}

/// What a shutdown cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Dispatcher commands cancelled while in flight.
    pub commands_cancelled: usize,
    /// Worker tasks still pending when the worker stopped.
    pub tasks_cancelled: usize,
}

pub struct ContextBuilder {
    connector: Arc<dyn ToyConnector>,
    address: Option<String>,
    discovery: Option<Arc<dyn Discovery>>,
    config: CoreConfig,
    bus: Option<EventBus>,
    led_echo: Option<Arc<dyn LedEcho>>,
}

impl ContextBuilder {
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Defaults to [`BusLedEcho`] on the context's bus.
    pub fn led_echo(mut self, echo: Arc<dyn LedEcho>) -> Self {
        self.led_echo = Some(echo);
        self
    }

    /// Assemble the core and start the worker.
    ///
    /// # Errors
    ///
    /// [`RollError::WorkerUnavailable`] if the worker thread cannot start.
    pub fn build(self) -> Result<RollbotContext, RollError> {
        let bus = self.bus.unwrap_or_default();
        let led_echo = self
            .led_echo
            .unwrap_or_else(|| Arc::new(BusLedEcho::new(bus.clone())));

        let worker = Arc::new(WorkerLoop::new("core"));
        worker.start()?;

        let session = Arc::new(Session::new(
            self.connector,
            self.address,
            self.discovery,
            ConnectPolicy::from_config(&self.config),
        ));
        let gate = SafetyGate::with_link(self.config.safety(), session.link_status());
        let dispatcher = Dispatcher::new(
            Arc::clone(&worker),
            Arc::clone(&session),
            gate,
            bus.clone(),
            led_echo,
        );
        info!(
            address = ?session.address(),
            min_interval_ms = self.config.min_interval_ms,
            max_speed = self.config.max_speed,
            "core assembled"
        );

        Ok(RollbotContext {
            config: self.config,
            worker,
            session,
            dispatcher,
            bus,
        })
    }
}

/// One fully wired core for one device.
pub struct RollbotContext {
    config: CoreConfig,
    worker: Arc<WorkerLoop>,
    session: Arc<Session>,
    dispatcher: Dispatcher,
    bus: EventBus,
}

impl RollbotContext {
    pub fn builder(connector: Arc<dyn ToyConnector>) -> ContextBuilder {
        ContextBuilder {
            connector,
            address: None,
            discovery: None,
            config: CoreConfig::default(),
            bus: None,
            led_echo: None,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn worker(&self) -> &Arc<WorkerLoop> {
        &self.worker
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start a watchdog over this context's dispatcher. `connect_wait` is
    /// raised to cover one full connect if it is shorter.
    pub fn spawn_watchdog(&self, mut config: WatchdogConfig) -> std::io::Result<WatchdogRunner> {
        config.connect_wait = config.connect_wait.max(self.session.policy().budget());
        WatchdogRunner::spawn(self.dispatcher.clone(), config)
    }

    /// Shut the dispatcher down, then stop the worker, within `timeout` in
    /// total.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let commands_cancelled = self.dispatcher.shutdown(timeout);
        let tasks_cancelled = self
            .worker
            .stop(deadline.saturating_duration_since(Instant::now()));
        let report = ShutdownReport {
            commands_cancelled,
            tasks_cancelled,
        };
        info!(?report, "core shut down");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollbot_hal::{SimDiscovery, SimToy};

    #[test]
    fn led_changes_are_echoed_on_the_bus() {
        let ctx = RollbotContext::builder(Arc::new(SimToy::new()))
            .address("sim")
            .build()
            .unwrap();
        let mut status = ctx.bus().subscribe_to(Topic::CommandStatus);
        let wait = Duration::from_secs(2);
        ctx.dispatcher().power(true).unwrap().wait(wait).unwrap();
        ctx.dispatcher().led(Rgb::new(9, 8, 7)).unwrap().wait(wait).unwrap();

        let echoes: Vec<_> = status
            .drain()
            .into_iter()
            .filter(|e| e.payload == EventPayload::LedChanged(Rgb::new(9, 8, 7)))
            .collect();
        assert_eq!(echoes.len(), 1);
        ctx.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[test]
    fn discovery_is_used_without_address() {
        let ctx = RollbotContext::builder(Arc::new(SimToy::new()))
            .discovery(Arc::new(SimDiscovery {
                address: Some("found".into()),
            }))
            .build()
            .unwrap();
        ctx.dispatcher()
            .connect()
            .unwrap()
            .wait(Duration::from_secs(2))
            .unwrap();
        assert_eq!(ctx.session().address().as_deref(), Some("found"));
        ctx.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[test]
    fn shutdown_stops_worker_and_disconnects() {
        let ctx = RollbotContext::builder(Arc::new(SimToy::new()))
            .address("sim")
            .build()
            .unwrap();
        ctx.dispatcher()
            .power(true)
            .unwrap()
            .wait(Duration::from_secs(2))
            .unwrap();

        let start = Instant::now();
        let report = ctx.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
        assert!(start.elapsed() < DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(report, ShutdownReport::default());
        assert!(!ctx.worker().is_running());
        assert!(!ctx.dispatcher().is_connected());
    }

    #[test]
    fn config_reaches_the_gate() {
        let ctx = RollbotContext::builder(Arc::new(SimToy::new()))
            .config(CoreConfig {
                max_speed: 90,
                ..CoreConfig::default()
            })
            .build()
            .unwrap();
        assert_eq!(ctx.dispatcher().gate().config().max_speed, 90);
        ctx.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}
