//! [`WatchdogRunner`] – the thread that ticks the health state machine.
//!
//! Once per interval it checks the link through the [`Dispatcher`], asks the
//! dispatcher to reconnect when the link is down (up to the per-cycle cap),
//! polls the battery, and publishes a [`HealthSnapshot`] plus a telemetry
//! snapshot on [`Topic::Telemetry`]. It never touches the session or the
//! safety gate directly. Failures are logged and followed by a short pause.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rollbot_kernel::watchdog::{CyclePlan, Observation, Watchdog};
use rollbot_middleware::Topic;
use rollbot_types::{Event, EventPayload, HealthSnapshot, RollError};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

const SOURCE: &str = "rollbot-runtime::watchdog";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Reconnects attempted per cycle while the link is down.
    pub max_reconnects: u32,
    /// Pause after a failed reconnect before the next try.
    pub failure_pause: Duration,
    /// How long to wait for one reconnect to finish.
    pub connect_wait: Duration,
    pub battery_wait: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_reconnects: 3,
            failure_pause: Duration::from_millis(500),
            connect_wait: Duration::from_secs(12),
            battery_wait: Duration::from_secs(1),
        }
    }
}

/// Handle to the running watchdog thread. Dropping it stops the thread.
pub struct WatchdogRunner {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogRunner {
    /// Spawn the watchdog thread. The first cycle runs after one interval.
    pub fn spawn(dispatcher: Dispatcher, config: WatchdogConfig) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let thread = thread::Builder::new()
            .name("rollbot-watchdog".into())
            .spawn(move || run(dispatcher, config, stop_rx))?;
        info!(
            interval_ms = config.interval.as_millis() as u64,
            max_reconnects = config.max_reconnects,
            "watchdog started"
        );
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it. Returns promptly unless a reconnect
    /// is mid-flight, in which case it waits for that attempt to finish.
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for WatchdogRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(dispatcher: Dispatcher, config: WatchdogConfig, stop: Receiver<()>) {
    let mut wd = Watchdog::new(config.max_reconnects);
    while !pause(&stop, config.interval) {
        match run_cycle(&dispatcher, &mut wd, &config, &stop) {
            Some(snap) => debug!(cycle = snap.cycle, state = ?snap.state, "watchdog cycle"),
            None => break,
        }
    }
    debug!("watchdog stopped");
}

/// Run one cycle. Returns `None` when the watchdog should stop.
pub fn run_cycle(
    dispatcher: &Dispatcher,
    wd: &mut Watchdog,
    config: &WatchdogConfig,
    stop: &Receiver<()>,
) -> Option<HealthSnapshot> {
    if dispatcher.is_shutting_down() {
        return None;
    }

    if let CyclePlan::Reconnect { max_attempts } = wd.begin_cycle(dispatcher.is_connected()) {
        for _ in 0..max_attempts {
            // Someone else restored the link; nothing to attempt.
            if dispatcher.is_connected() {
                break;
            }
            let started = Instant::now();
            match dispatcher.connect().and_then(|h| h.wait(config.connect_wait)) {
                Ok(()) => {
                    wd.record_attempt(Ok(started.elapsed()));
                    break;
                }
                Err(RollError::ShuttingDown | RollError::WorkerUnavailable) => return None,
                Err(e @ (RollError::ConnectInProgress | RollError::Cancelled)) => {
                    debug!(reason = %e, "connect owned elsewhere, skipping reconnect");
                    break;
                }
                Err(e) => {
                    wd.record_attempt(Err(e.to_string()));
                    if pause(stop, config.failure_pause) {
                        return None;
                    }
                }
            }
        }
    }

    let connected = dispatcher.is_connected();
    let battery_pct = if connected {
        dispatcher
            .battery()
            .and_then(|h| h.wait(config.battery_wait))
            .unwrap_or_else(|e| {
                warn!(error = %e, "battery poll failed");
                None
            })
    } else {
        None
    };

    let snap = wd.finish_cycle(Observation {
        connected,
        battery_pct,
        estop_latched: dispatcher.estop_state().latched,
    });
    dispatcher.bus().publish_to(
        Topic::Telemetry,
        Event::new(SOURCE, EventPayload::Health(snap.clone())),
    );
    dispatcher.publish_telemetry();
    Some(snap)
}

/// Sleep for `d` unless asked to stop. Returns `true` when stop was
/// requested.
fn pause(stop: &Receiver<()>, d: Duration) -> bool {
    !matches!(stop.recv_timeout(d), Err(RecvTimeoutError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RollbotContext;
    use rollbot_hal::SimToy;
    use rollbot_types::{CoreConfig, HealthState};
    use std::sync::Arc;

    fn quick() -> WatchdogConfig {
        WatchdogConfig {
            interval: Duration::from_millis(50),
            max_reconnects: 2,
            failure_pause: Duration::from_millis(10),
            connect_wait: Duration::from_secs(3),
            battery_wait: Duration::from_secs(1),
        }
    }

    fn context(toy: &SimToy) -> RollbotContext {
        RollbotContext::builder(Arc::new(toy.clone()))
            .address("sim")
            .config(CoreConfig {
                max_connect_attempts: 1,
                ..CoreConfig::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn reconnects_when_link_is_down() {
        let toy = SimToy::new().with_battery(55);
        let ctx = context(&toy);
        let (_tx, rx) = bounded::<()>(0);
        let mut wd = Watchdog::new(2);

        let snap = run_cycle(ctx.dispatcher(), &mut wd, &quick(), &rx).unwrap();
        assert_eq!(snap.state, HealthState::Healthy);
        assert!(snap.connected);
        assert_eq!(snap.reconnect_attempts, 1);
        assert_eq!(snap.battery_pct, Some(55));
        assert!(snap.mean_connect_ms.is_some());
        ctx.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn persistent_failure_degrades() {
        let toy = SimToy::new().with_connect_failures(10);
        let ctx = context(&toy);
        let (_tx, rx) = bounded::<()>(0);
        let mut wd = Watchdog::new(2);

        let snap = run_cycle(ctx.dispatcher(), &mut wd, &quick(), &rx).unwrap();
        assert_eq!(snap.state, HealthState::Degraded);
        assert_eq!(snap.reconnect_attempts, 2);
        assert_eq!(snap.consecutive_failures, 1);
        assert!(snap.last_error.is_some());
        assert_eq!(snap.battery_pct, None);
        ctx.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn runner_publishes_health_and_stops_promptly() {
        let toy = SimToy::new();
        let ctx = context(&toy);
        let mut telemetry = ctx.bus().subscribe_to(Topic::Telemetry);
        let mut runner = WatchdogRunner::spawn(ctx.dispatcher().clone(), quick()).unwrap();

        thread::sleep(Duration::from_millis(250));
        let start = Instant::now();
        runner.stop();
        assert!(start.elapsed() < Duration::from_millis(500));

        let events = telemetry.drain();
        assert!(
            events
                .iter()
                .any(|e| matches!(e.payload, EventPayload::Health(_)))
        );
        assert!(ctx.dispatcher().is_connected());
        ctx.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn cycle_after_shutdown_stops_the_watchdog() {
        let toy = SimToy::new();
        let ctx = context(&toy);
        ctx.dispatcher().shutdown(Duration::from_secs(1));
        let (_tx, rx) = bounded::<()>(0);
        let mut wd = Watchdog::new(1);
        assert!(run_cycle(ctx.dispatcher(), &mut wd, &quick(), &rx).is_none());
        ctx.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn connect_already_running_is_not_an_attempt() {
        let toy = SimToy::new().with_connect_delay(Duration::from_millis(300));
        let ctx = context(&toy);
        let pending = ctx.dispatcher().connect().unwrap();
        thread::sleep(Duration::from_millis(30));

        let (_tx, rx) = bounded::<()>(0);
        let mut wd = Watchdog::new(2);
        let snap = run_cycle(ctx.dispatcher(), &mut wd, &quick(), &rx).unwrap();
        assert_eq!(snap.reconnect_attempts, 0);
        assert!(snap.last_error.is_none());
        assert_eq!(toy.connect_count(), 0);

        pending.wait(Duration::from_secs(2)).unwrap();
        let snap = run_cycle(ctx.dispatcher(), &mut wd, &quick(), &rx).unwrap();
        assert_eq!(snap.state, HealthState::Healthy);
        assert_eq!(snap.reconnect_attempts, 0);
        assert!(snap.mean_connect_ms.is_none());
        assert_eq!(toy.connect_count(), 1);
        ctx.shutdown(Duration::from_secs(1));
    }
}
