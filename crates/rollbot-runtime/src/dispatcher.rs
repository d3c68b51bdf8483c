//! [`Dispatcher`] – the only entry point for external callers.
//!
//! Every action runs the [`SafetyGate`] synchronously on the caller's thread.
//! Rejected commands never reach the [`Session`]: the rejection is published
//! on [`Topic::CommandStatus`] and returned to the caller. Accepted work is
//! submitted to the [`WorkerLoop`] and recorded in the in-flight set, which
//! entries leave on their own when the task finishes or is cancelled.
//!
//! | Action | Gate | Worker task |
//! |---|---|---|
//! | `power(true)` | none | connect, wake |
//! | `power(false)` | none | sleep, disconnect |
//! | `drive` | full drive validation | roll, then auto-stop after the clamped duration |
//! | `stop` | connectivity | stop |
//! | `led` | connectivity | set LED, echo |
//! | `estop` | none | stop, if connected |
//! | `clear_estop` | latched and connected | none |
//!
//! After [`Dispatcher::shutdown`] every action fails with
//! [`RollError::ShuttingDown`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use rollbot_hal::LedEcho;
use rollbot_kernel::SafetyGate;
use rollbot_middleware::{EventBus, Topic};
use rollbot_types::{
    Ack, Action, Command, Constraint, DriveCommand, EstopState, Event, EventPayload, Rejection,
    Rgb, RollError, SafetyViolation, TelemetrySnapshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::worker::{TaskHandle, WorkerLoop};

const SOURCE: &str = "rollbot-runtime::dispatcher";

// ─────────────────────────────────────────────────────────────────────────────
// In-flight set
// ─────────────────────────────────────────────────────────────────────────────

struct Tracked {
    command: &'static str,
    token: CancellationToken,
}

#[derive(Default)]
struct InFlight {
    tasks: Mutex<HashMap<u64, Tracked>>,
    emptied: Condvar,
    /// Set once by [`InFlight::close`]. Read and written under `tasks`.
    closed: AtomicBool,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Tracked>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a task. Refused once the set is closed.
    fn insert(&self, id: u64, command: &'static str, token: CancellationToken) -> bool {
        let mut tasks = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        tasks.insert(id, Tracked { command, token });
        true
    }

    /// Refuse further inserts and cancel every tracked task, atomically with
    /// respect to [`insert`](Self::insert). Returns `None` if already closed.
    fn close(&self) -> Option<usize> {
        let tasks = self.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        for t in tasks.values() {
            t.token.cancel();
        }
        Some(tasks.len())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remove(&self, id: u64) {
        let mut tasks = self.lock();
        tasks.remove(&id);
        if tasks.is_empty() {
            self.emptied.notify_all();
        }
    }

    /// Cancel every entry matching `filter`. Returns how many were cancelled.
    fn cancel_where(&self, filter: impl Fn(&str) -> bool) -> usize {
        let tokens: Vec<CancellationToken> = self
            .lock()
            .values()
            .filter(|t| filter(t.command))
            .map(|t| t.token.clone())
            .collect();
        for t in &tokens {
            t.cancel();
        }
        tokens.len()
    }

    /// Block until the set is empty or `timeout` elapses. Returns `true` if
    /// it emptied.
    fn wait_empty(&self, timeout: Duration) -> bool {
        let tasks = self.lock();
        let (tasks, _) = self
            .emptied
            .wait_timeout_while(tasks, timeout, |t| !t.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        tasks.is_empty()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Removes its entry from the in-flight set when the task future is dropped,
/// whether it completed or was cancelled.
struct InFlightGuard {
    set: Arc<InFlight>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    worker: Arc<WorkerLoop>,
    session: Arc<Session>,
    gate: SafetyGate,
    bus: EventBus,
    led_echo: Arc<dyn LedEcho>,
    in_flight: Arc<InFlight>,
    next_id: AtomicU64,
}

/// Cloneable handle to the command path. All clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        worker: Arc<WorkerLoop>,
        session: Arc<Session>,
        gate: SafetyGate,
        bus: EventBus,
        led_echo: Arc<dyn LedEcho>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                worker,
                session,
                gate,
                bus,
                led_echo,
                in_flight: Arc::new(InFlight::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn estop_state(&self) -> EstopState {
        self.inner.gate.estop()
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.inner.gate
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Number of submitted commands that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.in_flight.is_closed()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            connected: self.inner.session.is_connected(),
            estop: self.inner.gate.estop(),
            last_cmd_ts: self.inner.gate.last_command_at(),
            battery_pct: self.inner.session.last_battery(),
        }
    }

    /// Publish [`telemetry`](Self::telemetry) on [`Topic::Telemetry`].
    pub fn publish_telemetry(&self) -> TelemetrySnapshot {
        let snap = self.telemetry();
        self.inner.bus.publish_to(
            Topic::Telemetry,
            Event::new(SOURCE, EventPayload::Telemetry(snap.clone())),
        );
        snap
    }

    // ── Command surface ─────────────────────────────────────────────────────

    /// Route one command from the command surface.
    ///
    /// # Errors
    ///
    /// The rejection or submission failure of the routed action. Rejections
    /// are also published with the command's correlation id.
    pub fn handle(&self, cmd: &Command) -> Result<Ack, RollError> {
        let corr = cmd.correlation_id.as_deref();
        let mut ack = Ack {
            command: cmd.action.name().to_string(),
            correlation_id: cmd.correlation_id.clone(),
            task_id: None,
            drive: None,
        };
        debug!(command = %ack.command, correlation_id = ?corr, "command received");

        match &cmd.action {
            Action::Power { on } => ack.task_id = Some(self.power(*on)?.id()),
            Action::Drive {
                speed,
                heading,
                duration_ms,
            } => {
                let (drive, handle) = self.drive_with(*speed, *heading, *duration_ms, corr)?;
                ack.drive = Some(drive);
                ack.task_id = Some(handle.id());
            }
            Action::Stop => ack.task_id = Some(self.stop_with(corr)?.id()),
            Action::Led(color) => ack.task_id = Some(self.led_with(*color, corr)?.id()),
            Action::Estop { reason } => {
                let reason = reason.as_deref().unwrap_or("estop requested");
                ack.task_id = self.estop(reason)?.map(|h| h.id());
            }
            Action::ClearEstop => {
                let (cleared, reason) = self.clear_estop_with(corr)?;
                if !cleared {
                    return Err(RollError::EstopNotCleared(reason));
                }
            }
        }
        Ok(ack)
    }

    /// Connect and wake (`on`), or sleep and disconnect. Not blocked by the
    /// estop.
    pub fn power(&self, on: bool) -> Result<TaskHandle<()>, RollError> {
        self.ensure_running()?;
        let session = Arc::clone(&self.inner.session);
        if on {
            self.track("power", async move {
                session.connect().await?;
                session.wake().await
            })
        } else {
            self.inner.gate.cancel_auto_stop();
            self.track("power", async move {
                if let Err(e) = session.sleep().await {
                    debug!(error = %e, "sleep before power off failed");
                }
                session.disconnect().await;
                Ok(())
            })
        }
    }

    /// Connect without waking. Used by the watchdog.
    pub fn connect(&self) -> Result<TaskHandle<()>, RollError> {
        self.ensure_running()?;
        let session = Arc::clone(&self.inner.session);
        self.track("connect", async move { session.connect().await })
    }

    /// Poll the battery. The task yields `None` when offline or on failure.
    pub fn battery(&self) -> Result<TaskHandle<Option<u8>>, RollError> {
        self.ensure_running()?;
        let session = Arc::clone(&self.inner.session);
        self.track("battery", async move { Ok(session.battery().await) })
    }

    /// Validate, clamp and submit a drive, then arm the auto-stop for the
    /// clamped duration.
    pub fn drive(
        &self,
        speed: f64,
        heading: f64,
        duration_ms: Option<f64>,
    ) -> Result<(DriveCommand, TaskHandle<()>), RollError> {
        self.drive_with(speed, heading, duration_ms, None)
    }

    /// Stop now. Allowed while the estop is latched.
    pub fn stop(&self) -> Result<TaskHandle<()>, RollError> {
        self.stop_with(None)
    }

    /// Set the main LED. Allowed while the estop is latched.
    pub fn led(&self, color: Rgb) -> Result<TaskHandle<()>, RollError> {
        self.led_with(color, None)
    }

    /// Latch the estop, cancel queued motion and the auto-stop, and stop the
    /// toy if it is connected.
    pub fn estop(&self, reason: &str) -> Result<Option<TaskHandle<()>>, RollError> {
        self.ensure_running()?;
        let inner = &self.inner;
        if inner.gate.activate_estop(reason) {
            inner.bus.publish_to(
                Topic::SystemAlerts,
                Event::new(
                    SOURCE,
                    EventPayload::EstopActivated {
                        reason: reason.to_string(),
                    },
                ),
            );
        }
        let cancelled = inner.in_flight.cancel_where(|c| c == "drive");
        if cancelled > 0 {
            info!(cancelled, "estop cancelled queued drives");
        }
        if !inner.session.is_connected() {
            return Ok(None);
        }
        let session = Arc::clone(&inner.session);
        self.track("estop", async move { session.stop().await })
            .map(Some)
    }

    /// Clear the estop if latched and connected. Returns `(cleared, reason)`.
    pub fn clear_estop(&self) -> Result<(bool, String), RollError> {
        self.clear_estop_with(None)
    }

    /// Stop accepting commands, cancel everything in flight, wait for it to
    /// wind down and disconnect. Returns how many commands were cancelled.
    pub fn shutdown(&self, timeout: Duration) -> usize {
        let inner = &self.inner;
        let Some(cancelled) = inner.in_flight.close() else {
            return 0;
        };
        let deadline = Instant::now() + timeout;
        inner.gate.cancel_auto_stop();

        if !inner.in_flight.wait_empty(timeout) {
            warn!(
                remaining = inner.in_flight.len(),
                "in-flight commands did not finish before shutdown deadline"
            );
        }

        let session = Arc::clone(&inner.session);
        match inner.worker.submit(async move {
            session.disconnect().await;
            Ok(())
        }) {
            Ok(h) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if let Err(e) = h.wait(remaining) {
                    warn!(error = %e, "disconnect during shutdown did not complete");
                }
            }
            Err(e) => debug!(error = %e, "worker gone, skipping disconnect"),
        }
        info!(cancelled, "dispatcher shut down");
        cancelled
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn drive_with(
        &self,
        speed: f64,
        heading: f64,
        duration_ms: Option<f64>,
        corr: Option<&str>,
    ) -> Result<(DriveCommand, TaskHandle<()>), RollError> {
        self.ensure_running()?;
        let cmd = self
            .inner
            .gate
            .validate_drive(speed, heading, duration_ms)
            .map_err(|r| self.reject("drive", corr, r))?;

        // An estop latched between validation and this task running must
        // still win, so the latch is checked again on the worker.
        let owner = Arc::downgrade(&self.inner);
        let handle = self.track("drive", async move {
            let session = {
                let Some(inner) = owner.upgrade() else {
                    return Err(RollError::Cancelled);
                };
                let estop = inner.gate.estop();
                if estop.latched {
                    debug!(reason = %estop.reason, "queued drive dropped by estop");
                    return Err(SafetyViolation::new(Constraint::EstopActive, estop.reason).into());
                }
                Arc::clone(&inner.session)
            };
            session.roll(cmd.speed, cmd.heading, cmd.duration()).await
        })?;

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .gate
            .schedule_auto_stop(cmd.duration(), move || auto_stop(weak));
        debug!(
            speed = cmd.speed,
            heading = cmd.heading,
            duration_ms = cmd.duration_ms,
            "drive accepted"
        );
        Ok((cmd, handle))
    }

    fn stop_with(&self, corr: Option<&str>) -> Result<TaskHandle<()>, RollError> {
        self.ensure_running()?;
        self.inner
            .gate
            .validate_link()
            .map_err(|r| self.reject("stop", corr, r))?;
        self.inner.gate.cancel_auto_stop();
        let session = Arc::clone(&self.inner.session);
        self.track("stop", async move { session.stop().await })
    }

    fn led_with(&self, color: Rgb, corr: Option<&str>) -> Result<TaskHandle<()>, RollError> {
        self.ensure_running()?;
        self.inner
            .gate
            .validate_link()
            .map_err(|r| self.reject("led", corr, r))?;
        let session = Arc::clone(&self.inner.session);
        let echo = Arc::clone(&self.inner.led_echo);
        self.track("led", async move {
            session.set_led(color).await?;
            echo.echo(color);
            Ok(())
        })
    }

    fn clear_estop_with(&self, corr: Option<&str>) -> Result<(bool, String), RollError> {
        self.ensure_running()?;
        let (cleared, reason) = self.inner.gate.clear_estop();
        if cleared {
            self.inner
                .bus
                .publish_to(Topic::SystemAlerts, Event::new(SOURCE, EventPayload::EstopCleared));
        } else {
            self.publish_rejection("clear_estop", corr, "estop_not_cleared", reason.clone());
        }
        Ok((cleared, reason))
    }

    fn ensure_running(&self) -> Result<(), RollError> {
        if self.is_shutting_down() {
            Err(RollError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn reject(&self, command: &str, corr: Option<&str>, rejection: Rejection) -> RollError {
        info!(command, reason = rejection.tag(), value = %rejection.value(), "command rejected");
        self.publish_rejection(command, corr, rejection.tag(), rejection.value());
        rejection.into()
    }

    fn publish_rejection(&self, command: &str, corr: Option<&str>, reason: &str, value: String) {
        self.inner.bus.publish_to(
            Topic::CommandStatus,
            Event::new(
                SOURCE,
                EventPayload::CommandRejected {
                    command: command.to_string(),
                    reason: reason.to_string(),
                    value,
                    correlation_id: corr.map(str::to_string),
                },
            ),
        );
    }

    fn track<T, F>(&self, command: &'static str, fut: F) -> Result<TaskHandle<T>, RollError>
    where
        F: Future<Output = Result<T, RollError>> + Send + 'static,
        T: Send + 'static,
    {
        track(&self.inner, command, fut)
    }
}

/// Submit `fut` to the worker and record it in the in-flight set. The entry
/// is inserted before submission so that completion can never race ahead of
/// it.
fn track<T, F>(inner: &Arc<Inner>, command: &'static str, fut: F) -> Result<TaskHandle<T>, RollError>
where
    F: Future<Output = Result<T, RollError>> + Send + 'static,
    T: Send + 'static,
{
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let token = inner.worker.child_token();
    if !inner.in_flight.insert(id, command, token.clone()) {
        return Err(RollError::ShuttingDown);
    }
    let guard = InFlightGuard {
        set: Arc::clone(&inner.in_flight),
        id,
    };
    let bus = inner.bus.clone();

    inner.worker.submit_with_token(
        async move {
            let _guard = guard;
            let result = fut.await;
            match &result {
                Err(RollError::Rejected(v)) => {
                    info!(command, reason = %v.constraint, "command rejected on the worker");
                    bus.publish_to(
                        Topic::CommandStatus,
                        Event::new(
                            SOURCE,
                            EventPayload::CommandRejected {
                                command: command.to_string(),
                                reason: v.constraint.as_str().to_string(),
                                value: v.value.clone(),
                                correlation_id: None,
                            },
                        ),
                    );
                }
                Err(e) if !e.is_cancelled() => {
                    warn!(command, error = %e, "command failed");
                    bus.publish_to(
                        Topic::CommandStatus,
                        Event::new(
                            SOURCE,
                            EventPayload::CommandFailed {
                                command: command.to_string(),
                                error: e.to_string(),
                            },
                        ),
                    );
                }
                _ => {}
            }
            result
        },
        token,
    )
}

/// Auto-stop timer callback. Runs on the timer thread.
fn auto_stop(weak: Weak<Inner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.in_flight.is_closed() {
        return;
    }
    let session = Arc::clone(&inner.session);
    match track(&inner, "auto_stop", async move { session.stop().await }) {
        Ok(h) => debug!(task_id = h.id(), "auto-stop submitted"),
        Err(e) => warn!(error = %e, "auto-stop could not be submitted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectPolicy;
    use rollbot_hal::{NoEcho, SimCall, SimToy};
    use rollbot_types::SafetyConfig;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(2);

    struct Rig {
        toy: SimToy,
        worker: Arc<WorkerLoop>,
        dispatcher: Dispatcher,
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.dispatcher.shutdown(Duration::from_millis(500));
            self.worker.stop(Duration::from_millis(500));
        }
    }

    fn rig(min_interval_ms: u64) -> Rig {
        let toy = SimToy::new();
        let worker = Arc::new(WorkerLoop::new("dispatcher-test"));
        worker.start().unwrap();
        let session = Arc::new(Session::new(
            Arc::new(toy.clone()),
            Some("sim".into()),
            None,
            ConnectPolicy::default(),
        ));
        let gate = SafetyGate::with_link(
            SafetyConfig {
                min_interval: Duration::from_millis(min_interval_ms),
                max_duration: Duration::from_millis(2000),
                max_speed: 180,
                warm_start: true,
            },
            session.link_status(),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&worker),
            session,
            gate,
            EventBus::default(),
            Arc::new(NoEcho),
        );
        Rig {
            toy,
            worker,
            dispatcher,
        }
    }

    fn powered(min_interval_ms: u64) -> Rig {
        let r = rig(min_interval_ms);
        r.dispatcher.power(true).unwrap().wait(WAIT).unwrap();
        r
    }

    #[test]
    fn drive_while_offline_is_rejected_and_published() {
        let r = rig(0);
        let mut status = r.dispatcher.bus().subscribe_to(Topic::CommandStatus);
        let err = r.dispatcher.drive(50.0, 0.0, None).unwrap_err();
        assert!(matches!(
            err,
            RollError::Rejected(ref v) if v.constraint == Constraint::DeviceOffline
        ));
        let ev = status.try_recv().expect("rejection published");
        assert!(matches!(
            ev.payload,
            EventPayload::CommandRejected { ref command, ref reason, .. }
                if command == "drive" && reason == "device_offline"
        ));
        assert!(r.toy.calls().is_empty(), "rejected command reached the device");
    }

    #[test]
    fn power_on_connects_and_wakes() {
        let r = powered(0);
        assert!(r.dispatcher.is_connected());
        assert_eq!(
            r.toy.calls(),
            vec![SimCall::Connect("sim".into()), SimCall::Wake]
        );
    }

    #[test]
    fn accepted_drive_rolls_clamped_then_auto_stops() {
        let r = powered(0);
        let (cmd, h) = r.dispatcher.drive(300.0, 400.0, Some(100.0)).unwrap();
        assert_eq!((cmd.speed, cmd.heading, cmd.duration_ms), (180, 40, 100));
        h.wait(WAIT).unwrap();

        thread::sleep(Duration::from_millis(300));
        let calls = r.toy.calls();
        assert!(calls.contains(&SimCall::Roll {
            speed: 180,
            heading: 40,
            duration_ms: 100
        }));
        assert_eq!(calls.last(), Some(&SimCall::Stop));
        assert_eq!(r.dispatcher.in_flight(), 0);
    }

    #[test]
    fn estop_blocks_drive_but_not_stop() {
        let r = powered(0);
        let mut alerts = r.dispatcher.bus().subscribe_to(Topic::SystemAlerts);
        let h = r.dispatcher.estop("operator").unwrap().expect("stop submitted");
        h.wait(WAIT).unwrap();
        assert!(matches!(
            alerts.try_recv().map(|e| e.payload),
            Some(EventPayload::EstopActivated { .. })
        ));

        let err = r.dispatcher.drive(50.0, 0.0, Some(500.0)).unwrap_err();
        assert!(matches!(
            err,
            RollError::Rejected(ref v) if v.constraint == Constraint::EstopActive
        ));
        r.dispatcher.stop().unwrap().wait(WAIT).unwrap();
        r.dispatcher.led(Rgb::new(255, 0, 0)).unwrap().wait(WAIT).unwrap();
    }

    #[test]
    fn estop_cancels_pending_auto_stop() {
        let r = powered(0);
        r.dispatcher.drive(50.0, 0.0, Some(150.0)).unwrap().1.wait(WAIT).unwrap();
        assert!(r.dispatcher.gate().auto_stop_pending());
        r.dispatcher.estop("halt").unwrap();
        assert!(!r.dispatcher.gate().auto_stop_pending());
    }

    #[test]
    fn estop_clear_drive_scenario() {
        let r = powered(50);
        r.dispatcher.drive(50.0, 0.0, Some(500.0)).unwrap();
        r.dispatcher.estop("mid-sequence").unwrap();
        assert!(r.dispatcher.drive(50.0, 0.0, Some(500.0)).is_err());

        let (cleared, _) = r.dispatcher.clear_estop().unwrap();
        assert!(cleared);
        thread::sleep(Duration::from_millis(70));
        assert!(r.dispatcher.drive(50.0, 0.0, Some(500.0)).is_ok());
    }

    #[test]
    fn clear_estop_while_disconnected_keeps_latch() {
        let r = rig(0);
        r.dispatcher.estop("bump").unwrap();
        assert_eq!(
            r.dispatcher.clear_estop().unwrap(),
            (false, "bump".to_string())
        );
        assert!(r.dispatcher.estop_state().latched);
    }

    #[test]
    fn handle_routes_command_and_carries_correlation_id() {
        let r = powered(0);
        let cmd = Command::new(Action::Drive {
            speed: 90.0,
            heading: -90.0,
            duration_ms: None,
        })
        .with_correlation_id("c-7");
        let ack = r.dispatcher.handle(&cmd).unwrap();
        assert_eq!(ack.command, "drive");
        assert_eq!(ack.correlation_id.as_deref(), Some("c-7"));
        assert_eq!(ack.drive.map(|d| (d.heading, d.duration_ms)), Some((270, 2000)));
        assert!(ack.task_id.is_some());
    }

    #[test]
    fn handle_clear_without_latch_is_an_error() {
        let r = powered(0);
        let err = r.dispatcher.handle(&Command::new(Action::ClearEstop)).unwrap_err();
        assert!(matches!(err, RollError::EstopNotCleared(_)));
    }

    #[test]
    fn led_is_echoed_once() {
        let toy = SimToy::new();
        let worker = Arc::new(WorkerLoop::new("led-test"));
        worker.start().unwrap();
        let session = Arc::new(Session::new(
            Arc::new(toy.clone()),
            Some("sim".into()),
            None,
            ConnectPolicy::default(),
        ));
        let gate = SafetyGate::with_link(SafetyConfig::default(), session.link_status());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let d = Dispatcher::new(
            Arc::clone(&worker),
            session,
            gate,
            EventBus::default(),
            Arc::new(move |c: Rgb| sink.lock().unwrap().push(c)),
        );
        d.power(true).unwrap().wait(WAIT).unwrap();
        d.led(Rgb::new(0, 255, 0)).unwrap().wait(WAIT).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[Rgb::new(0, 255, 0)]);
        d.shutdown(WAIT);
        worker.stop(WAIT);
    }

    #[test]
    fn failed_command_is_published() {
        let r = powered(0);
        let mut status = r.dispatcher.bus().subscribe_to(Topic::CommandStatus);
        r.toy.fail_ops(2);
        let err = r.dispatcher.stop().unwrap().wait(WAIT).unwrap_err();
        assert!(matches!(err, RollError::Device { op: "stop", .. }));
        assert!(matches!(
            status.try_recv().map(|e| e.payload),
            Some(EventPayload::CommandFailed { ref command, .. }) if command == "stop"
        ));
    }

    #[test]
    fn shutdown_cancels_in_flight_and_refuses_new_work() {
        // A slow connect keeps one command in flight.
        let slow = SimToy::new().with_connect_delay(Duration::from_secs(3));
        let worker = Arc::new(WorkerLoop::new("shutdown-test"));
        worker.start().unwrap();
        let session = Arc::new(Session::new(
            Arc::new(slow),
            Some("sim".into()),
            None,
            ConnectPolicy::default(),
        ));
        let gate = SafetyGate::with_link(SafetyConfig::default(), session.link_status());
        let d = Dispatcher::new(
            Arc::clone(&worker),
            session,
            gate,
            EventBus::default(),
            Arc::new(NoEcho),
        );
        let h = d.connect().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(d.in_flight(), 1);

        let start = Instant::now();
        assert_eq!(d.shutdown(Duration::from_secs(2)), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(d.in_flight(), 0);
        assert_eq!(h.wait(WAIT), Err(RollError::Cancelled));
        assert!(matches!(d.power(true), Err(RollError::ShuttingDown)));
        assert_eq!(d.shutdown(WAIT), 0);
        worker.stop(WAIT);
    }

    #[test]
    fn estop_during_drive_validation_keeps_the_toy_still() {
        let toy = SimToy::new();
        let worker = Arc::new(WorkerLoop::new("estop-race-test"));
        worker.start().unwrap();
        let session = Arc::new(Session::new(
            Arc::new(toy.clone()),
            Some("sim".into()),
            None,
            ConnectPolicy::default(),
        ));
        // The link check stalls on request, holding a drive between its
        // estop check and being queued.
        let slow = Arc::new(AtomicBool::new(false));
        let gate = SafetyGate::new(
            SafetyConfig {
                min_interval: Duration::ZERO,
                max_duration: Duration::from_millis(2000),
                max_speed: 180,
                warm_start: true,
            },
            {
                let session = Arc::clone(&session);
                let slow = Arc::clone(&slow);
                move || {
                    if slow.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(100));
                    }
                    session.is_connected()
                }
            },
        );
        let d = Arc::new(Dispatcher::new(
            Arc::clone(&worker),
            session,
            gate,
            EventBus::default(),
            Arc::new(NoEcho),
        ));
        d.power(true).unwrap().wait(WAIT).unwrap();
        let mut status = d.bus().subscribe_to(Topic::CommandStatus);
        slow.store(true, Ordering::Release);

        let driver = {
            let d = Arc::clone(&d);
            thread::spawn(move || d.drive(100.0, 0.0, Some(200.0)))
        };
        thread::sleep(Duration::from_millis(30));
        d.estop("operator").unwrap().unwrap().wait(WAIT).unwrap();

        let (_, handle) = driver.join().unwrap().unwrap();
        match handle.wait(WAIT) {
            Err(RollError::Rejected(v)) => assert_eq!(v.constraint, Constraint::EstopActive),
            other => panic!("queued drive ran under estop: {other:?}"),
        }

        // Past the drive's duration: no roll, and only the estop's stop.
        thread::sleep(Duration::from_millis(400));
        let calls = toy.calls();
        assert!(!calls.iter().any(|c| matches!(c, SimCall::Roll { .. })));
        assert_eq!(calls.iter().filter(|c| **c == SimCall::Stop).count(), 1);
        assert!(status.drain().iter().any(|e| matches!(
            &e.payload,
            EventPayload::CommandRejected { command, reason, .. }
                if command == "drive" && reason == "estop_active"
        )));

        d.shutdown(WAIT);
        worker.stop(WAIT);
    }

    #[test]
    fn closed_in_flight_set_refuses_inserts() {
        let set = InFlight::default();
        let token = CancellationToken::new();
        assert!(set.insert(1, "drive", token.clone()));
        assert_eq!(set.close(), Some(1));
        assert!(token.is_cancelled());
        assert_eq!(set.close(), None);

        let late = CancellationToken::new();
        assert!(!set.insert(2, "stop", late.clone()));
        assert_eq!(set.len(), 1);
        assert!(!late.is_cancelled());
    }

    #[test]
    fn tracking_after_shutdown_is_refused() {
        let r = rig(0);
        r.dispatcher.shutdown(WAIT);
        let tracked = track(&r.dispatcher.inner, "stop", async { Ok(()) });
        assert!(matches!(tracked, Err(RollError::ShuttingDown)));
        assert_eq!(r.dispatcher.in_flight(), 0);
    }
}
