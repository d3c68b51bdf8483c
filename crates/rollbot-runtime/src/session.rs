//! [`Session`] – connection lifecycle and per-operation retry for one toy.
//!
//! All async methods are meant to run on the [`WorkerLoop`] thread; the
//! session writes its connection state and metrics only from there.
//! [`Session::is_connected`], [`Session::state`] and [`Session::metrics`] are
//! plain reads and safe from any thread.
//!
//! # Retry policy
//!
//! | Path | Attempts | Delay between attempts |
//! |---|---|---|
//! | `connect` | `max_attempts` (default 2), each under `attempt_timeout` (default 5 s) | jittered exponential [`Backoff`] |
//! | device operations | 2 | fixed 100 ms |
//!
//! [`WorkerLoop`]: crate::worker::WorkerLoop

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rollbot_hal::{Discovery, ToyConnector, ToyLink};
use rollbot_kernel::LinkStatus;
use rollbot_types::{ConnectionState, CoreConfig, DeviceError, Rgb, RollError, SessionMetrics};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;

/// Hard ceiling on a single roll, applied beneath the safety gate's own cap.
pub const MAX_ROLL: Duration = Duration::from_millis(5000);
/// Attempts per device operation.
pub const OP_ATTEMPTS: u32 = 2;
/// Pause between device operation attempts.
pub const OP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connect retry parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }
}

impl ConnectPolicy {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            max_attempts: config.max_connect_attempts.max(1),
            attempt_timeout: config.connect_timeout(),
            backoff: Backoff::default(),
        }
    }

    /// Upper bound on how long one `connect()` can take.
    pub fn budget(&self) -> Duration {
        self.attempt_timeout * self.max_attempts + self.backoff.worst_case(self.max_attempts)
    }
}

#[derive(Default)]
struct LinkSlot {
    state: ConnectionState,
    link: Option<Arc<dyn ToyLink>>,
    /// Bumped by every `connect` and `disconnect`. A connect only publishes
    /// its link while the epoch it started with is still current.
    epoch: u64,
}

/// The single device connection.
pub struct Session {
    connector: Arc<dyn ToyConnector>,
    discovery: Option<Arc<dyn Discovery>>,
    address: Mutex<Option<String>>,
    policy: ConnectPolicy,
    slot: Mutex<LinkSlot>,
    metrics: Mutex<SessionMetrics>,
    last_battery: Mutex<Option<u8>>,
}

impl Session {
    /// `address` wins over `discovery` when both are given.
    pub fn new(
        connector: Arc<dyn ToyConnector>,
        address: Option<String>,
        discovery: Option<Arc<dyn Discovery>>,
        policy: ConnectPolicy,
    ) -> Self {
        Self {
            connector,
            discovery,
            address: Mutex::new(address),
            policy,
            slot: Mutex::new(LinkSlot::default()),
            metrics: Mutex::new(SessionMetrics::default()),
            last_battery: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &ConnectPolicy {
        &self.policy
    }

    /// The configured or last discovered address.
    pub fn address(&self) -> Option<String> {
        lock(&self.address).clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.slot).state
    }

    /// `true` only while the state is `Connected` and the link is alive.
    pub fn is_connected(&self) -> bool {
        let slot = lock(&self.slot);
        slot.state == ConnectionState::Connected
            && slot.link.as_ref().is_some_and(|l| l.is_alive())
    }

    /// Link status view for the safety gate.
    pub fn link_status(self: &Arc<Self>) -> Arc<dyn LinkStatus> {
        let session = Arc::clone(self);
        Arc::new(move || session.is_connected())
    }

    pub fn metrics(&self) -> SessionMetrics {
        lock(&self.metrics).clone()
    }

    /// Battery level from the most recent successful poll.
    pub fn last_battery(&self) -> Option<u8> {
        *lock(&self.last_battery)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Connect, retrying with backoff. A live connection is left as is.
    ///
    /// # Errors
    ///
    /// [`RollError::ConnectInProgress`] if another connect is running, or
    /// [`RollError::Connection`] carrying the last underlying error once every
    /// attempt has failed.
    pub async fn connect(&self) -> Result<(), RollError> {
        let epoch = {
            let mut slot = lock(&self.slot);
            match slot.state {
                ConnectionState::Connecting => return Err(RollError::ConnectInProgress),
                ConnectionState::Connected if slot.link.as_ref().is_some_and(|l| l.is_alive()) => {
                    return Ok(());
                }
                _ => {}
            }
            if slot.link.take().is_some() {
                debug!("discarding stale link");
            }
            slot.state = ConnectionState::Connecting;
            slot.epoch += 1;
            slot.epoch
        };
        let _reset = ConnectingGuard {
            session: self,
            epoch,
        };

        let address = match self.resolve_address().await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "no device address");
                self.record_failure(0, &e);
                self.set_disconnected_at(epoch);
                return Err(RollError::Connection {
                    attempts: 0,
                    source: e,
                });
            }
        };

        let started = Instant::now();
        let max = self.policy.max_attempts.max(1);
        let mut last_err = DeviceError::NotFound(address.clone());
        for attempt in 1..=max {
            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, self.connector.connect(&address))
                    .await
                    .unwrap_or(Err(DeviceError::Timeout(self.policy.attempt_timeout)));

            match outcome {
                Ok(link) => {
                    let elapsed = started.elapsed();
                    let published = {
                        let mut slot = lock(&self.slot);
                        if slot.epoch == epoch {
                            slot.link = Some(Arc::clone(&link));
                            slot.state = ConnectionState::Connected;
                        }
                        slot.epoch == epoch
                    };
                    if !published {
                        info!(%address, "disconnect requested while connecting, dropping link");
                        if let Err(e) = link.disconnect().await {
                            debug!(error = %e, "dropping superseded link failed");
                        }
                        return Err(RollError::Cancelled);
                    }
                    self.record_success(attempt, elapsed);
                    info!(
                        %address,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "connected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(%address, attempt, max, error = %e, "connect attempt failed");
                    self.record_failure(attempt, &e);
                    last_err = e;
                }
            }
            if attempt < max {
                tokio::time::sleep(self.policy.backoff.delay(attempt)).await;
            }
        }

        self.set_disconnected_at(epoch);
        Err(RollError::Connection {
            attempts: max,
            source: last_err,
        })
    }

    /// Tear the link down. Teardown errors are logged, never returned.
    pub async fn disconnect(&self) {
        let (epoch, link) = {
            let mut slot = lock(&self.slot);
            slot.state = ConnectionState::Disconnecting;
            slot.epoch += 1;
            (slot.epoch, slot.link.take())
        };
        if let Some(link) = link {
            match tokio::time::timeout(self.policy.attempt_timeout, link.disconnect()).await {
                Ok(Ok(())) => info!(address = link.address(), "disconnected"),
                Ok(Err(e)) => warn!(error = %e, "disconnect failed, dropping link"),
                Err(_) => warn!("disconnect timed out, dropping link"),
            }
        }
        self.set_disconnected_at(epoch);
    }

    // ── Device operations ───────────────────────────────────────────────────

    pub async fn wake(&self) -> Result<(), RollError> {
        self.op("wake", |l| async move { l.wake().await }).await
    }

    pub async fn sleep(&self) -> Result<(), RollError> {
        self.op("sleep", |l| async move { l.sleep().await }).await
    }

    pub async fn set_led(&self, color: Rgb) -> Result<(), RollError> {
        self.op("set_led", move |l| async move { l.set_main_led(color).await })
            .await
    }

    /// Roll for at most [`MAX_ROLL`].
    pub async fn roll(&self, speed: u8, heading: u16, duration: Duration) -> Result<(), RollError> {
        let duration = duration.min(MAX_ROLL);
        self.op("roll", move |l| async move { l.roll(speed, heading, duration).await })
            .await
    }

    pub async fn stop(&self) -> Result<(), RollError> {
        self.op("stop", |l| async move { l.stop().await }).await
    }

    /// Battery percentage, or `None` when offline or the read failed.
    pub async fn battery(&self) -> Option<u8> {
        if !self.is_connected() {
            return None;
        }
        match self.op("battery", |l| async move { l.battery_percent().await }).await {
            Ok(pct) => {
                *lock(&self.last_battery) = Some(pct);
                Some(pct)
            }
            Err(e) => {
                warn!(error = %e, "battery read failed");
                None
            }
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    async fn resolve_address(&self) -> Result<String, DeviceError> {
        if let Some(a) = self.address() {
            return Ok(a);
        }
        let Some(discovery) = &self.discovery else {
            return Err(DeviceError::NotFound("no address configured".into()));
        };
        let found = tokio::time::timeout(self.policy.attempt_timeout, discovery.discover())
            .await
            .unwrap_or(Err(DeviceError::Timeout(self.policy.attempt_timeout)))?;
        info!(address = %found, "device discovered");
        *lock(&self.address) = Some(found.clone());
        Ok(found)
    }

    async fn op<T, F, Fut>(&self, name: &'static str, f: F) -> Result<T, RollError>
    where
        F: Fn(Arc<dyn ToyLink>) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let link = self.live_link().ok_or(RollError::DeviceNotConnected)?;
        let mut last_err = DeviceError::LinkClosed;
        for attempt in 1..=OP_ATTEMPTS {
            match f(Arc::clone(&link)).await {
                Ok(v) => return Ok(v),
                Err(DeviceError::LinkClosed) => {
                    self.drop_link(&link);
                    return Err(RollError::Device {
                        op: name,
                        source: DeviceError::LinkClosed,
                    });
                }
                Err(e) => {
                    debug!(op = name, attempt, error = %e, "device operation failed");
                    last_err = e;
                }
            }
            if attempt < OP_ATTEMPTS {
                tokio::time::sleep(OP_RETRY_DELAY).await;
            }
        }
        warn!(op = name, error = %last_err, "device operation gave up");
        Err(RollError::Device {
            op: name,
            source: last_err,
        })
    }

    fn live_link(&self) -> Option<Arc<dyn ToyLink>> {
        let slot = lock(&self.slot);
        if slot.state != ConnectionState::Connected {
            return None;
        }
        slot.link.as_ref().filter(|l| l.is_alive()).cloned()
    }

    /// Forget `link` if it is still the current one.
    fn drop_link(&self, link: &Arc<dyn ToyLink>) {
        let mut slot = lock(&self.slot);
        if slot.link.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, link)) {
            warn!(address = link.address(), "link dropped by peer");
            slot.link = None;
            slot.state = ConnectionState::Disconnected;
        }
    }

    /// Clear the link, unless a later connect or disconnect owns the slot.
    fn set_disconnected_at(&self, epoch: u64) {
        let mut slot = lock(&self.slot);
        if slot.epoch == epoch {
            slot.link = None;
            slot.state = ConnectionState::Disconnected;
        }
    }

    fn record_success(&self, attempts: u32, elapsed: Duration) {
        let mut m = lock(&self.metrics);
        m.attempts = attempts;
        m.successful_connects += 1;
        m.last_connect_duration = Some(elapsed);
        let n = m.successful_connects;
        m.mean_connect_duration = Some(match m.mean_connect_duration {
            Some(mean) if n > 1 => {
                let mean = mean.as_secs_f64();
                Duration::from_secs_f64(mean + (elapsed.as_secs_f64() - mean) / f64::from(n))
            }
            _ => elapsed,
        });
    }

    fn record_failure(&self, attempts: u32, err: &DeviceError) {
        let mut m = lock(&self.metrics);
        m.attempts = attempts;
        m.last_error = Some(err.to_string());
    }
}

/// Puts a connect that was dropped mid-flight back to `Disconnected`.
struct ConnectingGuard<'a> {
    session: &'a Session,
    epoch: u64,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(&self.session.slot);
        if slot.epoch == self.epoch && slot.state == ConnectionState::Connecting {
            slot.link = None;
            slot.state = ConnectionState::Disconnected;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
