//! [`SafetyGate`] – the synchronous check every motion command passes through
//! before any work reaches the device worker.
//!
//! [`SafetyGate::validate_drive`] applies its checks in a fixed order:
//!
//! 1. **Estop** – a latched estop rejects with `estop_active`, before any
//!    other check.
//! 2. **Connectivity** – an offline device rejects with `device_offline`.
//! 3. **Input** – non-finite numbers are a [`ValidationError`].
//! 4. **Rate** – a command arriving within `min_interval` of the previous
//!    accepted one rejects with `rate_limit`.
//! 5. **Clamp** – speed, heading and duration are forced into range. Clamping
//!    never rejects.
//!
//! Only a command that passes every step advances the rate-limit clock.
//!
//! The gate also owns the estop latch and the single pending auto-stop timer.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use rollbot_kernel::SafetyGate;
//! use rollbot_types::SafetyConfig;
//!
//! let config = SafetyConfig {
//!     max_speed: 180,
//!     max_duration: Duration::from_millis(2000),
//!     ..SafetyConfig::default()
//! };
//! let gate = SafetyGate::new(config, || true);
//!
//! let cmd = gate.validate_drive(300.0, 400.0, Some(6000.0)).unwrap();
//! assert_eq!((cmd.speed, cmd.heading, cmd.duration_ms), (180, 40, 2000));
//! ```

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rollbot_types::{
    Constraint, DriveCommand, EstopState, Rejection, SafetyConfig, SafetyViolation,
    ValidationError,
};
use tracing::{debug, info, warn};

use crate::auto_stop::AutoStop;

/// Reports whether the device link is currently up. Must be cheap.
pub trait LinkStatus: Send + Sync {
    fn is_connected(&self) -> bool;
}

impl<F> LinkStatus for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_connected(&self) -> bool {
        self()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pure helpers
// ────────────────────────────────────────────────────────────────────────────

/// Clamp `speed` into `[0, max]` and round to the nearest step.
pub fn clamp_speed(speed: f64, max: u8) -> u8 {
    speed.clamp(0.0, f64::from(max)).round() as u8
}

/// Wrap `heading` (degrees, any sign) into `[0, 360)`.
pub fn wrap_heading(heading: f64) -> u16 {
    heading.rem_euclid(360.0).round() as u16 % 360
}

/// Clamp a requested duration into `[0, max]`. `None` means `max`.
pub fn clamp_duration(duration_ms: Option<f64>, max: Duration) -> Duration {
    let max_ms = max.as_millis() as f64;
    match duration_ms {
        Some(ms) => Duration::from_millis(ms.clamp(0.0, max_ms).round() as u64),
        None => max,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyGate
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Accepted {
    at: Instant,
    wall: DateTime<Utc>,
}

/// Validation, rate limiting, estop latch and auto-stop for one device.
pub struct SafetyGate {
    config: SafetyConfig,
    link: Arc<dyn LinkStatus>,
    limiter: Option<DefaultDirectRateLimiter>,
    estop: Arc<Mutex<EstopState>>,
    last_accepted: Mutex<Option<Accepted>>,
    auto_stop: AutoStop,
}

impl SafetyGate {
    /// Build a gate. `link` is polled for connectivity on every check.
    pub fn new(config: SafetyConfig, link: impl LinkStatus + 'static) -> Self {
        Self::with_link(config, Arc::new(link))
    }

    pub fn with_link(config: SafetyConfig, link: Arc<dyn LinkStatus>) -> Self {
        let limiter = Quota::with_period(config.min_interval)
            .map(|q| RateLimiter::direct(q.allow_burst(NonZeroU32::MIN)));
        if !config.warm_start {
            // Treat construction as the previous accepted command.
            if let Some(l) = &limiter {
                let _ = l.check();
            }
        }
        Self {
            config,
            link,
            limiter,
            estop: Arc::new(Mutex::new(EstopState::default())),
            last_accepted: Mutex::new(None),
            auto_stop: AutoStop::new(),
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Run the full check sequence for a drive request.
    ///
    /// # Errors
    ///
    /// The first failing check, as a [`Rejection`].
    pub fn validate_drive(
        &self,
        speed: f64,
        heading: f64,
        duration_ms: Option<f64>,
    ) -> Result<DriveCommand, Rejection> {
        {
            let estop = lock(&self.estop);
            if estop.latched {
                return Err(
                    SafetyViolation::new(Constraint::EstopActive, estop.reason.clone()).into(),
                );
            }
        }
        self.validate_link()?;

        if !speed.is_finite() {
            return Err(ValidationError::new("speed", "must be a finite number").into());
        }
        if !heading.is_finite() {
            return Err(ValidationError::new("heading", "must be a finite number").into());
        }
        if duration_ms.is_some_and(|d| !d.is_finite()) {
            return Err(ValidationError::new("duration_ms", "must be a finite number").into());
        }

        let mut last = lock(&self.last_accepted);
        let limited = self.limiter.as_ref().is_some_and(|l| l.check().is_err());
        if limited {
            let elapsed_ms = last.map_or(0, |a| a.at.elapsed().as_millis() as u64);
            debug!(
                elapsed_ms,
                min_interval_ms = self.config.min_interval.as_millis() as u64,
                "drive rate limited"
            );
            return Err(
                SafetyViolation::new(Constraint::RateLimit, format!("{elapsed_ms}ms")).into(),
            );
        }

        let cmd = DriveCommand {
            speed: clamp_speed(speed, self.config.max_speed),
            heading: wrap_heading(heading),
            duration_ms: clamp_duration(duration_ms, self.config.max_duration).as_millis()
                as u64,
        };
        *last = Some(Accepted {
            at: Instant::now(),
            wall: Utc::now(),
        });
        Ok(cmd)
    }

    /// Connectivity check alone, for commands allowed while the estop is
    /// latched (stop, LED).
    pub fn validate_link(&self) -> Result<(), Rejection> {
        if self.link.is_connected() {
            Ok(())
        } else {
            Err(SafetyViolation::new(Constraint::DeviceOffline, "disconnected").into())
        }
    }

    // ── Estop ──────────────────────────────────────────────────────────────

    /// Latch the estop. Re-activating keeps the original reason. Returns
    /// `true` if this call latched it.
    pub fn activate_estop(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let newly = {
            let mut estop = lock(&self.estop);
            if estop.latched {
                info!(original = %estop.reason, ignored = %reason, "estop already latched");
                false
            } else {
                estop.latched = true;
                estop.reason = reason;
                warn!(reason = %estop.reason, "estop latched");
                true
            }
        };
        self.auto_stop.cancel();
        newly
    }

    /// Clear the estop. Allowed only while latched and connected; otherwise
    /// returns `(false, reason)` and leaves the latch untouched.
    pub fn clear_estop(&self) -> (bool, String) {
        let mut estop = lock(&self.estop);
        if !estop.latched {
            return (false, "estop not latched".into());
        }
        if !self.link.is_connected() {
            return (false, estop.reason.clone());
        }
        info!(reason = %estop.reason, "estop cleared");
        *estop = EstopState::default();
        (true, String::new())
    }

    pub fn estop(&self) -> EstopState {
        lock(&self.estop).clone()
    }

    pub fn is_estopped(&self) -> bool {
        lock(&self.estop).latched
    }

    pub fn estop_reason(&self) -> String {
        lock(&self.estop).reason.clone()
    }

    /// Wall-clock time of the last accepted drive.
    pub fn last_command_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.last_accepted).map(|a| a.wall)
    }

    // ── Auto-stop ──────────────────────────────────────────────────────────

    /// Replace any pending auto-stop with one firing `stop_fn` after `after`.
    /// The callback is skipped if the estop is latched when the timer fires.
    pub fn schedule_auto_stop<F>(&self, after: Duration, stop_fn: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let estop = Arc::clone(&self.estop);
        self.auto_stop.schedule(after, move || !lock(&estop).latched, stop_fn);
    }

    pub fn cancel_auto_stop(&self) -> bool {
        self.auto_stop.cancel()
    }

    pub fn auto_stop_pending(&self) -> bool {
        self.auto_stop.is_pending()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
