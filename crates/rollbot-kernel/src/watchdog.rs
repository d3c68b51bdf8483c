//! [`Watchdog`] – connection health state machine.
//!
//! The watchdog owns no I/O. A supervisor ticks it once per interval:
//!
//! 1. [`Watchdog::begin_cycle`] with the current link state. A healthy link
//!    yields [`CyclePlan::Observe`]; a dropped one bumps the consecutive
//!    failure counter and yields [`CyclePlan::Reconnect`] with the per-cycle
//!    attempt budget.
//! 2. [`Watchdog::record_attempt`] after each reconnect try.
//! 3. [`Watchdog::finish_cycle`] to produce the immutable [`HealthSnapshot`]
//!    for the cycle.
//!
//! A cycle that spends its whole budget without reconnecting ends
//! [`HealthState::Degraded`].

use std::time::Duration;

use chrono::Utc;
use rollbot_types::{HealthSnapshot, HealthState};
use tracing::{debug, info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// What the supervisor should do during the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePlan {
    /// Link is up; only observe.
    Observe,
    /// Link is down; try to reconnect at most `max_attempts` times.
    Reconnect { max_attempts: u32 },
}

/// Everything the snapshot needs that the state machine does not track.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observation {
    pub connected: bool,
    pub battery_pct: Option<u8>,
    pub estop_latched: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Health state machine for one device link.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use rollbot_kernel::watchdog::{CyclePlan, Observation, Watchdog};
/// use rollbot_types::HealthState;
///
/// let mut wd = Watchdog::new(3);
/// assert_eq!(wd.begin_cycle(false), CyclePlan::Reconnect { max_attempts: 3 });
/// wd.record_attempt(Ok(Duration::from_millis(120)));
///
/// let snap = wd.finish_cycle(Observation { connected: true, ..Default::default() });
/// assert_eq!(snap.state, HealthState::Healthy);
/// assert_eq!(snap.mean_connect_ms, Some(120.0));
/// ```
#[derive(Debug, Clone)]
pub struct Watchdog {
    max_reconnects: u32,
    cycle: u64,
    state: HealthState,
    consecutive_failures: u32,
    attempts_this_cycle: u32,
    reconnects: u64,
    mean_connect_ms: Option<f64>,
    last_error: Option<String>,
}

impl Watchdog {
    /// `max_reconnects` is the per-cycle attempt budget; zero disables
    /// reconnecting entirely.
    pub fn new(max_reconnects: u32) -> Self {
        Self {
            max_reconnects,
            cycle: 0,
            state: HealthState::Healthy,
            consecutive_failures: 0,
            attempts_this_cycle: 0,
            reconnects: 0,
            mean_connect_ms: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn mean_connect_ms(&self) -> Option<f64> {
        self.mean_connect_ms
    }

    /// Start a new cycle given whether the link is up right now.
    pub fn begin_cycle(&mut self, connected: bool) -> CyclePlan {
        self.cycle += 1;
        self.attempts_this_cycle = 0;
        if connected {
            self.consecutive_failures = 0;
            self.state = HealthState::Healthy;
            return CyclePlan::Observe;
        }
        self.consecutive_failures += 1;
        if self.max_reconnects == 0 {
            self.state = HealthState::Degraded;
            return CyclePlan::Observe;
        }
        self.state = HealthState::Reconnecting;
        debug!(
            cycle = self.cycle,
            consecutive_failures = self.consecutive_failures,
            "link down, reconnecting"
        );
        CyclePlan::Reconnect {
            max_attempts: self.max_reconnects,
        }
    }

    /// Record one reconnect attempt: its duration on success, or the error.
    pub fn record_attempt(&mut self, outcome: Result<Duration, String>) {
        self.attempts_this_cycle += 1;
        match outcome {
            Ok(elapsed) => {
                let ms = elapsed.as_secs_f64() * 1000.0;
                self.reconnects += 1;
                let n = self.reconnects as f64;
                self.mean_connect_ms = Some(match self.mean_connect_ms {
                    Some(mean) => mean + (ms - mean) / n,
                    None => ms,
                });
                self.consecutive_failures = 0;
                self.state = HealthState::Healthy;
                info!(cycle = self.cycle, connect_ms = ms, "reconnected");
            }
            Err(e) => {
                warn!(
                    cycle = self.cycle,
                    attempt = self.attempts_this_cycle,
                    error = %e,
                    "reconnect attempt failed"
                );
                self.last_error = Some(e);
            }
        }
    }

    /// Close the cycle and return its snapshot.
    pub fn finish_cycle(&mut self, obs: Observation) -> HealthSnapshot {
        if obs.connected {
            self.state = HealthState::Healthy;
        } else if self.state == HealthState::Reconnecting {
            warn!(
                cycle = self.cycle,
                attempts = self.attempts_this_cycle,
                consecutive_failures = self.consecutive_failures,
                "reconnect budget exhausted for this cycle"
            );
            self.state = HealthState::Degraded;
        } else if self.state == HealthState::Healthy {
            // Reported healthy by an attempt but dropped again since.
            self.state = HealthState::Degraded;
        }
        HealthSnapshot {
            cycle: self.cycle,
            state: self.state,
            connected: obs.connected,
            consecutive_failures: self.consecutive_failures,
            reconnect_attempts: self.attempts_this_cycle,
            mean_connect_ms: self.mean_connect_ms,
            last_error: self.last_error.clone(),
            battery_pct: obs.battery_pct,
            estop_latched: obs.estop_latched,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down() -> Observation {
        Observation::default()
    }

    fn up() -> Observation {
        Observation {
            connected: true,
            battery_pct: Some(80),
            ..Observation::default()
        }
    }

    #[test]
    fn connected_cycle_is_healthy() {
        let mut wd = Watchdog::new(2);
        assert_eq!(wd.begin_cycle(true), CyclePlan::Observe);
        let snap = wd.finish_cycle(up());
        assert_eq!(snap.cycle, 1);
        assert_eq!(snap.state, HealthState::Healthy);
        assert_eq!(snap.battery_pct, Some(80));
        assert_eq!(snap.reconnect_attempts, 0);
    }

    #[test]
    fn exhausted_budget_degrades() {
        let mut wd = Watchdog::new(2);
        assert_eq!(
            wd.begin_cycle(false),
            CyclePlan::Reconnect { max_attempts: 2 }
        );
        assert_eq!(wd.state(), HealthState::Reconnecting);
        wd.record_attempt(Err("timeout".into()));
        wd.record_attempt(Err("refused".into()));
        let snap = wd.finish_cycle(down());
        assert_eq!(snap.state, HealthState::Degraded);
        assert_eq!(snap.reconnect_attempts, 2);
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(snap.last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn failures_accumulate_across_cycles_and_reset_on_success() {
        let mut wd = Watchdog::new(1);
        for _ in 0..3 {
            wd.begin_cycle(false);
            wd.record_attempt(Err("down".into()));
            wd.finish_cycle(down());
        }
        assert_eq!(wd.consecutive_failures(), 3);

        wd.begin_cycle(false);
        wd.record_attempt(Ok(Duration::from_millis(200)));
        let snap = wd.finish_cycle(up());
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.state, HealthState::Healthy);
    }

    #[test]
    fn mean_connect_time_is_running_mean() {
        let mut wd = Watchdog::new(1);
        for ms in [100, 200, 300] {
            wd.begin_cycle(false);
            wd.record_attempt(Ok(Duration::from_millis(ms)));
            wd.finish_cycle(up());
        }
        let mean = wd.mean_connect_ms().unwrap();
        assert!((mean - 200.0).abs() < 1e-9);
    }

    #[test]
    fn zero_budget_never_reconnects() {
        let mut wd = Watchdog::new(0);
        assert_eq!(wd.begin_cycle(false), CyclePlan::Observe);
        let snap = wd.finish_cycle(down());
        assert_eq!(snap.state, HealthState::Degraded);
        assert_eq!(snap.consecutive_failures, 1);
    }

    #[test]
    fn cycle_numbers_increase() {
        let mut wd = Watchdog::new(1);
        wd.begin_cycle(true);
        wd.finish_cycle(up());
        wd.begin_cycle(true);
        assert_eq!(wd.finish_cycle(up()).cycle, 2);
    }
}
