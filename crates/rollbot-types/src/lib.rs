use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Connection lifecycle
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle of the single device connection. Only the session mutates it,
/// and only from the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Copy-out view of the session's connection statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Attempts used by the most recent `connect()` call (1-based).
    pub attempts: u32,
    /// Number of connects that ended in `Connected`.
    pub successful_connects: u32,
    pub last_connect_duration: Option<Duration>,
    /// Running mean over every successful connect.
    pub mean_connect_duration: Option<Duration>,
    /// Display form of the most recent failure, if any.
    pub last_error: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Pre-resolved configuration handed to the core at construction.
///
/// File and environment parsing live in `rollbot-cli`; the core only ever sees
/// this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Minimum spacing between two accepted drive commands.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Upper bound for the duration of a single drive command.
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    /// Speed ceiling applied by the safety gate (device units, 0-255).
    #[serde(default = "default_max_speed")]
    pub max_speed: u8,
    /// Per-attempt connect timeout in seconds.
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: f64,
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Let the very first drive command of the process skip the rate limiter.
    #[serde(default = "default_warm_start")]
    pub warm_start: bool,
}

fn default_min_interval_ms() -> u64 {
    100
}
fn default_max_duration_ms() -> u64 {
    2000
}
fn default_max_speed() -> u8 {
    180
}
fn default_connect_timeout_s() -> f64 {
    5.0
}
fn default_max_connect_attempts() -> u32 {
    2
}
fn default_warm_start() -> bool {
    true
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_duration_ms: default_max_duration_ms(),
            max_speed: default_max_speed(),
            connect_timeout_s: default_connect_timeout_s(),
            max_connect_attempts: default_max_connect_attempts(),
            warm_start: default_warm_start(),
        }
    }
}

impl CoreConfig {
    /// The safety-gate slice of the configuration.
    pub fn safety(&self) -> SafetyConfig {
        SafetyConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_duration: Duration::from_millis(self.max_duration_ms),
            max_speed: self.max_speed,
            warm_start: self.warm_start,
        }
    }

    /// Per-attempt connect timeout. Non-finite or negative values fall back
    /// to the default of five seconds.
    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.connect_timeout_s)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_connect_timeout_s()))
    }
}

/// Immutable limits enforced by the safety gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyConfig {
    pub min_interval: Duration,
    pub max_duration: Duration,
    pub max_speed: u8,
    pub warm_start: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        CoreConfig::default().safety()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// An RGB color for the toy's main LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// Actions the external command surface can request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// `on = true` connects and wakes the toy; `false` sleeps and disconnects.
    Power { on: bool },
    /// Roll at `speed` toward `heading` degrees for `duration_ms`.
    /// Values are clamped by the safety gate, never rejected for range.
    Drive {
        speed: f64,
        heading: f64,
        #[serde(default)]
        duration_ms: Option<f64>,
    },
    Stop,
    Led(Rgb),
    Estop {
        #[serde(default)]
        reason: Option<String>,
    },
    ClearEstop,
}

impl Action {
    /// Stable, machine-readable command name.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Power { .. } => "power",
            Action::Drive { .. } => "drive",
            Action::Stop => "stop",
            Action::Led(_) => "led",
            Action::Estop { .. } => "estop",
            Action::ClearEstop => "clear_estop",
        }
    }
}

/// A command as delivered by the command surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub action: Action,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Command {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// A drive command after clamping and heading normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveCommand {
    pub speed: u8,
    /// Degrees in `[0, 360)`.
    pub heading: u16,
    pub duration_ms: u64,
}

impl DriveCommand {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Acknowledgement returned for an accepted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub command: String,
    pub correlation_id: Option<String>,
    /// In-flight task id when the command scheduled device work.
    pub task_id: Option<u64>,
    /// The clamped values actually sent, for `drive`.
    pub drive: Option<DriveCommand>,
}

// ────────────────────────────────────────────────────────────────────────────
// Safety
// ────────────────────────────────────────────────────────────────────────────

/// Latched emergency-stop state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstopState {
    pub latched: bool,
    pub reason: String,
}

/// Machine-readable tag of the safety check that rejected a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    EstopActive,
    DeviceOffline,
    RateLimit,
}

impl Constraint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Constraint::EstopActive => "estop_active",
            Constraint::DeviceOffline => "device_offline",
            Constraint::RateLimit => "rate_limit",
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command blocked by the safety gate, with the value that tripped it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{constraint} ({value})")]
pub struct SafetyViolation {
    pub constraint: Constraint,
    pub value: String,
}

impl SafetyViolation {
    pub fn new(constraint: Constraint, value: impl Into<String>) -> Self {
        Self {
            constraint,
            value: value.into(),
        }
    }
}

/// Malformed command input (non-finite numbers and the like).
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a rejected validation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error(transparent)]
    Safety(SafetyViolation),
    #[error(transparent)]
    Validation(ValidationError),
}

impl Rejection {
    /// Tag relayed upstream: the constraint name, or `invalid_input`.
    pub fn tag(&self) -> &'static str {
        match self {
            Rejection::Safety(v) => v.constraint.as_str(),
            Rejection::Validation(_) => "invalid_input",
        }
    }

    /// Offending value (or the validation reason).
    pub fn value(&self) -> String {
        match self {
            Rejection::Safety(v) => v.value.clone(),
            Rejection::Validation(e) => e.to_string(),
        }
    }
}

impl From<SafetyViolation> for Rejection {
    fn from(v: SafetyViolation) -> Self {
        Rejection::Safety(v)
    }
}

impl From<ValidationError> for Rejection {
    fn from(e: ValidationError) -> Self {
        Rejection::Validation(e)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry
// ────────────────────────────────────────────────────────────────────────────

/// Periodic state report for the command surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub connected: bool,
    pub estop: EstopState,
    pub last_cmd_ts: Option<DateTime<Utc>>,
    pub battery_pct: Option<u8>,
}

/// Watchdog view of connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Reconnecting,
}

/// One immutable health report, published once per watchdog cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub cycle: u64,
    pub state: HealthState,
    pub connected: bool,
    pub consecutive_failures: u32,
    /// Reconnects attempted during this cycle.
    pub reconnect_attempts: u32,
    pub mean_connect_ms: Option<f64>,
    pub last_error: Option<String>,
    pub battery_pct: Option<u8>,
    pub estop_latched: bool,
    pub timestamp: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// Envelope for everything routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"rollbot-runtime::dispatcher"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    CommandRejected {
        command: String,
        reason: String,
        value: String,
        correlation_id: Option<String>,
    },
    CommandFailed {
        command: String,
        error: String,
    },
    EstopActivated {
        reason: String,
    },
    EstopCleared,
    LedChanged(Rgb),
    Telemetry(TelemetrySnapshot),
    Health(HealthSnapshot),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Failure reported by a device transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no device found: {0}")]
    NotFound(String),
    #[error("device I/O failed: {0}")]
    Io(String),
    #[error("device link closed")]
    LinkClosed,
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
}

/// Error type spanning connection, device, safety and runtime failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RollError {
    #[error("connection failed after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: DeviceError,
    },

    #[error("a connect is already in progress")]
    ConnectInProgress,

    #[error("device is not connected")]
    DeviceNotConnected,

    #[error("device operation `{op}` failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("rejected: {0}")]
    Rejected(#[from] SafetyViolation),

    #[error("estop not cleared: {0}")]
    EstopNotCleared(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("task cancelled")]
    Cancelled,

    #[error("worker loop is not running")]
    WorkerUnavailable,

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl RollError {
    /// `true` for outcomes that a drain treats as a clean stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RollError::Cancelled)
    }
}

impl From<Rejection> for RollError {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::Safety(v) => RollError::Rejected(v),
            Rejection::Validation(e) => RollError::Validation(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parses_from_flat_json() {
        let raw = r#"{"action":"drive","speed":120,"heading":90,"correlation_id":"c-1"}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.correlation_id.as_deref(), Some("c-1"));
        match cmd.action {
            Action::Drive {
                speed,
                heading,
                duration_ms,
            } => {
                assert_eq!(speed, 120.0);
                assert_eq!(heading, 90.0);
                assert!(duration_ms.is_none());
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn led_command_carries_color() {
        let raw = r#"{"action":"led","red":255,"green":0,"blue":16}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.action, Action::Led(Rgb::new(255, 0, 16)));
        assert_eq!(cmd.action.name(), "led");
    }

    #[test]
    fn constraint_serializes_as_snake_case_tag() {
        let v = SafetyViolation::new(Constraint::EstopActive, "operator");
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains(r#""constraint":"estop_active""#), "{json}");
        assert_eq!(Rejection::from(v).tag(), "estop_active");
    }

    #[test]
    fn validation_rejection_tag_is_invalid_input() {
        let r = Rejection::from(ValidationError::new("speed", "not a finite number"));
        assert_eq!(r.tag(), "invalid_input");
        assert!(r.value().contains("speed"));
    }

    #[test]
    fn core_config_fills_missing_fields_with_defaults() {
        let cfg: CoreConfig = serde_json::from_str(r#"{"max_speed":90}"#).unwrap();
        assert_eq!(cfg.max_speed, 90);
        assert_eq!(cfg.max_connect_attempts, 2);
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
        assert!(cfg.warm_start);
    }

    #[test]
    fn invalid_connect_timeout_falls_back_to_default() {
        let cfg = CoreConfig {
            connect_timeout_s: -1.0,
            ..CoreConfig::default()
        };
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn roll_error_display() {
        let err = RollError::Connection {
            attempts: 2,
            source: DeviceError::Io("gatt timeout".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 attempt"));
        assert!(msg.contains("gatt timeout"));

        let rejected: RollError = SafetyViolation::new(Constraint::RateLimit, "12ms").into();
        assert!(rejected.to_string().contains("rate_limit"));
    }
}
