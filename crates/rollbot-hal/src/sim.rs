//! In-process simulated toy for tests and headless runs.
//!
//! [`SimToy`] implements [`ToyConnector`] and hands out links that record
//! every call. Connect and operation failures can be scripted so retry and
//! reconnect paths run without hardware.
//!
//! # Example
//!
//! ```rust
//! use rollbot_hal::sim::SimToy;
//!
//! let toy = SimToy::new().with_connect_failures(1).with_battery(73);
//! assert_eq!(toy.connect_count(), 0);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rollbot_types::{DeviceError, Rgb};
use tracing::debug;

use crate::transport::{Discovery, ToyConnector, ToyLink};

/// One recorded interaction with the simulated toy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Connect(String),
    Wake,
    Sleep,
    Led(Rgb),
    Roll {
        speed: u8,
        heading: u16,
        duration_ms: u64,
    },
    Stop,
    Battery,
    Disconnect,
}

#[derive(Default)]
struct SimState {
    calls: Vec<SimCall>,
    connect_failures: u32,
    op_failures: u32,
    connects: u32,
    battery: u8,
    connect_delay: Option<Duration>,
    current: Option<Arc<AtomicBool>>,
}

/// Cloneable handle to a simulated toy. All clones share state.
#[derive(Clone)]
pub struct SimToy {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimToy {
    fn default() -> Self {
        Self::new()
    }
}

impl SimToy {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                battery: 100,
                ..SimState::default()
            })),
        }
    }

    /// Fail the next `n` connect attempts.
    pub fn with_connect_failures(self, n: u32) -> Self {
        self.fail_connects(n);
        self
    }

    /// Fail the next `n` link operations (wake, roll, …).
    pub fn with_op_failures(self, n: u32) -> Self {
        self.fail_ops(n);
        self
    }

    /// Make every connect attempt take `delay` before answering.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = Some(delay);
        self
    }

    pub fn with_battery(self, pct: u8) -> Self {
        self.lock().battery = pct;
        self
    }

    pub fn fail_connects(&self, n: u32) {
        self.lock().connect_failures = n;
    }

    pub fn fail_ops(&self, n: u32) {
        self.lock().op_failures = n;
    }

    /// Simulate the peripheral dropping the current link.
    pub fn drop_link(&self) {
        if let Some(alive) = self.lock().current.take() {
            alive.store(false, Ordering::Release);
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `call` and consume one scripted op failure if any remain.
    fn op(&self, call: SimCall) -> Result<(), DeviceError> {
        let mut st = self.lock();
        st.calls.push(call);
        if st.op_failures > 0 {
            st.op_failures -= 1;
            return Err(DeviceError::Io("simulated operation failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ToyConnector for SimToy {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ToyLink>, DeviceError> {
        let delay = {
            let mut st = self.lock();
            st.calls.push(SimCall::Connect(address.to_string()));
            st.connect_delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let mut st = self.lock();
        if st.connect_failures > 0 {
            st.connect_failures -= 1;
            debug!(address, remaining = st.connect_failures, "sim connect failure");
            return Err(DeviceError::Io("simulated connect failure".into()));
        }
        st.connects += 1;
        let alive = Arc::new(AtomicBool::new(true));
        if let Some(old) = st.current.replace(Arc::clone(&alive)) {
            old.store(false, Ordering::Release);
        }
        Ok(Arc::new(SimLink {
            address: address.to_string(),
            alive,
            toy: self.clone(),
        }))
    }
}

struct SimLink {
    address: String,
    alive: Arc<AtomicBool>,
    toy: SimToy,
}

impl SimLink {
    fn op(&self, call: SimCall) -> Result<(), DeviceError> {
        if !self.is_alive() {
            return Err(DeviceError::LinkClosed);
        }
        self.toy.op(call)
    }
}

#[async_trait]
impl ToyLink for SimLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn wake(&self) -> Result<(), DeviceError> {
        self.op(SimCall::Wake)
    }

    async fn sleep(&self) -> Result<(), DeviceError> {
        self.op(SimCall::Sleep)
    }

    async fn set_main_led(&self, color: Rgb) -> Result<(), DeviceError> {
        self.op(SimCall::Led(color))
    }

    async fn roll(&self, speed: u8, heading: u16, duration: Duration) -> Result<(), DeviceError> {
        self.op(SimCall::Roll {
            speed,
            heading,
            duration_ms: duration.as_millis() as u64,
        })
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.op(SimCall::Stop)
    }

    async fn battery_percent(&self) -> Result<u8, DeviceError> {
        self.op(SimCall::Battery)?;
        Ok(self.toy.lock().battery)
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.alive.store(false, Ordering::Release);
        self.toy.lock().calls.push(SimCall::Disconnect);
        Ok(())
    }
}

/// Scripted [`Discovery`]: answers with `address`, or `NotFound` when `None`.
pub struct SimDiscovery {
    pub address: Option<String>,
}

#[async_trait]
impl Discovery for SimDiscovery {
    async fn discover(&self) -> Result<String, DeviceError> {
        self.address
            .clone()
            .ok_or_else(|| DeviceError::NotFound("no toy advertising".into()))
    }
}
