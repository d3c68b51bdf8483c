//! Async transport traits for one BLE toy.
//!
//! A driver implements [`ToyConnector`] (open a link to an address) and
//! [`ToyLink`] (the operations on an open link). Every method is called from
//! the worker thread only, so implementations need not serialise calls
//! themselves, but they must be `Send + Sync` to be handed to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollbot_types::{DeviceError, Rgb};

/// An open connection to the toy.
#[async_trait]
pub trait ToyLink: Send + Sync {
    /// Hardware address this link is bound to.
    fn address(&self) -> &str;

    /// `false` once the peripheral has dropped the link. Must be O(1).
    fn is_alive(&self) -> bool;

    /// Bring the toy out of soft sleep.
    async fn wake(&self) -> Result<(), DeviceError>;

    /// Put the toy into soft sleep.
    async fn sleep(&self) -> Result<(), DeviceError>;

    async fn set_main_led(&self, color: Rgb) -> Result<(), DeviceError>;

    /// Start rolling at `speed` toward `heading` degrees. The toy stops on
    /// its own once `duration` has elapsed.
    async fn roll(&self, speed: u8, heading: u16, duration: Duration) -> Result<(), DeviceError>;

    async fn stop(&self) -> Result<(), DeviceError>;

    async fn battery_percent(&self) -> Result<u8, DeviceError>;

    /// Tear the link down. Called at most once per link.
    async fn disconnect(&self) -> Result<(), DeviceError>;
}

/// Opens links to a toy by hardware address.
#[async_trait]
pub trait ToyConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ToyLink>, DeviceError>;
}

/// Resolves the toy's hardware address when none was configured.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] when no matching peripheral is
    /// advertising.
    async fn discover(&self) -> Result<String, DeviceError>;
}
