//! `rollbot-hal` – device transport seam.
//!
//! The core never speaks BLE directly. It talks to a [`ToyConnector`] that
//! opens a [`ToyLink`], and optionally to a [`Discovery`] source that resolves
//! the device address. GATT framing lives behind these traits.
//!
//! # Modules
//!
//! - [`transport`] – the async transport traits.
//! - [`led_echo`] – [`LedEcho`], the strategy used to report LED changes to
//!   the outside world.
//! - [`sim`] – [`SimToy`], an in-process toy for tests and headless runs.

pub mod led_echo;
pub mod sim;
pub mod transport;

pub use led_echo::{LedEcho, NoEcho};
pub use sim::{SimCall, SimDiscovery, SimToy};
pub use transport::{Discovery, ToyConnector, ToyLink};
