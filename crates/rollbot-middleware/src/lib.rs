//! `rollbot-middleware` – event routing.
//!
//! Carries rejections, alerts and telemetry from the core to whoever is
//! listening, without caring what the events mean.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
