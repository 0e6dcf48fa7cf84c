//! # fieldgate-core
//!
//! Core library for fieldgate - a store-and-forward telemetry gateway.
//!
//! This library provides:
//! - A durable SQLite outbox for observations that could not be delivered
//! - Connectivity tracking with pluggable probes
//! - An MQTT publisher with per-message delivery verdicts
//! - The relay loop that routes observations and drains the outbox
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Observations flow through a single relay task:
//! - **Intake:** sources and the probe loop feed one ordered channel
//! - **Routing:** publish when the uplink is up, otherwise buffer durably
//! - **Replay:** on reconnect, drain the outbox oldest first, removing a
//!   record only after the broker accepted it
//!
//! ## Example
//!
//! ```rust,no_run
//! use fieldgate_core::{Config, Observation, Outbox};
//!
//! let config = Config::load().expect("failed to load config");
//! let outbox = Outbox::open(&config.outbox.resolved_path(), &config.outbox)
//!     .expect("failed to open outbox");
//!
//! let obs = Observation::now("gateway/battery_percentage", "87").unwrap();
//! outbox.enqueue(&obs).expect("failed to buffer observation");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, Probe};
pub use error::{Error, Result};
pub use outbox::Outbox;
pub use publisher::{MqttPublisher, Publisher};
pub use relay::{DrainReport, DrainStop, Intake, Relay, RelayEvent, RelayStats, Route};
pub use types::*;

// Public modules
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod outbox;
pub mod publisher;
pub mod relay;
pub mod source;
pub mod types;
