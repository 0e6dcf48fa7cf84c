//! Core domain types for fieldgate
//!
//! | Term | Definition |
//! |------|------------|
//! | **Observation** | One topic/payload telemetry fact ready for delivery |
//! | **Outbox** | Durable queue of undelivered observations |
//! | **Drain** | Replaying all pending outbox records after reconnect |
//! | **Reconnect edge** | The uplink becoming usable after being down or unknown |
//! | **Uplink** | The long-range path to the broker (cellular/Wi-Fi), not the sensor radio |

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};

// ============================================
// Observation
// ============================================

/// One routable telemetry fact.
///
/// Topics follow `<source>/<field>` by convention (`gps/latitude`,
/// `remote_device/temperature`) but are opaque to the relay. The payload is
/// already formatted for the broker and is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    topic: String,
    payload: String,
    observed_at: DateTime<Utc>,
}

impl Observation {
    /// Create an observation, rejecting an empty topic.
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Result<Self> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(Error::MalformedObservation(
                "topic must not be empty".to_string(),
            ));
        }

        Ok(Self {
            topic,
            payload: payload.into(),
            observed_at,
        })
    }

    /// Rebuild an observation read back from the outbox, where the topic was
    /// validated on the way in.
    pub(crate) fn from_parts(topic: String, payload: String, observed_at: DateTime<Utc>) -> Self {
        Self {
            topic,
            payload,
            observed_at,
        }
    }

    /// Create an observation stamped with the current time
    pub fn now(topic: impl Into<String>, payload: impl Into<String>) -> Result<Self> {
        Self::new(topic, payload, Utc::now())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// Converts a capture timestamp to fractional unix seconds (outbox `REAL` column).
pub fn to_unix_seconds(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) / 1_000_000.0
}

/// Inverse of [`to_unix_seconds`], at microsecond precision.
pub fn from_unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.floor();
    let micros = ((secs - whole) * 1_000_000.0).round() as u32;
    // Rounding can carry into the next second.
    let (whole, micros) = if micros >= 1_000_000 {
        (whole + 1.0, 0)
    } else {
        (whole, micros)
    };
    Utc.timestamp_opt(whole as i64, micros * 1_000).single()
}

// ============================================
// Outbox
// ============================================

/// A persisted observation awaiting delivery.
///
/// `sequence_id` is assigned by the outbox at insertion, increases
/// monotonically, and is never reused after deletion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRecord {
    pub sequence_id: i64,
    pub observation: Observation,
}

// ============================================
// Connectivity
// ============================================

/// Uplink availability as last determined by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// No probe has completed yet
    Unknown,
    Down,
    Up,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Unknown => "unknown",
            ConnectivityState::Down => "down",
            ConnectivityState::Up => "up",
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, ConnectivityState::Up)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the state moved across one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    StillDown,
    StillUp,
    WentDown,
    WentUp,
}

/// State before and after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: ConnectivityState,
    pub current: ConnectivityState,
}

impl Transition {
    pub fn new(previous: ConnectivityState, current: ConnectivityState) -> Self {
        Self { previous, current }
    }

    /// Classify the transition.
    ///
    /// Leaving `Unknown` counts as an edge: the first successful probe after
    /// startup is a reconnect, so records left over from a previous run are
    /// replayed without waiting for a flap.
    pub fn edge(&self) -> Edge {
        match (self.previous.is_up(), self.current.is_up()) {
            (false, true) => Edge::WentUp,
            (true, false) => Edge::WentDown,
            (true, true) => Edge::StillUp,
            (false, false) if self.previous == ConnectivityState::Unknown => Edge::WentDown,
            (false, false) => Edge::StillDown,
        }
    }

    /// True only for the transition that should trigger an outbox drain
    pub fn is_reconnect(&self) -> bool {
        self.edge() == Edge::WentUp
    }
}
