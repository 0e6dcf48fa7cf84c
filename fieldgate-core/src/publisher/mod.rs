//! Single-observation delivery to the broker
//!
//! A [`Publisher`] makes exactly one delivery attempt per call and reports a
//! verdict. Retrying belongs to the relay and the outbox, never to the
//! publisher, so a failed attempt always surfaces immediately.

mod mqtt;

pub use mqtt::MqttPublisher;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Observation;

/// Publish one observation.
///
/// `Ok(())` means the broker accepted it (for QoS 1, acknowledged it).
/// Failures come back as [`crate::Error::Publish`].
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, observation: &Observation) -> Result<()>;
}

