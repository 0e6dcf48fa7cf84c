//! Single ordered intake for the relay loop
//!
//! Observation producers and the connectivity probe loop run as independent
//! tasks; both feed one bounded channel so the relay sees a single ordered
//! stream of events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::types::{Observation, Transition};

/// Something the relay loop must act on
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A decoded observation to route
    Observation(Observation),
    /// Outcome of one connectivity probe
    Probe(Transition),
}

/// Cloneable sending side of the relay intake.
#[derive(Debug, Clone)]
pub struct Intake {
    tx: mpsc::Sender<RelayEvent>,
}

impl Intake {
    /// Create an intake and the receiver the relay consumes
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Hand an observation to the relay, waiting if the intake is full
    pub async fn submit(&self, observation: Observation) -> Result<()> {
        self.send(RelayEvent::Observation(observation)).await
    }

    /// Hand an observation to the relay, or get it back if the relay has
    /// stopped. Nothing is lost either way.
    pub async fn offer(&self, observation: Observation) -> std::result::Result<(), Observation> {
        match self.tx.reserve().await {
            Ok(permit) => {
                permit.send(RelayEvent::Observation(observation));
                Ok(())
            }
            Err(_) => Err(observation),
        }
    }

    /// Report a probe outcome to the relay
    pub async fn report(&self, transition: Transition) -> Result<()> {
        self.send(RelayEvent::Probe(transition)).await
    }

    async fn send(&self, event: RelayEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::IntakeClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Probe the uplink on a fixed cadence and report every outcome.
///
/// The first probe runs immediately. Ticks missed while a probe or a full
/// intake held the task are skipped rather than bunched up.
pub fn spawn_probe_loop(
    monitor: Arc<ConnectivityMonitor>,
    period: Duration,
    intake: Intake,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let transition = tokio::select! {
                _ = cancel.cancelled() => break,
                transition = monitor.probe() => transition,
            };

            if intake.report(transition).await.is_err() {
                tracing::debug!("Relay intake closed, stopping probe loop");
                break;
            }
        }
    })
}
