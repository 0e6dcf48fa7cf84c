//! Store-and-forward relay
//!
//! The relay is the control loop of the gateway. For every observation it
//! reads the last known uplink state and either publishes immediately or
//! buffers durably. When the uplink comes back it replays the outbox, oldest
//! first, deleting each record only after the broker confirmed it.
//!
//! ```text
//! producers ──┐
//!             ├─> Intake ─> Relay ─┬─> Publisher      (uplink up)
//! probe loop ─┘                    └─> Outbox         (uplink down / publish failed)
//!                                  reconnect edge: Outbox ─> Publisher ─> remove
//! ```

mod intake;

pub use intake::{spawn_probe_loop, Intake, RelayEvent};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::outbox::Outbox;
use crate::publisher::Publisher;
use crate::types::{Edge, Observation, Transition};

/// Attempts at buffering one observation before the relay gives up
const STORAGE_ATTEMPTS: u32 = 3;

/// Pause between buffering attempts
const STORAGE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Where an observation ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Delivered to the broker directly
    Published,
    /// Persisted in the outbox for later replay
    Buffered { sequence_id: i64 },
}

/// Why a drain pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStop {
    /// Every pending record was delivered
    Exhausted,
    /// Publishing this record failed; it and everything after it remain
    PublishFailed { sequence_id: i64 },
    /// The uplink left `Up` mid-drain
    LinkDown,
    /// Shutdown was requested
    Cancelled,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub stop: DrainStop,
}

/// Relay statistics
#[derive(Debug, Default, Clone)]
pub struct RelayStats {
    /// Observations published on arrival
    pub published: usize,
    /// Observations written to the outbox
    pub buffered: usize,
    /// Outbox records delivered during drains
    pub drained: usize,
    /// Failed publish attempts (live and drain)
    pub publish_failures: usize,
    /// Drain passes started
    pub drain_passes: usize,
    /// Observations turned away because the outbox was full
    pub rejected: usize,
}

/// Routes observations between publisher and outbox.
///
/// All collaborators are explicit handles; nothing here is global.
pub struct Relay {
    outbox: Arc<Outbox>,
    monitor: Arc<ConnectivityMonitor>,
    publisher: Arc<dyn Publisher>,
    retry_drain_while_up: bool,
    stats: RelayStats,
}

impl Relay {
    pub fn new(
        outbox: Arc<Outbox>,
        monitor: Arc<ConnectivityMonitor>,
        publisher: Arc<dyn Publisher>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            outbox,
            monitor,
            publisher,
            retry_drain_while_up: config.retry_drain_while_up,
            stats: RelayStats::default(),
        }
    }

    /// Route one observation.
    ///
    /// Publishes when the uplink is `Up`, falling back to the outbox if the
    /// publish fails; buffers directly otherwise. Never triggers a drain.
    /// A storage error is returned as-is and the observation stays with the
    /// caller.
    pub async fn handle(&mut self, observation: &Observation) -> Result<Route> {
        if self.monitor.current().is_up() {
            match self.publisher.publish(observation).await {
                Ok(()) => {
                    self.stats.published += 1;
                    debug!(topic = %observation.topic(), "Published observation");
                    return Ok(Route::Published);
                }
                Err(e) => {
                    self.stats.publish_failures += 1;
                    warn!(
                        topic = %observation.topic(),
                        error = %e,
                        "Live publish failed, buffering observation"
                    );
                }
            }
        }

        let record = self.outbox.enqueue(observation)?;
        self.stats.buffered += 1;
        Ok(Route::Buffered {
            sequence_id: record.sequence_id,
        })
    }

    /// React to a probe outcome.
    ///
    /// Drains on the reconnect edge, and on later ticks while the link stays
    /// up if an earlier pass was cut short.
    pub async fn on_probe(
        &mut self,
        transition: Transition,
        cancel: &CancellationToken,
    ) -> Result<Option<DrainReport>> {
        let should_drain = match transition.edge() {
            Edge::WentUp => true,
            Edge::StillUp => self.retry_drain_while_up && !self.outbox.is_empty()?,
            Edge::WentDown | Edge::StillDown => false,
        };

        if !should_drain {
            return Ok(None);
        }
        self.drain(cancel).await.map(Some)
    }

    /// Replay the outbox through the publisher, oldest first.
    ///
    /// Stops at the first failed publish without skipping ahead. Also stops
    /// between records when `cancel` fires or the uplink leaves `Up`; a
    /// record whose publish has started is always seen through.
    pub async fn drain(&mut self, cancel: &CancellationToken) -> Result<DrainReport> {
        let outbox = Arc::clone(&self.outbox);
        self.stats.drain_passes += 1;

        let mut delivered = 0;
        let mut stop = DrainStop::Exhausted;

        for record in outbox.peek_all_ordered() {
            if cancel.is_cancelled() {
                stop = DrainStop::Cancelled;
                break;
            }
            if !self.monitor.current().is_up() {
                stop = DrainStop::LinkDown;
                break;
            }

            let record = record?;
            match self.publisher.publish(&record.observation).await {
                Ok(()) => {
                    outbox.remove(record.sequence_id)?;
                    delivered += 1;
                    self.stats.drained += 1;
                }
                Err(e) => {
                    self.stats.publish_failures += 1;
                    warn!(
                        sequence_id = record.sequence_id,
                        topic = %record.observation.topic(),
                        error = %e,
                        "Drain publish failed, stopping pass"
                    );
                    stop = DrainStop::PublishFailed {
                        sequence_id: record.sequence_id,
                    };
                    break;
                }
            }
        }

        info!(delivered, stop = ?stop, "Outbox drain pass finished");
        Ok(DrainReport { delivered, stop })
    }

    /// Run the relay loop until `cancel` fires or every intake sender is gone.
    ///
    /// Observations still queued in the intake at shutdown are buffered, not
    /// dropped. A full outbox rejects the newest observation and the loop
    /// keeps going so the backlog can still drain. Any other storage failure
    /// that persists across retries ends the loop with the error; the outbox
    /// is durable, so restarting is safe.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RelayEvent>,
        cancel: CancellationToken,
    ) -> Result<RelayStats> {
        info!("Relay loop started");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                RelayEvent::Observation(observation) => {
                    self.handle_persistently(&observation).await?;
                }
                RelayEvent::Probe(transition) => {
                    self.on_probe(transition, &cancel).await?;
                }
            }
        }

        events.close();
        let mut flushed = 0;
        while let Ok(event) = events.try_recv() {
            if let RelayEvent::Observation(observation) = event {
                self.buffer_persistently(&observation).await?;
                flushed += 1;
            }
        }

        info!(
            published = self.stats.published,
            buffered = self.stats.buffered,
            drained = self.stats.drained,
            publish_failures = self.stats.publish_failures,
            rejected = self.stats.rejected,
            flushed,
            "Relay loop stopped"
        );
        Ok(self.stats)
    }

    async fn handle_persistently(&mut self, observation: &Observation) -> Result<Option<Route>> {
        let mut attempt = 1;
        loop {
            match self.handle(observation).await {
                Ok(route) => return Ok(Some(route)),
                Err(Error::OutboxFull { capacity }) => {
                    self.stats.rejected += 1;
                    error!(
                        topic = %observation.topic(),
                        payload = %observation.payload(),
                        capacity,
                        "Outbox full, rejecting observation"
                    );
                    return Ok(None);
                }
                Err(e) if e.is_storage() && attempt < STORAGE_ATTEMPTS => {
                    warn!(attempt, error = %e, "Outbox write failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(STORAGE_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(
                        topic = %observation.topic(),
                        payload = %observation.payload(),
                        error = %e,
                        "Observation could not be relayed or buffered"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn buffer_persistently(&mut self, observation: &Observation) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.outbox.enqueue(observation) {
                Ok(_) => {
                    self.stats.buffered += 1;
                    return Ok(());
                }
                Err(Error::OutboxFull { capacity }) => {
                    self.stats.rejected += 1;
                    error!(
                        topic = %observation.topic(),
                        payload = %observation.payload(),
                        capacity,
                        "Outbox full, observation lost at shutdown"
                    );
                    return Ok(());
                }
                Err(e) if attempt < STORAGE_ATTEMPTS => {
                    warn!(attempt, error = %e, "Outbox write failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(STORAGE_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(
                        topic = %observation.topic(),
                        payload = %observation.payload(),
                        error = %e,
                        "Observation could not be buffered at shutdown"
                    );
                    return Err(e);
                }
            }
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboxConfig;
    use crate::connectivity::Probe;
    use crate::types::ConnectivityState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct Switch(Arc<AtomicBool>);

    #[async_trait]
    impl Probe for Switch {
        fn name(&self) -> &str {
            "switch"
        }

        async fn check(&self) -> Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Publisher for Recorder {
        async fn publish(&self, observation: &Observation) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Publish("rejected".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push(observation.topic().to_string());
            Ok(())
        }
    }

    fn relay(link: &Arc<AtomicBool>, publisher: &Arc<Recorder>) -> Relay {
        let outbox = Outbox::open_in_memory(&OutboxConfig::default()).unwrap();
        let monitor = ConnectivityMonitor::with_settings(
            Box::new(Switch(Arc::clone(link))),
            Duration::from_secs(1),
            1,
        );
        Relay::new(
            Arc::new(outbox),
            Arc::new(monitor),
            Arc::clone(publisher) as Arc<dyn Publisher>,
            &RelayConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_unknown_state_buffers_without_publishing() {
        let link = Arc::new(AtomicBool::new(true));
        let publisher = Arc::new(Recorder::default());
        let mut relay = relay(&link, &publisher);

        assert_eq!(relay.monitor.current(), ConnectivityState::Unknown);
        let route = relay
            .handle(&Observation::now("gps/latitude", "55.75").unwrap())
            .await
            .unwrap();

        assert_eq!(route, Route::Buffered { sequence_id: 1 });
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_live_publish_falls_back_to_outbox() {
        let link = Arc::new(AtomicBool::new(true));
        let publisher = Arc::new(Recorder::default());
        let mut relay = relay(&link, &publisher);
        relay.monitor.probe().await;

        publisher.fail.store(true, Ordering::SeqCst);
        let route = relay
            .handle(&Observation::now("gateway/battery_percentage", "80").unwrap())
            .await
            .unwrap();

        assert!(matches!(route, Route::Buffered { .. }));
        assert_eq!(relay.stats().publish_failures, 1);
        assert_eq!(relay.outbox().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_stops_when_link_drops() {
        let link = Arc::new(AtomicBool::new(false));
        let publisher = Arc::new(Recorder::default());
        let mut relay = relay(&link, &publisher);
        relay.monitor.probe().await;

        relay
            .handle(&Observation::now("t1", "a").unwrap())
            .await
            .unwrap();

        let report = relay.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.stop, DrainStop::LinkDown);
        assert_eq!(report.delivered, 0);
        assert_eq!(relay.outbox().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_drain_leaves_outbox_intact() {
        let link = Arc::new(AtomicBool::new(false));
        let publisher = Arc::new(Recorder::default());
        let mut relay = relay(&link, &publisher);
        relay.monitor.probe().await;
        relay
            .handle(&Observation::now("t1", "a").unwrap())
            .await
            .unwrap();

        link.store(true, Ordering::SeqCst);
        relay.monitor.probe().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = relay.drain(&cancel).await.unwrap();
        assert_eq!(report.stop, DrainStop::Cancelled);
        assert_eq!(relay.outbox().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_still_up_tick_resumes_only_when_backlog_exists() {
        let link = Arc::new(AtomicBool::new(true));
        let publisher = Arc::new(Recorder::default());
        let mut relay = relay(&link, &publisher);
        let cancel = CancellationToken::new();

        let t = relay.monitor.probe().await;
        assert!(relay.on_probe(t, &cancel).await.unwrap().is_some());

        // Nothing pending: steady-up tick does not start a pass
        let t = relay.monitor.probe().await;
        assert!(relay.on_probe(t, &cancel).await.unwrap().is_none());

        publisher.fail.store(true, Ordering::SeqCst);
        relay
            .handle(&Observation::now("t1", "a").unwrap())
            .await
            .unwrap();
        publisher.fail.store(false, Ordering::SeqCst);

        let t = relay.monitor.probe().await;
        let report = relay.on_probe(t, &cancel).await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.stop, DrainStop::Exhausted);
    }
}
