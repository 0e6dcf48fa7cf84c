//! Integration tests for the store-and-forward relay
//!
//! These drive the relay with a scripted uplink and a recording publisher,
//! checking delivery order, partial drains, and outbox durability across
//! restarts.

use async_trait::async_trait;
use fieldgate_core::config::{OutboxConfig, RelayConfig};
use fieldgate_core::source::{buffer_undelivered, pump, JsonLinesSource, VecSource};
use fieldgate_core::{
    ConnectivityMonitor, ConnectivityState, DrainStop, Error, Intake, Observation, Outbox, Probe,
    Publisher, Relay, Result, Route,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

// ============================================
// Test doubles
// ============================================

/// Uplink controlled by the test
struct Link(Arc<AtomicBool>);

#[async_trait]
impl Probe for Link {
    fn name(&self) -> &str {
        "scripted-link"
    }

    async fn check(&self) -> Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

/// Records delivered (topic, payload) pairs; rejects payloads on a deny list
#[derive(Default)]
struct Broker {
    delivered: Mutex<Vec<(String, String)>>,
    reject: Mutex<HashSet<String>>,
}

impl Broker {
    fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().unwrap().clone()
    }

    fn reject(&self, payload: &str) {
        self.reject.lock().unwrap().insert(payload.to_string());
    }

    fn accept_all(&self) {
        self.reject.lock().unwrap().clear();
    }
}

#[async_trait]
impl Publisher for Broker {
    async fn publish(&self, observation: &Observation) -> Result<()> {
        if self.reject.lock().unwrap().contains(observation.payload()) {
            return Err(Error::Publish("broker rejected message".to_string()));
        }
        self.delivered.lock().unwrap().push((
            observation.topic().to_string(),
            observation.payload().to_string(),
        ));
        Ok(())
    }
}

struct Harness {
    link: Arc<AtomicBool>,
    broker: Arc<Broker>,
    monitor: Arc<ConnectivityMonitor>,
    outbox: Arc<Outbox>,
}

impl Harness {
    fn in_memory() -> Self {
        Self::with_outbox(Outbox::open_in_memory(&OutboxConfig::default()).unwrap())
    }

    fn on_disk(path: &Path) -> Self {
        Self::with_outbox(Outbox::open(path, &OutboxConfig::default()).unwrap())
    }

    fn with_outbox(outbox: Outbox) -> Self {
        let link = Arc::new(AtomicBool::new(false));
        let monitor = ConnectivityMonitor::with_settings(
            Box::new(Link(Arc::clone(&link))),
            Duration::from_secs(1),
            1,
        );
        Self {
            link,
            broker: Arc::new(Broker::default()),
            monitor: Arc::new(monitor),
            outbox: Arc::new(outbox),
        }
    }

    fn relay(&self) -> Relay {
        Relay::new(
            Arc::clone(&self.outbox),
            Arc::clone(&self.monitor),
            Arc::clone(&self.broker) as Arc<dyn Publisher>,
            &RelayConfig::default(),
        )
    }

    fn set_link(&self, up: bool) {
        self.link.store(up, Ordering::SeqCst);
    }

    fn pending(&self) -> Vec<(i64, String)> {
        self.outbox
            .peek_all_ordered()
            .map(|r| {
                let r = r.unwrap();
                (r.sequence_id, r.observation.payload().to_string())
            })
            .collect()
    }
}

fn obs(topic: &str, payload: &str) -> Observation {
    Observation::now(topic, payload).unwrap()
}

/// Wait until the relay task has buffered `n` records
async fn wait_for_pending(outbox: &Outbox, n: usize) {
    for _ in 0..200 {
        if outbox.len().unwrap() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("outbox never reached {n} records");
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(t, p)| (t.to_string(), p.to_string()))
        .collect()
}

// ============================================
// Routing and drain ordering
// ============================================

#[tokio::test]
async fn test_buffered_while_down_then_drained_in_order_on_reconnect() {
    let h = Harness::in_memory();
    let mut relay = h.relay();
    let cancel = CancellationToken::new();

    let t = h.monitor.probe().await;
    assert_eq!(t.current, ConnectivityState::Down);
    assert!(relay.on_probe(t, &cancel).await.unwrap().is_none());

    assert_eq!(
        relay.handle(&obs("t1", "a")).await.unwrap(),
        Route::Buffered { sequence_id: 1 }
    );
    assert_eq!(
        relay.handle(&obs("t2", "b")).await.unwrap(),
        Route::Buffered { sequence_id: 2 }
    );
    assert!(h.broker.delivered().is_empty());

    h.set_link(true);
    let t = h.monitor.probe().await;
    assert!(t.is_reconnect());
    let report = relay.on_probe(t, &cancel).await.unwrap().unwrap();

    assert_eq!(report.delivered, 2);
    assert_eq!(report.stop, DrainStop::Exhausted);
    assert_eq!(h.broker.delivered(), pairs(&[("t1", "a"), ("t2", "b")]));
    assert!(h.outbox.is_empty().unwrap());
}

#[tokio::test]
async fn test_failed_record_halts_drain_and_keeps_order() {
    let h = Harness::in_memory();
    let mut relay = h.relay();
    let cancel = CancellationToken::new();

    h.monitor.probe().await;
    for (topic, payload) in [("t", "1"), ("t", "2"), ("t", "3")] {
        relay.handle(&obs(topic, payload)).await.unwrap();
    }

    h.broker.reject("2");
    h.set_link(true);
    let t = h.monitor.probe().await;
    let report = relay.on_probe(t, &cancel).await.unwrap().unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.stop, DrainStop::PublishFailed { sequence_id: 2 });
    assert_eq!(
        h.pending(),
        vec![(2, "2".to_string()), (3, "3".to_string())]
    );

    // Next pass picks up exactly where the last one stopped
    h.broker.accept_all();
    let report = relay.drain(&cancel).await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(
        h.broker.delivered(),
        pairs(&[("t", "1"), ("t", "2"), ("t", "3")])
    );
    assert!(h.outbox.is_empty().unwrap());
}

#[tokio::test]
async fn test_steady_up_publishes_directly_without_buffering() {
    let h = Harness::in_memory();
    let mut relay = h.relay();
    let cancel = CancellationToken::new();

    h.set_link(true);
    h.monitor.probe().await;

    for (topic, payload) in [
        ("gps/latitude", "55.75"),
        ("gps/longitude", "37.61"),
        ("gps/altitude", "140"),
    ] {
        assert_eq!(
            relay.handle(&obs(topic, payload)).await.unwrap(),
            Route::Published
        );
        let t = h.monitor.probe().await;
        assert!(relay.on_probe(t, &cancel).await.unwrap().is_none());
    }

    assert!(h.outbox.is_empty().unwrap());
    assert_eq!(relay.stats().published, 3);
    assert_eq!(relay.stats().drain_passes, 0);
}

#[tokio::test]
async fn test_observations_never_trigger_drain() {
    let h = Harness::in_memory();
    let mut relay = h.relay();

    h.monitor.probe().await;
    relay.handle(&obs("t1", "old")).await.unwrap();

    // Link comes back but no probe has reported it yet
    h.set_link(true);
    relay.handle(&obs("t2", "new")).await.unwrap();

    assert!(h.broker.delivered().is_empty());
    assert_eq!(h.outbox.len().unwrap(), 2);
    assert_eq!(relay.stats().drain_passes, 0);
}

#[tokio::test]
async fn test_down_edge_and_steady_down_do_not_drain() {
    let h = Harness::in_memory();
    let mut relay = h.relay();
    let cancel = CancellationToken::new();

    h.set_link(true);
    let t = h.monitor.probe().await;
    relay.on_probe(t, &cancel).await.unwrap();

    h.set_link(false);
    let went_down = h.monitor.probe().await;
    relay.handle(&obs("t", "x")).await.unwrap();
    let still_down = h.monitor.probe().await;

    assert!(relay.on_probe(went_down, &cancel).await.unwrap().is_none());
    assert!(relay.on_probe(still_down, &cancel).await.unwrap().is_none());
    assert_eq!(h.outbox.len().unwrap(), 1);
}

#[tokio::test]
async fn test_probe_error_and_timeout_count_as_down() {
    struct Hung;
    struct NoCarrier;

    #[async_trait]
    impl Probe for NoCarrier {
        fn name(&self) -> &str {
            "no-carrier"
        }

        async fn check(&self) -> Result<bool> {
            Err(Error::Probe("modem reports no carrier".to_string()))
        }
    }

    #[async_trait]
    impl Probe for Hung {
        fn name(&self) -> &str {
            "hung"
        }

        async fn check(&self) -> Result<bool> {
            std::future::pending::<Result<bool>>().await
        }
    }

    let monitor = ConnectivityMonitor::with_settings(Box::new(Hung), Duration::from_millis(20), 1);
    let t = monitor.probe().await;
    assert_eq!(t.current, ConnectivityState::Down);

    let monitor =
        ConnectivityMonitor::with_settings(Box::new(NoCarrier), Duration::from_secs(1), 1);
    let t = monitor.probe().await;
    assert_eq!(t.current, ConnectivityState::Down);
    assert!(!t.is_reconnect());
}

// ============================================
// Run loop
// ============================================

#[tokio::test]
async fn test_run_loop_delivers_everything_across_an_outage() {
    let h = Harness::in_memory();
    let relay = h.relay();
    let cancel = CancellationToken::new();
    let (intake, rx) = Intake::channel(16);

    let run = tokio::spawn(relay.run(rx, cancel.clone()));

    intake.report(h.monitor.probe().await).await.unwrap();
    intake.submit(obs("t", "1")).await.unwrap();
    intake.submit(obs("t", "2")).await.unwrap();
    wait_for_pending(&h.outbox, 2).await;

    h.set_link(true);
    intake.report(h.monitor.probe().await).await.unwrap();
    intake.submit(obs("t", "3")).await.unwrap();

    drop(intake);
    let stats = run.await.unwrap().unwrap();

    assert_eq!(
        h.broker.delivered(),
        pairs(&[("t", "1"), ("t", "2"), ("t", "3")])
    );
    assert_eq!(stats.buffered, 2);
    assert_eq!(stats.drained, 2);
    assert_eq!(stats.published, 1);
    assert!(h.outbox.is_empty().unwrap());
}

#[tokio::test]
async fn test_cancelled_run_buffers_queued_observations() {
    let h = Harness::in_memory();
    let relay = h.relay();
    let cancel = CancellationToken::new();
    let (intake, rx) = Intake::channel(16);

    // Queue everything before the loop ever runs
    intake.submit(obs("t", "1")).await.unwrap();
    intake.submit(obs("t", "2")).await.unwrap();
    cancel.cancel();

    let stats = relay.run(rx, cancel).await.unwrap();
    assert_eq!(stats.buffered, 2);
    assert_eq!(
        h.pending(),
        vec![(1, "1".to_string()), (2, "2".to_string())]
    );
}

#[tokio::test]
async fn test_pumped_source_reaches_outbox_while_down() {
    let h = Harness::in_memory();
    let relay = h.relay();
    let cancel = CancellationToken::new();
    let (intake, rx) = Intake::channel(4);

    let run = tokio::spawn(relay.run(rx, cancel.clone()));
    let items = (0..10).map(|i| obs("remote_device/temperature", &i.to_string()));
    let report = pump(VecSource::new(items), intake, cancel.clone())
        .await
        .unwrap();
    assert_eq!(report.forwarded, 10);

    let stats = run.await.unwrap().unwrap();
    assert_eq!(stats.buffered, 10);
    assert_eq!(h.outbox.len().unwrap(), 10);
}

#[tokio::test]
async fn test_shutdown_mid_frame_buffers_every_decoded_observation() {
    const GPS_FRAME: &str = concat!(
        r#"{"kind":"gps","latitude":55.75,"longitude":37.61,"altitude":140,"#,
        r#""year":2024,"month":5,"day":6,"hour":7,"minute":8,"second":9}"#,
        "\n",
    );

    let h = Harness::in_memory();
    let relay = h.relay();
    let cancel = CancellationToken::new();
    let (intake, rx) = Intake::channel(1);

    let source = JsonLinesSource::new(BufReader::new(GPS_FRAME.as_bytes()));
    let feeder = tokio::spawn(pump(source, intake, cancel.clone()));
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    cancel.cancel();
    let stats = relay.run(rx, cancel.clone()).await.unwrap();
    let report = feeder.await.unwrap().unwrap();
    let salvaged = buffer_undelivered(&h.outbox, report.undelivered);

    assert_eq!(stats.buffered + salvaged, 4);
    let topics: Vec<String> = h
        .outbox
        .peek_all_ordered()
        .map(|r| r.unwrap().observation.topic().to_string())
        .collect();
    assert_eq!(
        topics,
        vec!["gps/latitude", "gps/longitude", "gps/altitude", "datetime"]
    );
}

// ============================================
// Durability
// ============================================

#[tokio::test]
async fn test_outbox_survives_restart_and_drains_after() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("outbox.db");

    {
        let h = Harness::on_disk(&path);
        let mut relay = h.relay();
        h.monitor.probe().await;
        relay.handle(&obs("gps/latitude", "55.75")).await.unwrap();
        relay.handle(&obs("gps/longitude", "37.61")).await.unwrap();
    }

    // Fresh process: state starts Unknown, first Up probe is a reconnect edge
    let h = Harness::on_disk(&path);
    let mut relay = h.relay();
    h.set_link(true);
    let t = h.monitor.probe().await;
    assert_eq!(t.previous, ConnectivityState::Unknown);

    let report = relay
        .on_probe(t, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(
        h.broker.delivered(),
        pairs(&[("gps/latitude", "55.75"), ("gps/longitude", "37.61")])
    );
}

#[tokio::test]
async fn test_full_outbox_surfaces_storage_error() {
    let config = OutboxConfig {
        path: None,
        max_records: 1,
        drain_page_size: 64,
    };
    let h = Harness::with_outbox(Outbox::open_in_memory(&config).unwrap());
    let mut relay = h.relay();
    h.monitor.probe().await;

    relay.handle(&obs("t", "1")).await.unwrap();
    let err = relay.handle(&obs("t", "2")).await.unwrap_err();
    assert!(err.is_storage());
    assert_eq!(h.outbox.len().unwrap(), 1);
}

#[tokio::test]
async fn test_run_loop_rejects_newest_when_full_and_keeps_running() {
    let config = OutboxConfig {
        path: None,
        max_records: 2,
        drain_page_size: 64,
    };
    let h = Harness::with_outbox(Outbox::open_in_memory(&config).unwrap());
    let relay = h.relay();
    let cancel = CancellationToken::new();
    let (intake, rx) = Intake::channel(16);

    let run = tokio::spawn(relay.run(rx, cancel.clone()));
    for payload in ["1", "2", "3"] {
        intake.submit(obs("t", payload)).await.unwrap();
    }
    // Still accepting events after the rejection
    intake.report(h.monitor.probe().await).await.unwrap();
    drop(intake);

    let stats = run.await.unwrap().unwrap();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.buffered, 2);
    assert_eq!(
        h.pending(),
        vec![(1, "1".to_string()), (2, "2".to_string())]
    );
}
