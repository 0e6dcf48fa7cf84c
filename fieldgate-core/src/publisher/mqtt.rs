//! MQTT publisher over rumqttc
//!
//! The rumqttc event loop runs in its own task. It keeps a connection flag
//! (usable as a connectivity probe) and forwards delivery notifications to
//! the publisher, which uses them to turn rumqttc's fire-and-forget request
//! queue into a per-call verdict.
//!
//! Publishes are serialized: one observation is in flight at a time, and the
//! n-th outgoing PUBLISH reported by the event loop belongs to the n-th
//! request handed to the client. A publish abandoned by timeout stays in
//! rumqttc's queue and may still reach the broker; the observation is then
//! redelivered from the outbox (at-least-once).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Publisher;
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::types::Observation;

/// Pause between reconnect attempts after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Request queue depth between client and event loop
const REQUEST_CAPACITY: usize = 16;

/// Delivery notifications from the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// A PUBLISH was written to the socket with this packet id
    Sent(u16),
    /// The broker acknowledged this packet id (QoS 1)
    Acked(u16),
    /// The connection dropped; outstanding publishes will not be acknowledged
    Reset,
}

/// Matches outgoing PUBLISH notifications to requests by position.
#[derive(Debug, Default)]
struct DeliveryTracker {
    submitted: u64,
    sent: u64,
}

/// The publish currently waiting for its verdict
#[derive(Debug)]
struct Pending {
    index: u64,
    qos: QoS,
    pkid: Option<u16>,
}

impl DeliveryTracker {
    /// Account for a notification that arrived while nothing was in flight
    fn absorb(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Sent(_) => self.sent = (self.sent + 1).min(self.submitted),
            Delivery::Reset => self.sent = self.submitted,
            Delivery::Acked(_) => {}
        }
    }

    /// Register a request just handed to the client
    fn begin(&mut self, qos: QoS) -> Pending {
        self.submitted += 1;
        Pending {
            index: self.submitted,
            qos,
            pkid: None,
        }
    }

    /// Feed one notification; returns the verdict once it is known
    fn observe(&mut self, pending: &mut Pending, delivery: Delivery) -> Option<Result<()>> {
        match delivery {
            Delivery::Sent(pkid) => {
                self.sent = (self.sent + 1).min(self.submitted);
                if self.sent == pending.index {
                    if pending.qos == QoS::AtMostOnce {
                        return Some(Ok(()));
                    }
                    pending.pkid = Some(pkid);
                }
                None
            }
            Delivery::Acked(pkid) if pending.pkid == Some(pkid) => Some(Ok(())),
            Delivery::Acked(_) => None,
            Delivery::Reset => {
                self.sent = self.submitted;
                Some(Err(Error::Publish(
                    "broker connection lost before acknowledgement".to_string(),
                )))
            }
        }
    }
}

struct Inflight {
    events: mpsc::UnboundedReceiver<Delivery>,
    tracker: DeliveryTracker,
}

/// Publishes observations to an MQTT broker.
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    timeout: Duration,
    connected: Arc<AtomicBool>,
    inflight: Mutex<Inflight>,
}

impl MqttPublisher {
    /// Create the client and spawn its event loop.
    ///
    /// The event loop connects in the background and keeps reconnecting
    /// until `cancel` fires. The returned handle completes after that.
    pub fn connect(config: &BrokerConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(
            config.resolved_client_id(),
            config.host.clone(),
            config.port,
        );
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let Some(username) = &config.username {
            options.set_credentials(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            );
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            host = %config.host,
            port = config.port,
            qos = config.qos,
            "Starting MQTT client"
        );

        let handle = tokio::spawn(drive_event_loop(
            eventloop,
            Arc::clone(&connected),
            tx,
            cancel,
        ));

        let publisher = Self {
            client,
            qos: qos_from_level(config.qos),
            timeout: config.publish_timeout(),
            connected,
            inflight: Mutex::new(Inflight {
                events: rx,
                tracker: DeliveryTracker::default(),
            }),
        };

        (publisher, handle)
    }

    /// Flag that is true while the broker session is established
    pub fn connection_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a DISCONNECT to the broker
    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::Publish(format!("disconnect failed: {}", e)))
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, observation: &Observation) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Publish("broker connection is down".to_string()));
        }

        let mut guard = self.inflight.lock().await;
        let inflight = &mut *guard;

        while let Ok(stale) = inflight.events.try_recv() {
            inflight.tracker.absorb(stale);
        }

        let attempt = async {
            self.client
                .publish(
                    observation.topic(),
                    self.qos,
                    false,
                    observation.payload().as_bytes().to_vec(),
                )
                .await
                .map_err(|e| Error::Publish(format!("client request failed: {}", e)))?;

            let mut pending = inflight.tracker.begin(self.qos);
            while let Some(delivery) = inflight.events.recv().await {
                if let Some(verdict) = inflight.tracker.observe(&mut pending, delivery) {
                    return verdict;
                }
            }
            Err(Error::Publish("MQTT event loop stopped".to_string()))
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(verdict) => verdict,
            Err(_) => Err(Error::Publish(format!(
                "no broker acknowledgement within {} ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::SeqCst);
                    info!("Connected to MQTT broker");
                } else {
                    warn!(code = ?ack.code, "MQTT broker refused connection");
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = deliveries.send(Delivery::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                let _ = deliveries.send(Delivery::Reset);
                warn!("MQTT broker closed the session");
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = deliveries.send(Delivery::Sent(pkid));
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!(error = %e, "Lost MQTT broker connection");
                } else {
                    debug!(error = %e, "MQTT connection attempt failed");
                }
                let _ = deliveries.send(Delivery::Reset);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    debug!("MQTT event loop stopped");
}
