//! Observation producers
//!
//! A source yields observations one at a time; [`pump`] forwards them into
//! the relay intake. The bundled [`JsonLinesSource`] reads tagged sensor
//! frames, one JSON object per line:
//!
//! ```text
//! {"kind":"remote_device","readings":{"temperature":21.5}}
//! {"kind":"gps","latitude":55.75,"longitude":37.61,"altitude":140,"year":2024,...}
//! {"kind":"battery","percentage":87}
//! {"kind":"raw","topic":"gateway/uptime","payload":"3600"}
//! ```

pub mod decode;

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::outbox::Outbox;
use crate::relay::Intake;
use crate::types::Observation;

pub use decode::GpsFix;

/// Produces observations until exhausted.
#[async_trait]
pub trait ObservationSource: Send {
    /// Next observation, or `None` once the source is exhausted
    async fn next(&mut self) -> Result<Option<Observation>>;

    /// Observations already decoded but not yet returned by `next`
    fn take_decoded(&mut self) -> Vec<Observation> {
        Vec::new()
    }
}

/// One line of input
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame {
    RemoteDevice { readings: Map<String, Value> },
    Gps(GpsFix),
    Battery { percentage: f64 },
    Raw { topic: String, payload: String },
}

impl Frame {
    fn into_observations(self) -> Result<Vec<Observation>> {
        let now = Utc::now();
        match self {
            Frame::RemoteDevice { readings } => decode::remote_device(&readings, now),
            Frame::Gps(fix) => decode::gps(&fix, now),
            Frame::Battery { percentage } => Ok(vec![decode::battery(percentage, now)?]),
            Frame::Raw { topic, payload } => Ok(vec![Observation::new(topic, payload, now)?]),
        }
    }
}

/// Reads tagged sensor frames from a line-oriented reader.
///
/// Blank lines are ignored. Lines that are not UTF-8 or fail to parse or
/// decode are logged and skipped; only I/O errors end the source with an
/// error.
pub struct JsonLinesSource<R> {
    reader: R,
    /// Bytes of the line being read; kept across cancelled reads
    buf: Vec<u8>,
    pending: VecDeque<Observation>,
    line_no: u64,
    skipped: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pending: VecDeque::new(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Lines dropped as malformed so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn decode_line(raw: Vec<u8>) -> Result<Vec<Observation>> {
        let line = String::from_utf8(raw).map_err(|e| {
            Error::MalformedObservation(format!("line is not valid UTF-8: {}", e.utf8_error()))
        })?;
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let frame: Frame = serde_json::from_str(line)?;
        frame.into_observations()
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ObservationSource for JsonLinesSource<R> {
    async fn next(&mut self) -> Result<Option<Observation>> {
        loop {
            if let Some(observation) = self.pending.pop_front() {
                return Ok(Some(observation));
            }

            let read = self.reader.read_until(b'\n', &mut self.buf).await?;
            if read == 0 && self.buf.is_empty() {
                return Ok(None);
            }
            self.line_no += 1;

            let raw = std::mem::take(&mut self.buf);
            match Self::decode_line(raw) {
                Ok(observations) => self.pending.extend(observations),
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %e, "Skipping malformed frame");
                }
            }
        }
    }

    fn take_decoded(&mut self) -> Vec<Observation> {
        self.pending.drain(..).collect()
    }
}

/// Outcome of [`pump`]
#[derive(Debug, Default)]
pub struct PumpReport {
    /// Observations the relay accepted
    pub forwarded: u64,
    /// Decoded observations the relay never accepted, oldest first
    pub undelivered: Vec<Observation>,
}

/// Forward every observation from `source` into the relay intake.
///
/// Stops when the source is exhausted, when `cancel` fires, or when the
/// relay closes its intake. Observations already decoded at that point are
/// returned in [`PumpReport::undelivered`] rather than dropped; see
/// [`buffer_undelivered`]. A hand-over in progress is not interrupted by
/// `cancel`, so the relay must close its intake once it stops.
pub async fn pump<S>(mut source: S, intake: Intake, cancel: CancellationToken) -> Result<PumpReport>
where
    S: ObservationSource,
{
    let mut report = PumpReport::default();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next() => next?,
        };
        let Some(observation) = next else {
            debug!(forwarded = report.forwarded, "Observation source exhausted");
            break;
        };

        if let Err(observation) = intake.offer(observation).await {
            warn!("Relay intake closed while the source was still producing");
            report.undelivered.push(observation);
            break;
        }
        report.forwarded += 1;
    }

    report.undelivered.extend(source.take_decoded());
    if !report.undelivered.is_empty() {
        warn!(
            count = report.undelivered.len(),
            "Source stopped with observations the relay did not accept"
        );
    }
    Ok(report)
}

/// Write observations a source could not hand over straight to the outbox.
///
/// Returns how many were buffered. Each one that cannot be stored is logged
/// with its topic and payload.
pub fn buffer_undelivered(
    outbox: &Outbox,
    observations: impl IntoIterator<Item = Observation>,
) -> usize {
    let mut buffered = 0;
    for observation in observations {
        match outbox.enqueue(&observation) {
            Ok(_) => buffered += 1,
            Err(e) => error!(
                topic = %observation.topic(),
                payload = %observation.payload(),
                error = %e,
                "Observation could not be buffered at shutdown"
            ),
        }
    }
    buffered
}

/// Source over a fixed list, mostly useful for tests and one-shot commands.
pub struct VecSource {
    items: VecDeque<Observation>,
}

impl VecSource {
    pub fn new(items: impl IntoIterator<Item = Observation>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ObservationSource for VecSource {
    async fn next(&mut self) -> Result<Option<Observation>> {
        Ok(self.items.pop_front())
    }

    fn take_decoded(&mut self) -> Vec<Observation> {
        self.items.drain(..).collect()
    }
}
