//! Uplink connectivity tracking
//!
//! The [`ConnectivityMonitor`] wraps a [`Probe`], bounds every check with a
//! timeout, debounces flapping links, and reports each probe as a
//! [`Transition`] so callers can tell a reconnect edge from a steady state.

mod probe;

pub use probe::{probe_from_config, FlagProbe, HttpProbe, Probe, TcpProbe};

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::ConnectivityConfig;
use crate::types::{ConnectivityState, Transition};

/// Consecutive identical verdicts seen so far
#[derive(Debug, Clone, Copy)]
struct Streak {
    verdict: ConnectivityState,
    count: u32,
}

/// Tracks whether the uplink is usable.
pub struct ConnectivityMonitor {
    probe: Box<dyn Probe>,
    timeout: Duration,
    debounce: u32,
    state: watch::Sender<ConnectivityState>,
    streak: Mutex<Streak>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Box<dyn Probe>, config: &ConnectivityConfig) -> Self {
        Self::with_settings(probe, config.probe_timeout(), config.debounce_probes)
    }

    /// `debounce` is the number of consecutive agreeing probes required to
    /// flip between `Up` and `Down`. The first probe always resolves
    /// `Unknown`.
    pub fn with_settings(probe: Box<dyn Probe>, timeout: Duration, debounce: u32) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Unknown);
        Self {
            probe,
            timeout,
            debounce: debounce.max(1),
            state,
            streak: Mutex::new(Streak {
                verdict: ConnectivityState::Unknown,
                count: 0,
            }),
        }
    }

    /// Last known state; never blocks.
    pub fn current(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Watch state changes without probing
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Run one bounded check and update the tracked state.
    ///
    /// A probe that errors or exceeds the timeout is a `Down` verdict.
    pub async fn probe(&self) -> Transition {
        let verdict = match tokio::time::timeout(self.timeout, self.probe.check()).await {
            Ok(Ok(true)) => ConnectivityState::Up,
            Ok(Ok(false)) => ConnectivityState::Down,
            Ok(Err(e)) => {
                tracing::debug!(probe = self.probe.name(), error = %e, "Connectivity probe failed");
                ConnectivityState::Down
            }
            Err(_) => {
                tracing::debug!(
                    probe = self.probe.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Connectivity probe timed out"
                );
                ConnectivityState::Down
            }
        };

        self.record(verdict)
    }

    fn record(&self, verdict: ConnectivityState) -> Transition {
        // Streak and published state change under one lock so concurrent
        // probes cannot interleave between them.
        let mut streak = self
            .streak
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if streak.verdict == verdict {
            streak.count = streak.count.saturating_add(1);
        } else {
            *streak = Streak { verdict, count: 1 };
        }

        let previous = self.current();
        let next = if previous == ConnectivityState::Unknown || streak.count >= self.debounce {
            verdict
        } else {
            previous
        };
        self.state.send_replace(next);
        drop(streak);

        let transition = Transition::new(previous, next);
        if previous != next {
            tracing::info!(
                probe = self.probe.name(),
                from = %previous,
                to = %next,
                "Uplink state changed"
            );
        }
        transition
    }
}
