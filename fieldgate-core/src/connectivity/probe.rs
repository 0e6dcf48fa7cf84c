//! Uplink probes
//!
//! A probe answers one question: can we reach the broker right now? The
//! monitor applies the timeout, so probes may block as long as the
//! underlying I/O does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::{Config, ProbeKind};
use crate::error::{Error, Result};

/// One connectivity check.
///
/// `Ok(false)` and `Err(_)` both mean the uplink is unusable; the error
/// carries the reason for logging.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Short name used in log fields
    fn name(&self) -> &str;

    async fn check(&self) -> Result<bool>;
}

/// Reads a connection flag maintained by the broker client.
pub struct FlagProbe {
    flag: Arc<AtomicBool>,
}

impl FlagProbe {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }
}

#[async_trait]
impl Probe for FlagProbe {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> Result<bool> {
        Ok(self.flag.load(Ordering::SeqCst))
    }
}

/// Opens (and immediately drops) a TCP connection to `host:port`.
pub struct TcpProbe {
    target: String,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn check(&self) -> Result<bool> {
        TcpStream::connect(&self.target)
            .await
            .map(|_| true)
            .map_err(|e| Error::Probe(format!("connect to {} failed: {}", self.target, e)))
    }
}

/// Issues a GET against a health endpoint; any 2xx counts as up.
pub struct HttpProbe {
    http_client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn name(&self) -> &str {
        "http"
    }

    async fn check(&self) -> Result<bool> {
        let response = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Probe(format!("HTTP request failed: {}", e)))?;

        Ok(response.status().is_success())
    }
}

/// Build the probe selected in configuration.
///
/// `broker_flag` is the connection flag of the running broker client; it is
/// required for the `broker` probe.
pub fn probe_from_config(
    config: &Config,
    broker_flag: Option<Arc<AtomicBool>>,
) -> Result<Box<dyn Probe>> {
    match config.connectivity.probe {
        ProbeKind::Broker => {
            let flag = broker_flag.ok_or_else(|| {
                Error::Config("probe = \"broker\" requires a broker connection".to_string())
            })?;
            Ok(Box::new(FlagProbe::new(flag)))
        }
        ProbeKind::Tcp => Ok(Box::new(TcpProbe::new(config.tcp_probe_target()))),
        ProbeKind::Http => {
            let url = config.connectivity.health_url.clone().ok_or_else(|| {
                Error::Config("connectivity.health_url is required".to_string())
            })?;
            Ok(Box::new(HttpProbe::new(url)?))
        }
    }
}
