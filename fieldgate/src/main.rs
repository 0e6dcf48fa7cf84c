//! fieldgate - store-and-forward telemetry gateway
//!
//! Relays sensor observations to an MQTT broker, buffering them in a durable
//! outbox while the uplink is down and replaying them when it returns.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Outbox: $XDG_DATA_HOME/fieldgate/outbox.db (~/.local/share/fieldgate/outbox.db)
//! - Logs: $XDG_STATE_HOME/fieldgate/fieldgate.log (~/.local/state/fieldgate/fieldgate.log)
//! - Config: $XDG_CONFIG_HOME/fieldgate/config.toml (~/.config/fieldgate/config.toml)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fieldgate_core::connectivity::probe_from_config;
use fieldgate_core::relay::spawn_probe_loop;
use fieldgate_core::source::{buffer_undelivered, pump, JsonLinesSource};
use fieldgate_core::{
    Config, ConnectivityMonitor, DrainStop, Intake, MqttPublisher, Observation, Outbox, Probe,
    Publisher, Relay,
};
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause between probes while `drain` waits for the uplink
const DRAIN_PROBE_PAUSE: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "fieldgate")]
#[command(about = "Store-and-forward telemetry gateway")]
#[command(version)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/fieldgate/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Mirror logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay until interrupted
    Run {
        /// Read observation frames from stdin as JSON lines
        #[arg(long)]
        stdin: bool,
    },
    /// Show configuration and outbox depth
    Status,
    /// List pending outbox records, oldest first
    Outbox {
        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Connect once and drain the outbox if the uplink is up
    Drain,
    /// Buffer one observation in the outbox
    Enqueue {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    if args.verbose {
        config.logging.stderr = true;
    }

    let _log_guard =
        fieldgate_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("fieldgate starting");

    let outbox_path = config.outbox.resolved_path();
    let outbox = Outbox::open(&outbox_path, &config.outbox)
        .with_context(|| format!("failed to open outbox at {}", outbox_path.display()))?;

    match args.command {
        Command::Run { stdin } => run(&config, outbox, stdin).await,
        Command::Status => status(&config, &outbox),
        Command::Outbox { limit } => list_outbox(&outbox, limit),
        Command::Drain => drain(&config, outbox).await,
        Command::Enqueue { topic, payload } => {
            let observation =
                Observation::now(topic, payload).context("invalid observation")?;
            let record = outbox
                .enqueue(&observation)
                .context("failed to buffer observation")?;
            println!(
                "Buffered #{} {} = {}",
                record.sequence_id,
                record.observation.topic(),
                record.observation.payload()
            );
            Ok(())
        }
    }
}

/// Broker client, connectivity monitor, and the shutdown token they share
struct Uplink {
    publisher: Arc<MqttPublisher>,
    monitor: Arc<ConnectivityMonitor>,
    event_loop: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Uplink {
    fn connect(config: &Config) -> Result<Self> {
        let cancel = CancellationToken::new();
        let (publisher, event_loop) = MqttPublisher::connect(&config.broker, cancel.clone());
        let probe = probe_from_config(config, Some(publisher.connection_flag()))
            .context("failed to build connectivity probe")?;

        tracing::info!(probe = probe.name(), "Connectivity probe selected");

        Ok(Self {
            publisher: Arc::new(publisher),
            monitor: Arc::new(ConnectivityMonitor::new(probe, &config.connectivity)),
            event_loop,
            cancel,
        })
    }

    fn relay(&self, config: &Config, outbox: Arc<Outbox>) -> Relay {
        Relay::new(
            outbox,
            Arc::clone(&self.monitor),
            Arc::clone(&self.publisher) as Arc<dyn Publisher>,
            &config.relay,
        )
    }

    async fn shutdown(self) {
        if self.publisher.is_connected() {
            if let Err(e) = self.publisher.disconnect().await {
                tracing::debug!(error = %e, "Broker disconnect failed");
            }
        }
        self.cancel.cancel();
        if let Err(e) = self.event_loop.await {
            tracing::warn!(error = %e, "MQTT event loop task failed");
        }
    }
}

async fn run(config: &Config, outbox: Outbox, read_stdin: bool) -> Result<()> {
    let outbox = Arc::new(outbox);
    let uplink = Uplink::connect(config)?;
    let relay = uplink.relay(config, Arc::clone(&outbox));
    let cancel = uplink.cancel.child_token();

    let (intake, events) = Intake::channel(config.relay.intake_capacity);

    let probe_loop = spawn_probe_loop(
        Arc::clone(&uplink.monitor),
        config.connectivity.probe_interval(),
        intake.clone(),
        cancel.clone(),
    );

    let source_task = read_stdin.then(|| {
        let source = JsonLinesSource::new(BufReader::new(tokio::io::stdin()));
        let intake = intake.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match pump(source, intake, cancel).await {
                Ok(report) => {
                    tracing::info!(forwarded = report.forwarded, "Stdin source finished");
                    Some(report)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stdin source stopped");
                    None
                }
            }
        })
    });
    drop(intake);

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    println!(
        "fieldgate relaying to {}:{} (Ctrl-C to stop)",
        config.broker.host, config.broker.port
    );

    let result = relay.run(events, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = probe_loop.await {
        tracing::warn!(error = %e, "Probe loop task failed");
    }
    // The intake is closed now, so the source hands back whatever it still holds.
    if let Some(task) = source_task {
        match task.await {
            Ok(Some(report)) if !report.undelivered.is_empty() => {
                let stored = buffer_undelivered(&outbox, report.undelivered);
                tracing::info!(stored, "Buffered observations left over at shutdown");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Stdin source task failed"),
        }
    }
    uplink.shutdown().await;

    let stats = result.context("relay stopped on a storage failure")?;
    println!(
        "Published {} live, buffered {}, drained {} ({} failed attempts, {} rejected)",
        stats.published, stats.buffered, stats.drained, stats.publish_failures, stats.rejected
    );
    tracing::info!("fieldgate stopped");
    Ok(())
}

fn status(config: &Config, outbox: &Outbox) -> Result<()> {
    let depth = outbox.len().context("failed to count outbox records")?;

    println!("Broker:   {}:{} (QoS {})", config.broker.host, config.broker.port, config.broker.qos);
    println!(
        "Probe:    {:?} every {}s, timeout {}ms",
        config.connectivity.probe,
        config.connectivity.probe_interval_secs,
        config.connectivity.probe_timeout_ms
    );
    println!("Outbox:   {}", config.outbox.resolved_path().display());
    match outbox.capacity() {
        0 => println!("Pending:  {}", depth),
        cap => println!("Pending:  {} / {}", depth, cap),
    }
    if let Some(oldest) = outbox.oldest().context("failed to read outbox")? {
        println!(
            "Oldest:   #{} at {}",
            oldest.sequence_id,
            oldest
                .observation
                .observed_at()
                .format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!("Logs:     {}", fieldgate_core::logging::log_file_path().display());
    Ok(())
}

fn list_outbox(outbox: &Outbox, limit: usize) -> Result<()> {
    let total = outbox.len().context("failed to count outbox records")?;
    if total == 0 {
        println!("Outbox is empty");
        return Ok(());
    }

    for record in outbox.peek_all_ordered().take(limit) {
        let record = record.context("failed to read outbox")?;
        println!(
            "#{:<6} {}  {}  {}",
            record.sequence_id,
            record.observation.observed_at().format("%Y-%m-%d %H:%M:%S"),
            record.observation.topic(),
            record.observation.payload()
        );
    }
    if total > limit {
        println!("... {} more", total - limit);
    }
    Ok(())
}

async fn drain(config: &Config, outbox: Outbox) -> Result<()> {
    if outbox.is_empty().context("failed to read outbox")? {
        println!("Outbox is empty, nothing to drain");
        return Ok(());
    }

    let uplink = Uplink::connect(config)?;
    let mut relay = uplink.relay(config, Arc::new(outbox));

    // Give the broker session a moment to come up before judging the link.
    let wait = config.broker.publish_timeout() + config.connectivity.probe_timeout();
    let reached = tokio::time::timeout(wait, async {
        loop {
            if uplink.monitor.probe().await.current.is_up() {
                break;
            }
            tokio::time::sleep(DRAIN_PROBE_PAUSE).await;
        }
    })
    .await
    .is_ok();

    if !reached {
        uplink.shutdown().await;
        bail!("uplink is down; outbox left untouched");
    }

    let report = relay.drain(&uplink.cancel).await;
    let pending = relay.outbox().len();
    uplink.shutdown().await;

    let report = report.context("drain failed on a storage error")?;
    println!(
        "Delivered {} record(s), {} still pending",
        report.delivered,
        pending.context("failed to count outbox records")?
    );
    match report.stop {
        DrainStop::Exhausted => Ok(()),
        DrainStop::PublishFailed { sequence_id } => {
            bail!("publish of record #{} failed; retry later", sequence_id)
        }
        DrainStop::LinkDown => bail!("uplink dropped during drain"),
        DrainStop::Cancelled => bail!("drain cancelled"),
    }
}
