//! Drip: email sequence automation engine.
//!
//! Restores the store from its snapshot, then runs the dispatch scheduler,
//! lease sweeper and trigger intake until interrupted, writing the snapshot
//! back on the way out.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use drip_core::config::AppConfig;
use drip_core::event_bus::tracing_sink;
use drip_dispatch::{
    Contact, DispatchScheduler, InMemoryContacts, LeaseSweeper, LogTransport, MergeTagRenderer,
    TriggerIntake,
};
use drip_sequences::trigger::ContactEvent;
use drip_sequences::{EnrollmentManager, SequenceStore, StoreSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader as AsyncBufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "drip-engine")]
#[command(about = "Email sequence automation engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "DRIP__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between dispatch cycles (overrides config)
    #[arg(long, env = "DRIP__DISPATCH__POLL_INTERVAL_SECS")]
    poll_interval: Option<u64>,

    /// Maximum scheduled emails claimed per cycle (overrides config)
    #[arg(long, env = "DRIP__DISPATCH__BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Store snapshot, loaded at startup and written at shutdown
    #[arg(long, env = "DRIP__STORE__SNAPSHOT_PATH")]
    snapshot: Option<PathBuf>,

    /// JSON array of contacts to serve lookups from
    #[arg(long)]
    contacts: Option<PathBuf>,

    /// Metrics port (overrides config)
    #[arg(long, env = "DRIP__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Do not start the Prometheus exporter
    #[arg(long, default_value_t = false)]
    no_metrics: bool,

    /// Read contact events as JSON lines from stdin
    #[arg(long, default_value_t = false)]
    events_stdin: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drip=info,drip_engine=info,drip_dispatch=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Drip engine starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.poll_interval {
        config.dispatch.poll_interval_secs = secs;
    }
    if let Some(batch) = cli.batch_size {
        config.dispatch.batch_size = batch;
    }
    if let Some(path) = cli.snapshot {
        config.store.snapshot_path = Some(path.display().to_string());
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    if cli.no_metrics {
        config.metrics.enabled = false;
    }
    config
        .dispatch
        .validate()
        .context("invalid dispatch configuration")?;

    info!(
        node_id = %config.node_id,
        poll_interval_secs = config.dispatch.poll_interval_secs,
        batch_size = config.dispatch.batch_size,
        lease_secs = config.dispatch.lease_secs,
        snapshot = ?config.store.snapshot_path,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        if let Err(e) = start_metrics(&config) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let store = Arc::new(match config.store.snapshot_path.as_deref().map(Path::new) {
        Some(path) if path.exists() => {
            let snapshot = load_snapshot(path)?;
            info!(
                sequences = snapshot.sequences.len(),
                enrollments = snapshot.enrollments.len(),
                scheduled_emails = snapshot.scheduled_emails.len(),
                "Store restored from snapshot"
            );
            SequenceStore::from_snapshot(snapshot, config.store.lock_timeout_ms)
        }
        _ => SequenceStore::new(config.store.lock_timeout_ms),
    });

    let contacts = Arc::new(InMemoryContacts::new());
    if let Some(path) = &cli.contacts {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let loaded: Vec<Contact> = serde_json::from_reader(BufReader::new(file))?;
        for contact in loaded {
            contacts.upsert(contact);
        }
        info!(contacts = contacts.len(), "Contacts loaded");
    }

    let events = tracing_sink();
    let manager = EnrollmentManager::new(store.clone())
        .with_event_sink(events.clone())
        .with_node_id(config.node_id.clone());

    let scheduler = Arc::new(
        DispatchScheduler::new(
            manager.clone(),
            contacts,
            Arc::new(MergeTagRenderer::new()),
            Arc::new(LogTransport::new()),
            config.dispatch.clone(),
        )
        .with_event_sink(events.clone())
        .with_worker_id(format!("{}-dispatch", config.node_id)),
    );
    let sweeper = Arc::new(
        LeaseSweeper::new(store.clone(), config.sweeper.interval_secs).with_event_sink(events),
    );
    let intake = Arc::new(TriggerIntake::new(manager).with_dispatch_waker(scheduler.waker()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = TriggerIntake::channel(config.intake.buffer);

    let handles = vec![
        scheduler.clone().spawn(shutdown_rx.clone()),
        sweeper.spawn(shutdown_rx.clone()),
        intake.spawn(event_rx, shutdown_rx.clone()),
    ];

    // Without an input the sender is held so intake waits for shutdown.
    let idle_tx = if cli.events_stdin {
        tokio::spawn(read_events(event_tx));
        None
    } else {
        Some(event_tx)
    };

    info!(worker_id = scheduler.worker_id(), "Drip engine is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    drop(idle_tx);
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }

    if let Some(path) = config.store.snapshot_path.as_deref() {
        save_snapshot(Path::new(path), &store.snapshot()?)?;
        info!(path, "Store snapshot written");
    }

    info!("Drip engine stopped");
    Ok(())
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(config.metrics.host.parse()?, config.metrics.port))
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

fn load_snapshot(path: &Path) -> anyhow::Result<StoreSnapshot> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing snapshot {}", path.display()))
}

fn save_snapshot(path: &Path, snapshot: &StoreSnapshot) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writer.flush()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

async fn read_events(tx: mpsc::Sender<ContactEvent>) {
    let mut lines = AsyncBufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<ContactEvent>(&line) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed contact event"),
            },
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Reading contact events failed");
                break;
            }
        }
    }
    info!("Contact event input closed");
}
