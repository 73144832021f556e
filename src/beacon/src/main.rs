//! Beacon — client-resident telemetry and experimentation engine.
//!
//! `beacon replay` composes one engine per process, drives it from a
//! scripted scenario, force-flushes the queue and prints the reports.

mod scenario;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use beacon_analytics::{Collector, HttpCollector, LogCollector, Tracker};
use beacon_core::config::BeaconConfig;
use beacon_core::consent::ConsentState;
use beacon_core::event_bus::EventSink;
use beacon_core::storage::open_store;
use beacon_experiments::ExperimentRegistry;
use beacon_reporting::{CohortEngine, FunnelEngine};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use crate::scenario::{Engines, Scenario};

#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(about = "Client-side telemetry, experimentation and behavioural reporting")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON); environment overrides apply
    #[arg(long, global = true, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a scripted scenario and print experiment/funnel/cohort reports
    Replay {
        /// Scenario file (JSON)
        #[arg(long)]
        input: PathBuf,

        /// Collector URL (overrides config)
        #[arg(long)]
        endpoint: Option<String>,

        /// Start with tracking consent denied
        #[arg(long, default_value_t = false)]
        consent_denied: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = BeaconConfig::load_from(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Replay {
            input,
            endpoint,
            consent_denied,
        } => {
            if let Some(endpoint) = endpoint {
                config.collector.endpoint = Some(endpoint);
            }
            replay(config, input, consent_denied).await
        }
    }
}

async fn replay(config: BeaconConfig, input: PathBuf, consent_denied: bool) -> anyhow::Result<()> {
    let scenario = Scenario::load(&input)?;

    info!(
        app_id = %config.app_id,
        batch_size = config.queue.batch_size,
        flush_interval_ms = config.queue.flush_interval_ms,
        endpoint = ?config.collector.endpoint,
        "Configuration loaded"
    );

    let collector: Arc<dyn Collector> = match config.collector.endpoint {
        Some(_) => Arc::new(HttpCollector::new(&config.collector)?),
        None => Arc::new(LogCollector::new()),
    };

    let store = open_store(config.storage.path.as_deref())?;
    let consent = Arc::new(ConsentState::load(&config.consent, store.clone()));
    if consent_denied {
        consent.set_granted(false);
    }

    let tracker = Tracker::new(
        &config,
        &scenario.navigation(),
        scenario.device.device_info(),
        collector,
        consent,
    );
    let sink: Arc<dyn EventSink> = tracker.clone();
    let registry = ExperimentRegistry::new(&config.experiments, store, sink.clone());
    let funnels = FunnelEngine::new(sink.clone());
    let cohorts = CohortEngine::new(sink);

    scenario.register(&registry, &funnels)?;
    tracker.start();

    Engines {
        tracker: &tracker,
        registry: &registry,
        funnels: &funnels,
        cohorts: &cohorts,
    }
    .replay(&scenario);

    let outcome = tracker.shutdown().await;
    info!(outcome = ?outcome, stats = ?tracker.stats(), "tracker shut down");

    let today = Utc::now().date_naive();
    let cohort_start = scenario.cohort_start.unwrap_or(today - Duration::days(90));
    let cohort_end = scenario.cohort_end.unwrap_or(today);

    let report = json!({
        "session": tracker.session(),
        "queue": tracker.stats(),
        "experiments": registry
            .list()
            .iter()
            .filter_map(|e| registry.analyze(&e.id))
            .collect::<Vec<_>>(),
        "funnels": funnels
            .list_funnels()
            .iter()
            .filter_map(|f| funnels.analyze(&f.name, None))
            .collect::<Vec<_>>(),
        "cohorts": cohorts.analyze(cohort_start, cohort_end),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
