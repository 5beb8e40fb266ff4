// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! SentryLine - Edge Video Security Engine
//!
//! Runs one analysis pipeline per configured camera and delivers validated
//! alerts through the configured notifier.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sentryline::config::CameraConfig;
use sentryline::delivery::{DeliverySettings, MemoryOutbox, OutboxStore};
use sentryline::demo::{demo_camera, SimulatedBackend, SyntheticConnector};
use sentryline::detection::{model_backend, InferenceBackend};
use sentryline::evidence::SnapshotEvidenceSink;
use sentryline::notify::{build_notifier, Notifier};
use sentryline::stream::StreamConnector;
use sentryline::supervisor::{ffmpeg_connectors, ConnectorFactory};
use sentryline::validation::{evidence_classifier, Validator};
use sentryline::{build_info, CameraSupervisor, Config, Database, DeliveryQueue, EventBus, Services, NAME, VERSION};

/// SentryLine - Edge Video Security Engine
#[derive(Parser, Debug)]
#[command(name = "sentryline")]
#[command(author = "bad-antics")]
#[command(version = VERSION)]
#[command(about = "Camera stream analysis with validated, reliably delivered security alerts")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Demo mode with synthetic cameras and a simulated detector
    #[arg(long)]
    demo: bool,

    /// Data output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;

    // Initialize logging; RUST_LOG wins over flags and config
    let log_level = if args.trace {
        "trace".to_string()
    } else if args.debug {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("{} v{} - Edge Video Security Engine", NAME, VERSION);
    let build = build_info();
    info!(target = %build.target, os = %build.os, features = ?build.features, "Build");

    // Override with command line args
    if args.demo {
        config.demo_mode = true;
    }
    if let Some(data_dir) = args.data_dir {
        config.database.path = data_dir.join("sentryline.db");
        config.evidence.snapshot_dir = data_dir.join("snapshots");
        config.data_dir = data_dir;
    }

    info!("Configuration loaded from {:?}", config_path);
    info!("Demo mode: {}", config.demo_mode);
    config.validate().context("invalid configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(mut config: Config) -> Result<()> {
    let (backend, connectors): (Arc<dyn InferenceBackend>, ConnectorFactory) = if config.demo_mode {
        if config.cameras.is_empty() {
            config.cameras = vec![
                demo_camera("demo-1", 640, 360, 5.0),
                demo_camera("demo-2", 640, 360, 5.0),
            ];
        }
        let connectors: ConnectorFactory = Arc::new(|camera: &CameraConfig| {
            let (w, h) = camera.target_size().unwrap_or((640, 360));
            Arc::new(SyntheticConnector::new(w as usize, h as usize, camera.fps * 2.0)) as Arc<dyn StreamConnector>
        });
        (Arc::new(SimulatedBackend::new()), connectors)
    } else {
        (model_backend(&config.detector)?, ffmpeg_connectors())
    };

    // Storage
    let database = if config.database.enabled {
        Some(Database::open(&config.database)?)
    } else {
        warn!("Database disabled; pending alerts will not survive a restart");
        None
    };
    let outbox: Arc<dyn OutboxStore> = match &database {
        Some(db) => Arc::new(db.clone()),
        None => Arc::new(MemoryOutbox::new()),
    };

    // Delivery
    let notifier = build_notifier(&config.notifier)?;
    info!("Notifier: {}", notifier.name());
    let delivery = Arc::new(DeliveryQueue::new(
        outbox,
        notifier,
        DeliverySettings::from(&config.delivery),
    ));

    let classifier = evidence_classifier(&config.validator)?;
    let validator = Arc::new(Validator::from_config(&config.validator, classifier));
    info!("Validator scorer: {}", validator.scorer_name());

    let event_bus = Arc::new(EventBus::new(config.supervisor.event_bus_capacity));
    let mut services = Services::new(&config, backend, validator, delivery.clone(), event_bus);
    if let Some(db) = &database {
        services = services.with_database(db.clone());
    }
    if config.evidence.enabled {
        match SnapshotEvidenceSink::new(&config.evidence) {
            Ok(sink) => services = services.with_evidence(Arc::new(sink)),
            Err(e) => error!("Evidence snapshots disabled: {}", e),
        }
    }

    let supervisor = Arc::new(CameraSupervisor::new(services, connectors));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker = tokio::spawn(delivery.clone().run(shutdown_tx.subscribe()));
    tokio::spawn(supervisor.clone().run_health_monitor(shutdown_tx.subscribe()));
    tokio::spawn(supervisor.clone().run_maintenance(config.database.clone(), shutdown_tx.subscribe()));

    let running = supervisor.start_all(&config.cameras);
    info!("{} of {} cameras running", running, config.cameras.len());
    if running == 0 {
        warn!("No cameras running");
    }

    info!("SentryLine running, press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, cleaning up...");

    supervisor.stop_all().await;
    let _ = shutdown_tx.send(());
    if let Err(e) = worker.await {
        error!("Delivery worker failed: {}", e);
    }

    let delivery = delivery.diagnostics();
    info!(
        pending = delivery.pending,
        sent = delivery.sent,
        failed = delivery.failed,
        "Delivery queue at shutdown"
    );

    info!("SentryLine shutdown complete");
    Ok(())
}
