//! Rito live ingestion daemon.
//!
//! Subscribes to Jetstream for the Rito collections and keeps the SQLite
//! index current.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: public Jetstream endpoints, ./data/rito.db, metrics on 9091
//! rito-ingest
//!
//! # Custom database and endpoints, start an hour back on first run
//! rito-ingest \
//!     --database-path /var/lib/rito/rito.db \
//!     --endpoints wss://jetstream.example/subscribe \
//!     --lookback-minutes 60
//! ```
//!
//! Every flag can also be set through its `RITO_*` environment variable or
//! a `.env` file.
//!
//! # Graceful Shutdown
//!
//! On SIGINT or SIGTERM the daemon:
//! 1. Finishes the event in flight
//! 2. Closes the websocket
//! 3. Flushes the committed cursor
//! 4. Exits cleanly

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use metrics::gauge;
use rito_core::metrics::{init_metrics, start_metrics_server};
use rito_ingest::config::{EnrichArgs, JetstreamArgs, StoreArgs};
use rito_ingest::status::{self, StatusState};
use rito_ingest::{
    Checkpointer, CursorStore, Database, EventSource, IndexStore, IngestConfig, IngestDriver,
    JetstreamSource, Pipeline,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Rito live ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "rito-ingest")]
#[command(about = "Index Rito bookmarks, likes, resolvers and verifications from Jetstream")]
#[command(version)]
struct Args {
    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    jetstream: JetstreamArgs,

    #[command(flatten)]
    enrich: EnrichArgs,

    /// Log a progress line every N events
    #[arg(long, env = "RITO_PROGRESS_INTERVAL", default_value = "10000")]
    progress_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("rito_ingest=debug".parse()?),
        )
        .init();

    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    let args = Args::parse();
    let config = IngestConfig::from_args(&args.store, &args.jetstream, &args.enrich);
    config.validate().context("Invalid configuration")?;

    tracing::info!("Rito ingestion daemon starting...");
    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", config.database_path.display());
    tracing::info!("  Endpoints: {}", config.jetstream.endpoints.join(", "));
    tracing::info!(
        "  Collections: {}",
        config.jetstream.wanted_collections.join(", ")
    );
    tracing::info!("  Checkpoint interval: {:?}", config.checkpoint.interval);
    tracing::info!("  Verification policy: {:?}", config.enrich.policy);

    // Open storage
    let db = Database::open(&config.database_path)
        .with_context(|| format!("Failed to open database at {:?}", config.database_path))?;
    let index = Arc::new(IndexStore::new(db.clone()));
    let cursors = CursorStore::new(db);

    let counts = index.counts()?;
    tracing::info!(
        "Index opened: {} bookmarks, {} likes, {} resolvers, {} verifications",
        counts.bookmarks,
        counts.likes,
        counts.resolvers,
        counts.verifications
    );

    // Initialize metrics and the status surface
    if config.metrics_port > 0 {
        let metrics_handle = init_metrics();
        let routes = status::router(StatusState::new(cursors.clone()));
        start_metrics_server(config.metrics_port, metrics_handle, routes)
            .await
            .with_context(|| format!("Failed to bind metrics port {}", config.metrics_port))?;
        gauge!("ingestion_running").set(1.0);
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
        let _ = shutdown_tx.send(true);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Build the pipeline
    let enrichers = config
        .enrich
        .build_enrichers()
        .context("Failed to build enrichment collaborators")?;
    tracing::info!("Blocklist: {} domains", enrichers.blocklist.len());

    let checkpoint = Checkpointer::load(cursors, Arc::clone(&index), config.checkpoint)
        .context("Failed to load cursor")?;
    let mut driver = IngestDriver::new(
        Pipeline::new(Arc::clone(&index), enrichers),
        checkpoint,
        Arc::clone(&running),
    )
    .with_progress_interval(args.progress_interval);

    // Run the ingestion loop
    tracing::info!("Starting live ingestion...");
    let mut source = JetstreamSource::new(config.jetstream.clone());
    let result = source.run(&mut driver, shutdown_rx).await;

    // Shutdown sequence
    tracing::info!("Shutting down...");
    let final_cursor = driver.finish().context("Failed to flush cursor")?;
    gauge!("ingestion_running").set(0.0);

    let stats = result.context("Jetstream source failed")?;
    let driver_stats = driver.stats();

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events received:      {}", stats.total_events);
    tracing::info!("Events processed:     {}", driver_stats.processed);
    tracing::info!("  committed:          {}", driver_stats.committed);
    tracing::info!("  stale:              {}", driver_stats.stale);
    tracing::info!("  rejected:           {}", driver_stats.rejected);
    tracing::info!("  ignored:            {}", driver_stats.ignored);
    tracing::info!("Decode errors:        {}", stats.decode_errors);
    tracing::info!("Persistence errors:   {}", driver_stats.persistence_errors);
    tracing::info!(
        "Connections:          {}",
        stats.source_metadata.connections.unwrap_or(0)
    );
    tracing::info!(
        "Reconnects:           {}",
        stats.source_metadata.reconnects.unwrap_or(0)
    );
    tracing::info!("Final cursor:         {:?}", final_cursor);

    Ok(())
}
