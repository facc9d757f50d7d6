//! Replay captured Jetstream envelopes through the indexing pipeline.
//!
//! Input is one Jetstream JSON envelope per line, as received on the
//! websocket. Events go through the same router, validation, enrichment and
//! store as live ingestion.
//!
//! # Usage
//!
//! ```bash
//! # Single capture file
//! rito-replay -i capture.jsonl
//!
//! # Directory of captures, resumable, against a scratch database
//! rito-replay -i ./captures/ --database-path ./scratch.db --skip-processed
//!
//! # Also move the live cursor forward to the last replayed event
//! rito-replay -i ./captures/ --update-live-cursor
//! ```
//!
//! By default the replay checkpoints under its own cursor row so the live
//! daemon's position is untouched.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use rito_core::JETSTREAM_SERVICE;
use rito_ingest::config::{EnrichArgs, EnrichConfig, StoreArgs};
use rito_ingest::{
    CheckpointConfig, Checkpointer, CursorStore, Database, EventSource, IndexStore, IngestDriver,
    JsonlConfig, JsonlSource, Pipeline,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const REPLAY_SERVICE: &str = "replay";

/// Replay Jetstream JSONL captures into the index.
#[derive(Parser, Debug)]
#[command(name = "rito-replay")]
#[command(about = "Replay captured Jetstream envelopes through the Rito pipeline")]
#[command(version)]
struct Args {
    /// Input JSONL file or directory path
    #[arg(short, long)]
    input: PathBuf,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    enrich: EnrichArgs,

    /// Abort on the first line that is not a valid envelope
    #[arg(long)]
    strict: bool,

    /// Skip envelopes at or before the replay cursor (resume a previous run)
    #[arg(long)]
    skip_processed: bool,

    /// Checkpoint into the live Jetstream cursor instead of the replay cursor
    #[arg(long)]
    update_live_cursor: bool,

    /// Limit number of files to process
    #[arg(long)]
    limit: Option<usize>,

    /// Log a progress line every N events
    #[arg(long, default_value = "1000")]
    progress_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("rito_ingest=debug".parse()?),
        )
        .init();

    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let enrich = EnrichConfig::from(&args.enrich);
    enrich.validate().context("Invalid configuration")?;

    let db = Database::open(&args.store.database_path).with_context(|| {
        format!(
            "Failed to open database at {:?}",
            args.store.database_path
        )
    })?;
    let index = Arc::new(IndexStore::new(db.clone()));
    let cursors = CursorStore::new(db);

    let service = if args.update_live_cursor {
        JETSTREAM_SERVICE
    } else {
        REPLAY_SERVICE
    };
    let checkpoint = Checkpointer::load(
        cursors,
        Arc::clone(&index),
        CheckpointConfig {
            service,
            interval: Duration::from_secs(1),
            ..CheckpointConfig::default()
        },
    )
    .context("Failed to load cursor")?;

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        tracing::info!("Interrupt received, stopping after the current event...");
        running_clone.store(false, Ordering::SeqCst);
        let _ = shutdown_tx.send(true);
    })
    .context("Failed to set Ctrl+C handler")?;

    let enrichers = enrich
        .build_enrichers()
        .context("Failed to build enrichment collaborators")?;
    let mut driver = IngestDriver::new(
        Pipeline::new(Arc::clone(&index), enrichers),
        checkpoint,
        running,
    )
    .with_progress_interval(args.progress_interval);

    tracing::info!(
        "Replaying {} into {}",
        args.input.display(),
        args.store.database_path.display()
    );
    tracing::info!("  Cursor row: {}", service);

    let mut source = JsonlSource::new(JsonlConfig {
        input: args.input.clone(),
        continue_on_error: !args.strict,
        skip_processed: args.skip_processed,
        limit: args.limit,
    });

    let start = Instant::now();
    let result = source.run(&mut driver, shutdown_rx).await;

    // Flush whatever finished, even when the replay aborted.
    let final_cursor = driver.finish().context("Failed to flush cursor")?;
    let stats = result.context("Replay aborted")?;
    let driver_stats = driver.stats();
    let elapsed = start.elapsed();

    let counts = index.counts()?;

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("REPLAY COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!(
        "Files processed:      {}",
        stats.source_metadata.files_processed.unwrap_or(0)
    );
    tracing::info!(
        "Bytes read:           {}",
        stats.source_metadata.bytes_read.unwrap_or(0)
    );
    tracing::info!("Events read:          {}", stats.total_events);
    tracing::info!("Decode errors:        {}", stats.decode_errors);
    tracing::info!("Committed:            {}", driver_stats.committed);
    tracing::info!("Stale:                {}", driver_stats.stale);
    tracing::info!("Rejected:             {}", driver_stats.rejected);
    tracing::info!("Ignored:              {}", driver_stats.ignored);
    tracing::info!("Final cursor:         {:?}", final_cursor);
    tracing::info!(
        "Index:                {} bookmarks, {} likes, {} resolvers, {} verifications",
        counts.bookmarks,
        counts.likes,
        counts.resolvers,
        counts.verifications
    );
    tracing::info!("Time elapsed:         {:.2}s", elapsed.as_secs_f64());
    if elapsed.as_secs_f64() > 0.0 {
        tracing::info!(
            "Throughput:           {:.0} events/sec",
            stats.total_events as f64 / elapsed.as_secs_f64()
        );
    }

    Ok(())
}
