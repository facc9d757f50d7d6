//! Inspect and adjust the stored Jetstream cursor.
//!
//! Stop the daemon before changing the cursor; it only reads the stored
//! value at startup and will overwrite a manual change on its next
//! checkpoint otherwise.
//!
//! # Usage
//!
//! ```bash
//! # Current cursors, lag and row counts
//! rito-cursor show
//!
//! # Re-index the last two hours on next start
//! rito-cursor rewind 120
//!
//! # Jump to an exact position (microseconds since the epoch)
//! rito-cursor reset 1725911162329308
//!
//! # Forget the cursor; the daemon starts from the live tail
//! rito-cursor clear
//! ```

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rito_core::{JETSTREAM_SERVICE, derive_status};
use rito_ingest::config::StoreArgs;
use rito_ingest::{CursorStore, Database, IndexStore};
use tracing_subscriber::EnvFilter;

/// Rito cursor maintenance.
#[derive(Parser, Debug)]
#[command(name = "rito-cursor")]
#[command(about = "Inspect and adjust the stored Jetstream cursor")]
#[command(version)]
struct Args {
    #[command(flatten)]
    store: StoreArgs,

    /// Cursor row to operate on
    #[arg(long, default_value = JETSTREAM_SERVICE)]
    service: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stored cursors, ingestion lag and index row counts
    Show,
    /// Set the cursor to an exact position, even backwards
    Reset {
        /// Microseconds since the Unix epoch
        micros: i64,
    },
    /// Move the cursor back by a number of minutes
    Rewind {
        minutes: i64,
    },
    /// Delete the cursor
    Clear,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let db = Database::open(&args.store.database_path).with_context(|| {
        format!(
            "Failed to open database at {:?}",
            args.store.database_path
        )
    })?;
    let cursors = CursorStore::new(db.clone());

    match args.command {
        Command::Show => show(&cursors, &IndexStore::new(db))?,
        Command::Reset { micros } => {
            if micros <= 0 {
                bail!("cursor must be a positive microsecond timestamp");
            }
            let previous = cursors.get(&args.service)?;
            cursors.reset(&args.service, micros)?;
            tracing::info!(
                "{}: {} -> {}",
                args.service,
                describe(previous),
                describe(Some(micros))
            );
        }
        Command::Rewind { minutes } => {
            if minutes <= 0 {
                bail!("rewind needs a positive number of minutes");
            }
            let Some(current) = cursors.get(&args.service)? else {
                bail!("no cursor stored for '{}'", args.service);
            };
            let target = current - minutes * 60_000_000;
            cursors.reset(&args.service, target)?;
            tracing::info!(
                "{}: {} -> {}",
                args.service,
                describe(Some(current)),
                describe(Some(target))
            );
        }
        Command::Clear => {
            if cursors.clear(&args.service)? {
                tracing::info!("{}: cursor cleared", args.service);
            } else {
                tracing::info!("{}: no cursor stored", args.service);
            }
        }
    }

    Ok(())
}

fn show(cursors: &CursorStore, index: &IndexStore) -> Result<()> {
    let rows = cursors.list()?;
    if rows.is_empty() {
        tracing::info!("No cursors stored");
    }
    for (service, cursor, updated_at) in rows {
        let status = derive_status(Utc::now(), Some(cursor));
        let updated = DateTime::from_timestamp(updated_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| updated_at.to_string());
        tracing::info!(
            "{}: {} (updated {}) - {} diff={:?}min",
            service,
            describe(Some(cursor)),
            updated,
            status.comment,
            status.diff_minutes
        );
    }

    let counts = index.counts()?;
    tracing::info!("Bookmarks:      {}", counts.bookmarks);
    tracing::info!("Comments:       {}", counts.comments);
    tracing::info!("Tags:           {}", counts.tags);
    tracing::info!("Likes:          {}", counts.likes);
    tracing::info!("Resolvers:      {}", counts.resolvers);
    tracing::info!("Verifications:  {}", counts.verifications);
    tracing::info!("Handles:        {}", counts.handles);
    tracing::info!("Tombstones:     {}", counts.tombstones);
    Ok(())
}

fn describe(cursor: Option<i64>) -> String {
    match cursor {
        Some(micros) => match DateTime::from_timestamp_micros(micros) {
            Some(t) => format!("{micros} ({})", t.to_rfc3339()),
            None => micros.to_string(),
        },
        None => "none".to_string(),
    }
}
