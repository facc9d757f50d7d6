//! Event source adapters.
//!
//! # Available Sources
//!
//! - [`JetstreamSource`] - Live Jetstream websocket with reconnect and failover
//! - [`JsonlSource`] - Replays captured Jetstream envelopes, one per line
//!
//! All sources implement [`EventSource`] and push envelopes, in order, into an
//! [`EventHandler`].

mod backoff;
mod jetstream;
mod jsonl;

pub use backoff::{ConnectionManager, ReconnectConfig};
pub use jetstream::{JetstreamConfig, JetstreamSource, subscribe_url};
pub use jsonl::{JsonlConfig, JsonlSource};

use async_trait::async_trait;
use rito_core::JetstreamEvent;
use tokio::sync::watch;

use crate::Result;

/// Consumer of envelopes.
#[async_trait]
pub trait EventHandler: Send {
    /// Process one envelope to completion.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop gracefully, or
    /// `Err` when the event could not be processed. A live source reacts to
    /// `Err` by reconnecting from [`EventHandler::resume_cursor`] so the event
    /// is delivered again.
    async fn handle(&mut self, event: JetstreamEvent) -> Result<bool>;

    /// Position of the last finished event. Before any event has finished,
    /// a handler may return the position of an event it failed on so that
    /// reconnecting redelivers it.
    fn resume_cursor(&self) -> Option<i64>;
}

/// A source of Jetstream envelopes.
#[async_trait]
pub trait EventSource: Send {
    /// Human-readable name for this source (used in logs and metrics).
    fn name(&self) -> &'static str;

    /// Feed envelopes to `handler` until the source ends, the handler asks
    /// to stop, or `shutdown` flips to `true`.
    async fn run<H: EventHandler>(
        &mut self,
        handler: &mut H,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SourceStats>;
}

/// Statistics from running an event source.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    /// Envelopes decoded and handed to the handler.
    pub total_events: usize,

    /// Frames or lines that did not decode as an envelope.
    pub decode_errors: usize,

    /// Events the handler failed on.
    pub handler_errors: usize,

    pub source_metadata: SourceMetadata,
}

/// Source-specific metadata.
#[derive(Debug, Clone, Default)]
pub struct SourceMetadata {
    /// For file-based sources: number of files processed.
    pub files_processed: Option<usize>,

    /// For file-based sources: total bytes read.
    pub bytes_read: Option<usize>,

    /// For live sources: successful connections.
    pub connections: Option<usize>,

    /// For live sources: reconnect attempts.
    pub reconnects: Option<usize>,
}
