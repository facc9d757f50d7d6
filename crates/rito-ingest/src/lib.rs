//! Rito firehose indexer.
//!
//! Consumes the Jetstream firehose for the Rito collections and maintains a
//! SQLite index of bookmarks, likes, service-schema resolvers and
//! verification claims.
//!
//! # Modules
//!
//! - [`source`] - Event sources (live Jetstream, JSONL replay)
//! - [`router`] - Classifies envelopes by kind, collection and operation
//! - [`enrich`] - Best-effort collaborators (link previews, handles, blocklist, tags)
//! - [`pipeline`] - Per-event processing and the checkpointing driver
//! - [`store`] - SQLite index and durable cursor
//! - [`status`] - `/health` and `/status` routes
//! - [`config`] - Command-line and environment configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Event Sources  │  (Jetstream websocket, JSONL replay)
//! └────────┬────────┘
//!          │ in order, one at a time
//!          ▼
//! ┌─────────────────┐
//! │  IngestDriver   │  Pipeline + Checkpointer
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   IndexStore    │  SQLite, one transaction per event
//! └─────────────────┘
//! ```
//!
//! The cursor only moves past events whose writes are durable, so a restart
//! resumes at the first event not yet indexed. Redelivered events converge
//! through idempotent upserts and event-time guards.

pub mod config;
pub mod enrich;
pub mod error;
pub mod pipeline;
pub mod router;
pub mod source;
pub mod status;
pub mod store;

pub use error::{Error, ErrorClass, Result};

pub use config::{EnrichArgs, EnrichConfig, IngestConfig, JetstreamArgs, PolicyChoice, StoreArgs};

pub use pipeline::{
    CheckpointConfig, Checkpointer, DriverStats, EventOutcome, IngestDriver, Pipeline,
};

pub use source::{
    EventHandler, EventSource, JetstreamConfig, JetstreamSource, JsonlConfig, JsonlSource,
    SourceMetadata, SourceStats,
};

pub use store::{CursorStore, Database, IndexStore};
