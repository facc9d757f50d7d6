//! Core types, validation, and shared utilities for the Rito indexer.
//!
//! This crate provides:
//! - AT-URI parsing and identifier checks
//! - Jetstream envelope types
//! - Per-collection record validation
//! - Cursor status derivation
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;
mod record;
mod status;
mod uri;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

pub const BOOKMARK_COLLECTION: &str = "blue.rito.feed.bookmark";
pub const LIKE_COLLECTION: &str = "blue.rito.feed.like";
pub const SCHEMA_COLLECTION: &str = "blue.rito.service.schema";
pub const VERIFICATION_COLLECTION: &str = "blue.rito.service.verification";

/// Collections requested via `wantedCollections`. Everything else is dropped.
pub const TRACKED_COLLECTIONS: [&str; 4] = [
    BOOKMARK_COLLECTION,
    LIKE_COLLECTION,
    SCHEMA_COLLECTION,
    VERIFICATION_COLLECTION,
];

/// Service key of the persisted Jetstream cursor.
pub const JETSTREAM_SERVICE: &str = "jetstream";

/// Tag reserved for bookmarks with verified provenance.
pub const VERIFIED_TAG: &str = "Verified";

/// Placeholder handle when a DID cannot be resolved.
pub const INVALID_HANDLE: &str = "handle.invalid";

pub use error::{Error, Result};
pub use event::{Account, Commit, EventKind, Identity, JetstreamEvent};
pub use record::{
    BookmarkRecord, CommentEntry, Lang, LikeRecord, Record, ServiceSchemaRecord,
    VerificationRecord, parse_web_url, validate_record,
};
pub use status::{CursorStatus, DELAY_THRESHOLD_MINUTES, derive_status};
pub use uri::{AtUri, is_valid_did, is_valid_nsid, is_valid_rkey};
