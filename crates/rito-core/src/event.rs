//! Jetstream event envelopes.
//!
//! Jetstream delivers one JSON object per websocket message:
//!
//! ```json
//! {
//!   "did": "did:plc:...",
//!   "time_us": 1725911162329308,
//!   "kind": "commit",
//!   "commit": {
//!     "rev": "3l3qo2vutsw2b",
//!     "operation": "create",
//!     "collection": "blue.rito.feed.bookmark",
//!     "rkey": "3l3qo2vuowo2b",
//!     "record": { ... },
//!     "cid": "bafyrei..."
//!   }
//! }
//! ```
//!
//! The record body is kept as a raw JSON slice so that events for collections
//! we don't index can be dropped without building a value tree for them.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Result;

/// Top-level event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    #[serde(other)]
    Unknown,
}

/// A single Jetstream envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JetstreamEvent {
    /// Repository DID the event belongs to.
    pub did: String,

    /// Jetstream position in microseconds since the Unix epoch.
    ///
    /// This is the value the cursor tracks.
    pub time_us: i64,

    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<Commit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,
}

/// Repository commit operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Raw operation name (`create`, `update`, `delete`). Kept as a string so
    /// that an operation we don't know about is a routing no-op rather than a
    /// parse failure of the whole envelope.
    pub operation: String,

    pub collection: String,

    pub rkey: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Box<RawValue>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

/// Handle change or identity refresh for a DID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub did: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,

    #[serde(default)]
    pub seq: i64,

    #[serde(default)]
    pub time: String,
}

/// Account status change (takedown, deactivation, reactivation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub active: bool,

    pub did: String,

    #[serde(default)]
    pub seq: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default)]
    pub time: String,
}

impl JetstreamEvent {
    /// Parse one websocket text frame or JSONL line.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Collection NSID for commit events.
    pub fn collection(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| c.collection.as_str())
    }
}
