//! Best-effort enrichment collaborators.
//!
//! Every step may fail or time out. A failed step degrades to an empty value
//! and never blocks persistence.
//!
//! - [`PreviewFetcher`] - Open Graph metadata for a bookmark subject
//! - [`HandleResolver`] - DID to handle
//! - [`Blocklist`] - in-memory domain suffix match
//! - [`VerificationPolicy`] - decides whether a resolver becomes verified
//! - [`Moderator`] - optional verdict on comment text
//! - [`canonicalize_tags`] - tag cleanup

mod blocklist;
mod handle;
mod moderation;
mod ogp;
mod tags;
mod verification;

pub use blocklist::{BLOCKED_DOMAIN, Blocklist};
pub use handle::{DEFAULT_PLC_DIRECTORY, DidDocumentResolver, HandleResolver};
pub use moderation::{Moderator, NoModeration};
pub use ogp::{HttpPreviewFetcher, PreviewFetcher, parse_ogp};
pub use tags::{MAX_TAG_CHARS, MAX_TAGS, canonicalize_tags};
pub use verification::{NeverVerify, PolicyVerdict, SameAuthorPolicy, VerificationPolicy};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;

use crate::Result;

/// Per-step time limits.
#[derive(Debug, Clone, Copy)]
pub struct EnrichTimeouts {
    pub ogp: Duration,
    pub handle: Duration,
    pub moderation: Duration,
    pub verification: Duration,
}

impl Default for EnrichTimeouts {
    fn default() -> Self {
        Self {
            ogp: Duration::from_secs(5),
            handle: Duration::from_secs(3),
            moderation: Duration::from_secs(3),
            verification: Duration::from_secs(5),
        }
    }
}

/// The enrichment collaborators used by the pipeline.
#[derive(Clone)]
pub struct Enrichers {
    pub preview: Arc<dyn PreviewFetcher>,
    pub handles: Arc<dyn HandleResolver>,
    pub policy: Arc<dyn VerificationPolicy>,
    pub moderator: Arc<dyn Moderator>,
    pub blocklist: Arc<Blocklist>,
    pub timeouts: EnrichTimeouts,
}

impl Enrichers {
    /// Collaborators with no verification policy, no moderation and an
    /// empty blocklist.
    pub fn new(preview: Arc<dyn PreviewFetcher>, handles: Arc<dyn HandleResolver>) -> Self {
        Self {
            preview,
            handles,
            policy: Arc::new(NeverVerify),
            moderator: Arc::new(NoModeration),
            blocklist: Arc::new(Blocklist::default()),
            timeouts: EnrichTimeouts::default(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn VerificationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_moderator(mut self, moderator: Arc<dyn Moderator>) -> Self {
        self.moderator = moderator;
        self
    }

    pub fn with_blocklist(mut self, blocklist: Blocklist) -> Self {
        self.blocklist = Arc::new(blocklist);
        self
    }

    pub fn with_timeouts(mut self, timeouts: EnrichTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Run one enrichment step under `limit`, turning failure into `None`.
pub async fn soft_step<T, F>(step: &'static str, limit: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            counter!("enrich_failures_total", "step" => step).increment(1);
            tracing::debug!(step, error = %e, "enrichment step failed");
            None
        }
        Err(_) => {
            counter!("enrich_failures_total", "step" => step).increment(1);
            tracing::debug!(step, "enrichment step timed out after {:?}", limit);
            None
        }
    }
}
