//! Per-event processing and the driver that feeds it.
//!
//! ```text
//! ┌─────────────────┐
//! │  Event Source   │  Jetstream websocket or JSONL replay
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │     Router      │  drop untracked collections / unknown operations
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │    Validator    │  typed record or rejection
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │   Enrichers     │  handle, link preview, blocklist, tags, moderation
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │   IndexStore    │  one transaction per event
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │  Checkpointer   │  committed cursor, flushed on an interval
//! └─────────────────┘
//! ```
//!
//! Events are applied strictly in arrival order. The only error that leaves
//! [`Pipeline::handle_event`] is a persistence failure; everything else
//! resolves to an [`EventOutcome`] and counts as processed.

mod checkpoint;

pub use checkpoint::{CheckpointConfig, Checkpointer};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::join_all;
use metrics::{counter, histogram};
use rito_core::{
    BookmarkRecord, CommentEntry, INVALID_HANDLE, JetstreamEvent, LikeRecord, Record,
    ServiceSchemaRecord, VerificationRecord, is_valid_did, validate_record,
};

use crate::Result;
use crate::enrich::{BLOCKED_DOMAIN, Enrichers, PolicyVerdict, canonicalize_tags, soft_step};
use crate::router::{Collection, CommitRoute, IgnoreReason, Operation, Route, route};
use crate::source::EventHandler;
use crate::store::{
    BookmarkWrite, CommentWrite, IndexStore, LikeWrite, OgpData, ResolverWrite, VerificationWrite,
    WriteOutcome,
};

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Committed {
        collection: Collection,
        operation: Operation,
    },
    /// A newer write or delete already covered the record.
    Stale {
        collection: Collection,
        operation: Operation,
    },
    Rejected {
        collection: Collection,
        reason: &'static str,
    },
    Ignored(IgnoreReason),
    HandleUpdated,
    AccountObserved,
}

/// Routes, validates, enriches and persists single events.
pub struct Pipeline {
    index: Arc<IndexStore>,
    enrichers: Enrichers,
}

impl Pipeline {
    pub fn new(index: Arc<IndexStore>, enrichers: Enrichers) -> Self {
        Self { index, enrichers }
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    /// Process one envelope.
    ///
    /// # Errors
    ///
    /// Only persistence failures are returned. The caller must not advance
    /// the cursor past this event.
    pub async fn handle_event(&self, event: &JetstreamEvent) -> Result<EventOutcome> {
        let outcome = match route(event) {
            Route::Commit(commit) => self.handle_commit(event.time_us, commit).await?,
            Route::Identity { did, handle } => self.handle_identity(did, handle).await?,
            Route::Account {
                did,
                active,
                status,
            } => {
                counter!("pipeline_account_events_total", "active" => active.to_string())
                    .increment(1);
                tracing::info!(did = %did, active, status = ?status, "account status changed");
                EventOutcome::AccountObserved
            }
            Route::Ignore(reason) => EventOutcome::Ignored(reason),
        };

        record_outcome(&outcome);
        Ok(outcome)
    }

    async fn handle_commit(&self, time_us: i64, commit: CommitRoute<'_>) -> Result<EventOutcome> {
        let CommitRoute {
            uri,
            collection,
            operation,
            record,
        } = commit;
        let uri_str = uri.to_string();

        if operation == Operation::Delete {
            let outcome = match collection {
                Collection::Bookmark => self.index.delete_bookmark(&uri_str, time_us)?,
                Collection::Like => self.index.delete_like(&uri_str, time_us)?,
                Collection::ServiceSchema => self.index.delete_resolver(&uri_str, time_us)?,
                Collection::Verification => self.index.delete_verification(&uri_str, time_us)?,
            };
            tracing::debug!(uri = %uri_str, "deleted record");
            return Ok(write_outcome(outcome, collection, operation));
        }

        let Some(raw) = record else {
            return Ok(EventOutcome::Rejected {
                collection,
                reason: "missing_record",
            });
        };

        let record = match validate_record(collection.nsid(), raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(uri = %uri_str, error = %e, "rejected record");
                return Ok(EventOutcome::Rejected {
                    collection,
                    reason: e.reason(),
                });
            }
        };

        let outcome = match record {
            Record::Bookmark(rec) => {
                self.apply_bookmark(&uri_str, &uri.did, time_us, rec)
                    .await?
            }
            Record::Like(rec) => self.apply_like(&uri_str, &uri.did, time_us, rec)?,
            Record::ServiceSchema(rec) => self.apply_schema(&uri_str, &uri.did, time_us, rec)?,
            Record::Verification(rec) => {
                self.apply_verification(&uri_str, &uri.did, time_us, rec)
                    .await?
            }
        };

        tracing::debug!(
            uri = %uri_str,
            operation = operation.as_str(),
            stale = outcome == WriteOutcome::Stale,
            "indexed record"
        );
        Ok(write_outcome(outcome, collection, operation))
    }

    // =========================================================================
    // Bookmarks
    // =========================================================================

    async fn apply_bookmark(
        &self,
        uri: &str,
        did: &str,
        time_us: i64,
        rec: BookmarkRecord,
    ) -> Result<WriteOutcome> {
        let tags = canonicalize_tags(&rec.tags);
        let blocked = self.enrichers.blocklist.is_url_blocked(&rec.subject);
        if blocked {
            counter!("enrich_blocked_total").increment(1);
            tracing::info!(uri = %uri, subject = %rec.subject, "bookmark subject is on the blocklist");
        }

        // Same subject with a stored preview: keep it instead of refetching.
        let reusable = if blocked {
            None
        } else {
            self.index
                .stored_preview(uri)?
                .filter(|p| p.subject == rec.subject && !p.ogp.is_empty())
                .map(|p| p.ogp)
        };

        let (handle, ogp, comments) = tokio::join!(
            self.resolve_handle(did),
            self.preview(&rec.subject, reusable, blocked),
            self.moderate_comments(&rec.comments),
        );

        let remember_handle = handle.is_some();
        let handle = match handle {
            Some(h) => h,
            None => self
                .index
                .get_handle(did)?
                .unwrap_or_else(|| INVALID_HANDLE.to_string()),
        };

        let write = BookmarkWrite {
            uri: uri.to_string(),
            did: did.to_string(),
            handle,
            remember_handle,
            subject: rec.subject,
            ogp,
            moderation_result: blocked.then(|| BLOCKED_DOMAIN.to_string()),
            comments,
            tags,
            created_at: rec.created_at,
            time_us,
        };

        self.index.upsert_bookmark(&write)
    }

    async fn resolve_handle(&self, did: &str) -> Option<String> {
        soft_step(
            "handle",
            self.enrichers.timeouts.handle,
            self.enrichers.handles.resolve(did),
        )
        .await
        .flatten()
    }

    async fn preview(&self, subject: &str, reusable: Option<OgpData>, blocked: bool) -> OgpData {
        if blocked {
            return OgpData::default();
        }
        if let Some(ogp) = reusable {
            counter!("enrich_ogp_skipped_total").increment(1);
            return ogp;
        }
        soft_step(
            "ogp",
            self.enrichers.timeouts.ogp,
            self.enrichers.preview.fetch(subject),
        )
        .await
        .unwrap_or_default()
    }

    async fn moderate_comments(&self, comments: &[CommentEntry]) -> Vec<CommentWrite> {
        let verdicts = join_all(comments.iter().map(|c| {
            soft_step(
                "moderation",
                self.enrichers.timeouts.moderation,
                self.enrichers
                    .moderator
                    .moderate_comment(c.lang, &c.title, &c.comment),
            )
        }))
        .await;

        comments
            .iter()
            .zip(verdicts)
            .map(|(c, verdict)| CommentWrite {
                lang: c.lang,
                title: c.title.clone(),
                comment: c.comment.clone(),
                moderation_result: verdict.flatten(),
            })
            .collect()
    }

    // =========================================================================
    // Likes, resolvers, verifications
    // =========================================================================

    fn apply_like(
        &self,
        uri: &str,
        did: &str,
        time_us: i64,
        rec: LikeRecord,
    ) -> Result<WriteOutcome> {
        self.index.upsert_like(&LikeWrite {
            uri: uri.to_string(),
            did: did.to_string(),
            subject: rec.subject,
            created_at: rec.created_at,
            time_us,
        })
    }

    fn apply_schema(
        &self,
        uri: &str,
        did: &str,
        time_us: i64,
        rec: ServiceSchemaRecord,
    ) -> Result<WriteOutcome> {
        self.index.upsert_resolver(&ResolverWrite {
            uri: uri.to_string(),
            did: did.to_string(),
            nsid: rec.nsid,
            schema_template: rec.schema_template,
            created_at: rec.created_at,
            time_us,
        })
    }

    async fn apply_verification(
        &self,
        uri: &str,
        did: &str,
        time_us: i64,
        rec: VerificationRecord,
    ) -> Result<WriteOutcome> {
        let write = VerificationWrite {
            uri: uri.to_string(),
            did: did.to_string(),
            subject: rec.subject,
            nsid: rec.nsid,
            created_at: rec.created_at,
            time_us,
        };

        let outcome = self.index.upsert_verification(&write)?;
        if outcome == WriteOutcome::Stale {
            return Ok(outcome);
        }

        let Some(nsid) = write.nsid.as_deref() else {
            return Ok(outcome);
        };
        let Some(resolver) = self.index.get_resolver(nsid)? else {
            tracing::debug!(nsid, "verification references an unregistered resolver");
            return Ok(outcome);
        };
        if resolver.verified {
            return Ok(outcome);
        }

        let verdict = soft_step(
            "verification",
            self.enrichers.timeouts.verification,
            self.enrichers.policy.evaluate(&resolver, &write),
        )
        .await;

        match verdict {
            Some(PolicyVerdict::Confirmed) => {
                if self
                    .index
                    .set_resolver_verified(nsid, &resolver.schema_template)?
                {
                    tracing::info!(nsid, uri = %uri, "resolver verified");
                }
            }
            Some(PolicyVerdict::Rejected) => {
                tracing::info!(nsid, uri = %uri, "verification claim rejected by policy");
            }
            Some(PolicyVerdict::Pending) | None => {}
        }

        Ok(outcome)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    async fn handle_identity(&self, did: &str, handle: Option<&str>) -> Result<EventOutcome> {
        let Some(handle) = handle.filter(|h| !h.is_empty()) else {
            return Ok(EventOutcome::Ignored(IgnoreReason::MissingPayload));
        };
        if !is_valid_did(did) {
            return Ok(EventOutcome::Ignored(IgnoreReason::InvalidUri));
        }

        let handle = handle.to_ascii_lowercase();
        self.index.upsert_handle(did, &handle)?;
        self.enrichers.handles.remember(did, &handle).await;

        counter!("pipeline_identity_events_total").increment(1);
        tracing::debug!(did = %did, handle = %handle, "updated handle");
        Ok(EventOutcome::HandleUpdated)
    }
}

fn write_outcome(outcome: WriteOutcome, collection: Collection, operation: Operation) -> EventOutcome {
    match outcome {
        WriteOutcome::Applied => EventOutcome::Committed {
            collection,
            operation,
        },
        WriteOutcome::Stale => EventOutcome::Stale {
            collection,
            operation,
        },
    }
}

fn record_outcome(outcome: &EventOutcome) {
    match outcome {
        EventOutcome::Committed {
            collection,
            operation,
        } => {
            counter!(
                "pipeline_events_committed_total",
                "collection" => collection.nsid(),
                "operation" => operation.as_str()
            )
            .increment(1);
        }
        EventOutcome::Stale { .. } => {
            counter!("pipeline_events_stale_total").increment(1);
        }
        EventOutcome::Rejected { collection, reason } => {
            counter!(
                "pipeline_events_rejected_total",
                "collection" => collection.nsid(),
                "reason" => *reason
            )
            .increment(1);
        }
        EventOutcome::Ignored(reason) => {
            counter!("pipeline_events_ignored_total", "reason" => reason.as_str()).increment(1);
        }
        EventOutcome::HandleUpdated | EventOutcome::AccountObserved => {}
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Running totals kept by the driver.
#[derive(Debug, Clone, Default)]
pub struct DriverStats {
    pub processed: u64,
    pub committed: u64,
    pub stale: u64,
    pub rejected: u64,
    pub ignored: u64,
    pub persistence_errors: u64,
}

/// Connects a source to the [`Pipeline`] and owns the committed cursor.
pub struct IngestDriver {
    pipeline: Pipeline,
    checkpoint: Checkpointer,
    running: Arc<AtomicBool>,
    progress_interval: u64,
    stats: DriverStats,
    /// First failed event while nothing has committed yet. Resuming from it
    /// redelivers the event instead of starting at the live tail.
    retry_from: Option<i64>,
}

impl IngestDriver {
    pub fn new(pipeline: Pipeline, checkpoint: Checkpointer, running: Arc<AtomicBool>) -> Self {
        Self {
            pipeline,
            checkpoint,
            running,
            progress_interval: 10_000,
            stats: DriverStats::default(),
            retry_from: None,
        }
    }

    pub fn with_progress_interval(mut self, every: u64) -> Self {
        self.progress_interval = every.max(1);
        self
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Flush the committed cursor. Called on shutdown and before exiting
    /// with an error.
    pub fn finish(&mut self) -> Result<Option<i64>> {
        self.checkpoint.flush()?;
        Ok(self.checkpoint.committed())
    }
}

#[async_trait]
impl EventHandler for IngestDriver {
    async fn handle(&mut self, event: JetstreamEvent) -> Result<bool> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let started = Instant::now();
        let outcome = match self.pipeline.handle_event(&event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.persistence_errors += 1;
                counter!("store_errors_total").increment(1);
                if self.checkpoint.committed().is_none() && self.retry_from.is_none() {
                    self.retry_from = Some(event.time_us);
                }
                tracing::error!(
                    time_us = event.time_us,
                    class = e.class().as_str(),
                    "failed to persist event, cursor held at {:?}: {}",
                    self.checkpoint.committed(),
                    e
                );
                return Err(e);
            }
        };
        histogram!("pipeline_event_duration_seconds").record(started.elapsed().as_secs_f64());

        self.stats.processed += 1;
        match outcome {
            EventOutcome::Committed { .. } | EventOutcome::HandleUpdated => {
                self.stats.committed += 1
            }
            EventOutcome::Stale { .. } => self.stats.stale += 1,
            EventOutcome::Rejected { .. } => self.stats.rejected += 1,
            EventOutcome::Ignored(_) | EventOutcome::AccountObserved => self.stats.ignored += 1,
        }

        self.checkpoint.advance(event.time_us);
        self.checkpoint.maybe_flush()?;

        if self.stats.processed.is_multiple_of(self.progress_interval) {
            tracing::info!(
                "Progress: {} processed ({} committed, {} stale, {} rejected, {} ignored), cursor {:?}",
                self.stats.processed,
                self.stats.committed,
                self.stats.stale,
                self.stats.rejected,
                self.stats.ignored,
                self.checkpoint.committed()
            );
        }

        Ok(true)
    }

    fn resume_cursor(&self) -> Option<i64> {
        self.checkpoint.committed().or(self.retry_from)
    }
}
