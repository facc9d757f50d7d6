//! Transactional writes against the bookmark index.
//!
//! All writes for one event run in a single transaction, parent row first.
//! The record URI is the idempotency key: re-applying the same event leaves
//! the row unchanged, and writes older than the stored row or a delete
//! tombstone are reported as [`WriteOutcome::Stale`] without touching it.

use chrono::{DateTime, SecondsFormat, Utc};
use moka::sync::Cache;
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};

use rito_core::{Lang, VERIFIED_TAG};

use super::schema::tag_key;
use super::{Database, unix_now};
use crate::Result;

/// Upper bound on cached tag ids.
const TAG_CACHE_CAPACITY: u64 = 10_000;

/// Result of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// A newer row or delete already covers this URI.
    Stale,
}

/// Link preview metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OgpData {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
}

impl OgpData {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.image.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentWrite {
    pub lang: Lang,
    pub title: String,
    pub comment: String,
    pub moderation_result: Option<String>,
}

/// Fully enriched bookmark ready to be written.
#[derive(Debug, Clone)]
pub struct BookmarkWrite {
    pub uri: String,
    pub did: String,
    pub handle: String,
    /// Store `handle` as the DID's current handle in the same transaction.
    pub remember_handle: bool,
    pub subject: String,
    pub ogp: OgpData,
    pub moderation_result: Option<String>,
    pub comments: Vec<CommentWrite>,
    /// Canonical tag names.
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub time_us: i64,
}

#[derive(Debug, Clone)]
pub struct LikeWrite {
    pub uri: String,
    pub did: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub time_us: i64,
}

#[derive(Debug, Clone)]
pub struct ResolverWrite {
    pub uri: String,
    pub did: String,
    pub nsid: String,
    pub schema_template: String,
    pub created_at: DateTime<Utc>,
    pub time_us: i64,
}

#[derive(Debug, Clone)]
pub struct VerificationWrite {
    pub uri: String,
    pub did: String,
    pub subject: String,
    pub nsid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub time_us: i64,
}

/// Subject and preview already stored for a bookmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPreview {
    pub subject: String,
    pub ogp: OgpData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentRow {
    pub lang: String,
    pub title: String,
    pub comment: String,
    pub moderation_result: Option<String>,
}

/// A bookmark with its comments and tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkAggregate {
    pub uri: String,
    pub did: String,
    pub handle: String,
    pub subject: String,
    pub ogp: OgpData,
    pub moderation_result: Option<String>,
    pub created_at: String,
    pub indexed_at: String,
    pub comments: Vec<CommentRow>,
    /// `Verified` first, then the rest by name.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeRow {
    pub uri: String,
    pub did: String,
    pub subject: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverRow {
    pub nsid: String,
    pub schema_template: String,
    pub verified: bool,
    pub did: String,
    pub uri: String,
}

/// Row counts, for operator tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexCounts {
    pub bookmarks: i64,
    pub comments: i64,
    pub tags: i64,
    pub likes: i64,
    pub resolvers: i64,
    pub verifications: i64,
    pub handles: i64,
    pub tombstones: i64,
}

/// Persistence coordinator for indexed records.
pub struct IndexStore {
    db: Database,
    /// [`tag_key`] -> id, the same fold as the `tags.name_key` column. Only
    /// filled after the owning transaction commits, so it never holds an id
    /// that was rolled back.
    tag_cache: Cache<String, i64>,
}

impl IndexStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            tag_cache: Cache::new(TAG_CACHE_CAPACITY),
        }
    }

    // =========================================================================
    // Bookmarks
    // =========================================================================

    /// Insert or replace a bookmark with its comments and tags.
    ///
    /// `indexed_at` is set on first insert and kept on every later write.
    /// A remembered handle is stored even when the bookmark itself is stale.
    pub fn upsert_bookmark(&self, write: &BookmarkWrite) -> Result<WriteOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if write.remember_handle {
            write_handle(&tx, &write.did, &write.handle)?;
        }

        if is_stale(
            &tx,
            "SELECT event_time_us FROM bookmarks WHERE uri = ?1",
            &write.uri,
            &write.uri,
            write.time_us,
        )? {
            tx.commit()?;
            return Ok(WriteOutcome::Stale);
        }

        let now = format_ts(&Utc::now());
        tx.execute(
            "INSERT INTO bookmarks (
                uri, did, handle, subject, ogp_title, ogp_description, ogp_image,
                moderation_result, created_at, indexed_at, event_time_us
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(uri) DO UPDATE SET
                did = excluded.did,
                handle = excluded.handle,
                subject = excluded.subject,
                ogp_title = excluded.ogp_title,
                ogp_description = excluded.ogp_description,
                ogp_image = excluded.ogp_image,
                moderation_result = excluded.moderation_result,
                created_at = excluded.created_at,
                event_time_us = excluded.event_time_us",
            params![
                write.uri,
                write.did,
                write.handle,
                write.subject,
                write.ogp.title,
                write.ogp.description,
                write.ogp.image,
                write.moderation_result,
                format_ts(&write.created_at),
                now,
                write.time_us,
            ],
        )?;

        tx.execute(
            "DELETE FROM comments WHERE bookmark_uri = ?1",
            [&write.uri],
        )?;
        for c in &write.comments {
            tx.execute(
                "INSERT INTO comments (bookmark_uri, lang, title, comment, moderation_result)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(bookmark_uri, lang) DO UPDATE SET
                    title = excluded.title,
                    comment = excluded.comment,
                    moderation_result = excluded.moderation_result",
                params![
                    write.uri,
                    c.lang.as_str(),
                    c.title,
                    c.comment,
                    c.moderation_result
                ],
            )?;
        }

        tx.execute(
            "DELETE FROM bookmark_tags WHERE bookmark_uri = ?1",
            [&write.uri],
        )?;
        let mut fresh_tags = Vec::new();
        for name in &write.tags {
            if name.eq_ignore_ascii_case(VERIFIED_TAG) {
                continue;
            }
            let tag_id = self.tag_id(&tx, name, &mut fresh_tags)?;
            tx.execute(
                "INSERT OR IGNORE INTO bookmark_tags (bookmark_uri, tag_id) VALUES (?1, ?2)",
                params![write.uri, tag_id],
            )?;
        }

        tx.execute(
            "INSERT OR IGNORE INTO bookmark_tags (bookmark_uri, tag_id)
             SELECT ?1, t.id FROM tags t
             WHERE t.name_key = ?2
               AND EXISTS (SELECT 1 FROM verifications v WHERE v.subject = ?3)",
            params![write.uri, tag_key(VERIFIED_TAG), write.subject],
        )?;

        tx.commit()?;

        for (key, id) in fresh_tags {
            self.tag_cache.insert(key, id);
        }

        Ok(WriteOutcome::Applied)
    }

    /// Delete a bookmark with its comments and tag associations.
    ///
    /// Deleting an absent URI still records the tombstone and succeeds.
    pub fn delete_bookmark(&self, uri: &str, time_us: i64) -> Result<WriteOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        record_tombstone(&tx, uri, time_us)?;

        if row_is_newer(
            &tx,
            "SELECT event_time_us FROM bookmarks WHERE uri = ?1",
            uri,
            time_us,
        )? {
            tx.commit()?;
            return Ok(WriteOutcome::Stale);
        }

        tx.execute("DELETE FROM comments WHERE bookmark_uri = ?1", [uri])?;
        tx.execute("DELETE FROM bookmark_tags WHERE bookmark_uri = ?1", [uri])?;
        tx.execute("DELETE FROM bookmarks WHERE uri = ?1", [uri])?;

        tx.commit()?;
        Ok(WriteOutcome::Applied)
    }

    /// Subject and preview currently stored for `uri`, if any.
    pub fn stored_preview(&self, uri: &str) -> Result<Option<StoredPreview>> {
        let conn = self.db.lock();
        let preview = conn
            .query_row(
                "SELECT subject, ogp_title, ogp_description, ogp_image FROM bookmarks WHERE uri = ?1",
                [uri],
                |row| {
                    Ok(StoredPreview {
                        subject: row.get(0)?,
                        ogp: OgpData {
                            title: row.get(1)?,
                            description: row.get(2)?,
                            image: row.get(3)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(preview)
    }

    /// Load a bookmark with its comments and tags in one join.
    pub fn load_bookmark(&self, uri: &str) -> Result<Option<BookmarkAggregate>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT b.uri, b.did, b.handle, b.subject,
                    b.ogp_title, b.ogp_description, b.ogp_image,
                    b.moderation_result, b.created_at, b.indexed_at,
                    c.lang, c.title, c.comment, c.moderation_result,
                    t.name
             FROM bookmarks b
             LEFT JOIN comments c ON c.bookmark_uri = b.uri
             LEFT JOIN bookmark_tags bt ON bt.bookmark_uri = b.uri
             LEFT JOIN tags t ON t.id = bt.tag_id
             WHERE b.uri = ?1
             ORDER BY c.lang",
        )?;

        let mut rows = stmt.query([uri])?;
        let mut aggregate: Option<BookmarkAggregate> = None;

        while let Some(row) = rows.next()? {
            if aggregate.is_none() {
                aggregate = Some(BookmarkAggregate {
                    uri: row.get(0)?,
                    did: row.get(1)?,
                    handle: row.get(2)?,
                    subject: row.get(3)?,
                    ogp: OgpData {
                        title: row.get(4)?,
                        description: row.get(5)?,
                        image: row.get(6)?,
                    },
                    moderation_result: row.get(7)?,
                    created_at: row.get(8)?,
                    indexed_at: row.get(9)?,
                    comments: Vec::new(),
                    tags: Vec::new(),
                });
            }
            let Some(agg) = aggregate.as_mut() else {
                continue;
            };

            if let Some(lang) = row.get::<_, Option<String>>(10)?
                && !agg.comments.iter().any(|c| c.lang == lang)
            {
                agg.comments.push(CommentRow {
                    lang,
                    title: row.get(11)?,
                    comment: row.get(12)?,
                    moderation_result: row.get(13)?,
                });
            }

            if let Some(tag) = row.get::<_, Option<String>>(14)?
                && !agg.tags.contains(&tag)
            {
                agg.tags.push(tag);
            }
        }

        if let Some(agg) = aggregate.as_mut() {
            sort_tags(&mut agg.tags);
        }

        Ok(aggregate)
    }

    // =========================================================================
    // Likes
    // =========================================================================

    pub fn upsert_like(&self, write: &LikeWrite) -> Result<WriteOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if is_stale(
            &tx,
            "SELECT event_time_us FROM likes WHERE uri = ?1",
            &write.uri,
            &write.uri,
            write.time_us,
        )? {
            return Ok(WriteOutcome::Stale);
        }

        tx.execute(
            "INSERT INTO likes (uri, did, subject, created_at, event_time_us)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uri) DO UPDATE SET
                did = excluded.did,
                subject = excluded.subject,
                created_at = excluded.created_at,
                event_time_us = excluded.event_time_us",
            params![
                write.uri,
                write.did,
                write.subject,
                format_ts(&write.created_at),
                write.time_us
            ],
        )?;

        tx.commit()?;
        Ok(WriteOutcome::Applied)
    }

    pub fn delete_like(&self, uri: &str, time_us: i64) -> Result<WriteOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        record_tombstone(&tx, uri, time_us)?;
        let removed = tx.execute(
            "DELETE FROM likes WHERE uri = ?1 AND event_time_us <= ?2",
            params![uri, time_us],
        )?;
        let newer = removed == 0
            && row_is_newer(&tx, "SELECT event_time_us FROM likes WHERE uri = ?1", uri, time_us)?;

        tx.commit()?;
        Ok(if newer {
            WriteOutcome::Stale
        } else {
            WriteOutcome::Applied
        })
    }

    pub fn get_like(&self, uri: &str) -> Result<Option<LikeRow>> {
        let conn = self.db.lock();
        let like = conn
            .query_row(
                "SELECT uri, did, subject, created_at FROM likes WHERE uri = ?1",
                [uri],
                |row| {
                    Ok(LikeRow {
                        uri: row.get(0)?,
                        did: row.get(1)?,
                        subject: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(like)
    }

    // =========================================================================
    // Resolvers
    // =========================================================================

    /// Register or update a resolver template.
    ///
    /// Never sets `verified`. An existing flag survives only when both the
    /// template and the registering DID are unchanged.
    pub fn upsert_resolver(&self, write: &ResolverWrite) -> Result<WriteOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if is_stale(
            &tx,
            "SELECT event_time_us FROM resolvers WHERE nsid = ?1",
            &write.nsid,
            &write.uri,
            write.time_us,
        )? {
            return Ok(WriteOutcome::Stale);
        }

        // The same record may have been re-pointed at another NSID.
        tx.execute(
            "DELETE FROM resolvers WHERE uri = ?1 AND nsid != ?2",
            params![write.uri, write.nsid],
        )?;

        tx.execute(
            "INSERT INTO resolvers (nsid, schema_template, verified, did, uri, created_at, event_time_us)
             VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6)
             ON CONFLICT(nsid) DO UPDATE SET
                verified = CASE
                    WHEN resolvers.schema_template = excluded.schema_template
                     AND resolvers.did = excluded.did
                    THEN resolvers.verified
                    ELSE 0
                END,
                schema_template = excluded.schema_template,
                did = excluded.did,
                uri = excluded.uri,
                created_at = excluded.created_at,
                event_time_us = excluded.event_time_us",
            params![
                write.nsid,
                write.schema_template,
                write.did,
                write.uri,
                format_ts(&write.created_at),
                write.time_us
            ],
        )?;

        tx.commit()?;
        Ok(WriteOutcome::Applied)
    }

    pub fn delete_resolver(&self, uri: &str, time_us: i64) -> Result<WriteOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        record_tombstone(&tx, uri, time_us)?;
        let removed = tx.execute(
            "DELETE FROM resolvers WHERE uri = ?1 AND event_time_us <= ?2",
            params![uri, time_us],
        )?;
        let newer = removed == 0
            && row_is_newer(
                &tx,
                "SELECT event_time_us FROM resolvers WHERE uri = ?1",
                uri,
                time_us,
            )?;

        tx.commit()?;
        Ok(if newer {
            WriteOutcome::Stale
        } else {
            WriteOutcome::Applied
        })
    }

    pub fn get_resolver(&self, nsid: &str) -> Result<Option<ResolverRow>> {
        let conn = self.db.lock();
        let resolver = conn
            .query_row(
                "SELECT nsid, schema_template, verified, did, uri FROM resolvers WHERE nsid = ?1",
                [nsid],
                |row| {
                    Ok(ResolverRow {
                        nsid: row.get(0)?,
                        schema_template: row.get(1)?,
                        verified: row.get::<_, i64>(2)? != 0,
                        did: row.get(3)?,
                        uri: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(resolver)
    }

    /// Mark a resolver verified, provided its template is still the one the
    /// policy confirmed. Returns whether a row changed.
    pub fn set_resolver_verified(&self, nsid: &str, schema_template: &str) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE resolvers SET verified = 1
             WHERE nsid = ?1 AND schema_template = ?2 AND verified = 0",
            params![nsid, schema_template],
        )?;
        Ok(changed > 0)
    }

    // =========================================================================
    // Verifications
    // =========================================================================

    /// Store a verification claim and tag every bookmark of its subject.
    pub fn upsert_verification(&self, write: &VerificationWrite) -> Result<WriteOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if is_stale(
            &tx,
            "SELECT event_time_us FROM verifications WHERE uri = ?1",
            &write.uri,
            &write.uri,
            write.time_us,
        )? {
            return Ok(WriteOutcome::Stale);
        }

        let previous_subject: Option<String> = tx
            .query_row(
                "SELECT subject FROM verifications WHERE uri = ?1",
                [&write.uri],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO verifications (uri, did, subject, nsid, created_at, event_time_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(uri) DO UPDATE SET
                did = excluded.did,
                subject = excluded.subject,
                nsid = excluded.nsid,
                created_at = excluded.created_at,
                event_time_us = excluded.event_time_us",
            params![
                write.uri,
                write.did,
                write.subject,
                write.nsid,
                format_ts(&write.created_at),
                write.time_us
            ],
        )?;

        if let Some(previous) = previous_subject
            && previous != write.subject
        {
            sync_verified_tag(&tx, &previous)?;
        }
        sync_verified_tag(&tx, &write.subject)?;

        tx.commit()?;
        Ok(WriteOutcome::Applied)
    }

    pub fn delete_verification(&self, uri: &str, time_us: i64) -> Result<WriteOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        record_tombstone(&tx, uri, time_us)?;

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT subject, event_time_us FROM verifications WHERE uri = ?1",
                [uri],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((_, row_time)) if row_time > time_us => WriteOutcome::Stale,
            Some((subject, _)) => {
                tx.execute("DELETE FROM verifications WHERE uri = ?1", [uri])?;
                sync_verified_tag(&tx, &subject)?;
                WriteOutcome::Applied
            }
            None => WriteOutcome::Applied,
        };

        tx.commit()?;
        Ok(outcome)
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Remember a DID's handle and refresh it on the DID's bookmarks.
    pub fn upsert_handle(&self, did: &str, handle: &str) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        write_handle(&tx, did, handle)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_handle(&self, did: &str) -> Result<Option<String>> {
        let conn = self.db.lock();
        let handle = conn
            .query_row(
                "SELECT handle FROM user_did_handles WHERE did = ?1",
                [did],
                |row| row.get(0),
            )
            .optional()?;
        Ok(handle)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Remove tombstones older than `before_us`. Returns how many were removed.
    pub fn prune_tombstones(&self, before_us: i64) -> Result<usize> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM tombstones WHERE time_us < ?1", [before_us])?;
        Ok(removed)
    }

    /// Number of bookmarks associated with `tag`, compared by [`tag_key`].
    pub fn tag_usage(&self, tag: &str) -> Result<i64> {
        let conn = self.db.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM bookmark_tags bt JOIN tags t ON t.id = bt.tag_id WHERE t.name_key = ?1",
            [tag_key(tag)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn counts(&self) -> Result<IndexCounts> {
        let conn = self.db.lock();
        let count = |table: &str| -> rusqlite::Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        Ok(IndexCounts {
            bookmarks: count("bookmarks")?,
            comments: count("comments")?,
            tags: count("tags")?,
            likes: count("likes")?,
            resolvers: count("resolvers")?,
            verifications: count("verifications")?,
            handles: count("user_did_handles")?,
            tombstones: count("tombstones")?,
        })
    }

    /// Find or create the tag row for `name` inside `tx`.
    fn tag_id(
        &self,
        tx: &Transaction<'_>,
        name: &str,
        fresh: &mut Vec<(String, i64)>,
    ) -> Result<i64> {
        let key = tag_key(name);
        if let Some(id) = self.tag_cache.get(&key) {
            return Ok(id);
        }

        tx.execute(
            "INSERT INTO tags (name, name_key) VALUES (?1, ?2) ON CONFLICT(name_key) DO NOTHING",
            params![name, key],
        )?;
        let id: i64 = tx.query_row("SELECT id FROM tags WHERE name_key = ?1", [&key], |row| {
            row.get(0)
        })?;

        fresh.push((key, id));
        Ok(id)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whether a write at `time_us` is covered by a tombstone for `uri` or by a
/// newer row found with `row_sql` and `key`.
fn is_stale(
    tx: &Transaction<'_>,
    row_sql: &str,
    key: &str,
    uri: &str,
    time_us: i64,
) -> rusqlite::Result<bool> {
    let tombstone: Option<i64> = tx
        .query_row(
            "SELECT time_us FROM tombstones WHERE uri = ?1",
            [uri],
            |row| row.get(0),
        )
        .optional()?;
    if tombstone.is_some_and(|t| t >= time_us) {
        return Ok(true);
    }
    row_is_newer(tx, row_sql, key, time_us)
}

fn row_is_newer(
    tx: &Transaction<'_>,
    row_sql: &str,
    key: &str,
    time_us: i64,
) -> rusqlite::Result<bool> {
    let row_time: Option<i64> = tx.query_row(row_sql, [key], |row| row.get(0)).optional()?;
    Ok(row_time.is_some_and(|t| t > time_us))
}

fn record_tombstone(tx: &Transaction<'_>, uri: &str, time_us: i64) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO tombstones (uri, time_us) VALUES (?1, ?2)
         ON CONFLICT(uri) DO UPDATE SET time_us = MAX(time_us, excluded.time_us)",
        params![uri, time_us],
    )?;
    Ok(())
}

fn write_handle(tx: &Transaction<'_>, did: &str, handle: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO user_did_handles (did, handle, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(did) DO UPDATE SET
            handle = excluded.handle,
            updated_at = excluded.updated_at",
        params![did, handle, unix_now()],
    )?;
    tx.execute(
        "UPDATE bookmarks SET handle = ?2 WHERE did = ?1 AND handle != ?2",
        params![did, handle],
    )?;
    Ok(())
}

/// Make the `Verified` association of every bookmark of `subject` match
/// whether any verification claims that subject.
fn sync_verified_tag(tx: &Transaction<'_>, subject: &str) -> rusqlite::Result<()> {
    let verified: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM verifications WHERE subject = ?1)",
        [subject],
        |row| row.get(0),
    )?;

    if verified {
        tx.execute(
            "INSERT OR IGNORE INTO bookmark_tags (bookmark_uri, tag_id)
             SELECT b.uri, t.id FROM bookmarks b, tags t
             WHERE b.subject = ?1 AND t.name_key = ?2",
            params![subject, tag_key(VERIFIED_TAG)],
        )?;
    } else {
        tx.execute(
            "DELETE FROM bookmark_tags
             WHERE tag_id = (SELECT id FROM tags WHERE name_key = ?2)
               AND bookmark_uri IN (SELECT uri FROM bookmarks WHERE subject = ?1)",
            params![subject, tag_key(VERIFIED_TAG)],
        )?;
    }
    Ok(())
}

/// `Verified` first, then case-insensitive by name.
pub(crate) fn sort_tags(tags: &mut [String]) {
    tags.sort_by(|a, b| {
        let a_verified = a == VERIFIED_TAG;
        let b_verified = b == VERIFIED_TAG;
        b_verified
            .cmp(&a_verified)
            .then_with(|| a.to_lowercase().cmp(&b.to_lowercase()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const URI: &str = "at://did:plc:alice/blue.rito.feed.bookmark/3kaaa";

    fn store() -> IndexStore {
        IndexStore::new(Database::open_in_memory().unwrap())
    }

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()
    }

    fn bookmark(uri: &str, subject: &str, time_us: i64) -> BookmarkWrite {
        BookmarkWrite {
            uri: uri.to_string(),
            did: "did:plc:alice".to_string(),
            handle: "alice.test".to_string(),
            remember_handle: false,
            subject: subject.to_string(),
            ogp: OgpData {
                title: Some("Example".to_string()),
                description: None,
                image: None,
            },
            moderation_result: None,
            comments: vec![CommentWrite {
                lang: Lang::En,
                title: "t".to_string(),
                comment: "c".to_string(),
                moderation_result: None,
            }],
            tags: vec!["rust".to_string(), "golang".to_string()],
            created_at: created(),
            time_us,
        }
    }

    fn verification(uri: &str, subject: &str, time_us: i64) -> VerificationWrite {
        VerificationWrite {
            uri: uri.to_string(),
            did: "did:plc:owner".to_string(),
            subject: subject.to_string(),
            nsid: None,
            created_at: created(),
            time_us,
        }
    }

    // =========================================================================
    // Bookmarks
    // =========================================================================

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();
        let write = bookmark(URI, "https://example.com/", 10);

        assert_eq!(store.upsert_bookmark(&write).unwrap(), WriteOutcome::Applied);
        let first = store.load_bookmark(URI).unwrap().unwrap();

        assert_eq!(store.upsert_bookmark(&write).unwrap(), WriteOutcome::Applied);
        let second = store.load_bookmark(URI).unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(store.counts().unwrap().bookmarks, 1);
        assert_eq!(second.tags, vec!["golang", "rust"]);
        assert_eq!(second.comments.len(), 1);
    }

    #[test]
    fn test_update_replaces_children() {
        let store = store();
        store.upsert_bookmark(&bookmark(URI, "https://example.com/", 10)).unwrap();

        let mut update = bookmark(URI, "https://example.com/", 20);
        update.tags = vec!["zig".to_string()];
        update.comments = vec![CommentWrite {
            lang: Lang::Ja,
            title: String::new(),
            comment: "更新".to_string(),
            moderation_result: None,
        }];
        store.upsert_bookmark(&update).unwrap();

        let loaded = store.load_bookmark(URI).unwrap().unwrap();
        assert_eq!(loaded.tags, vec!["zig"]);
        assert_eq!(loaded.comments.len(), 1);
        assert_eq!(loaded.comments[0].lang, "ja");
    }

    #[test]
    fn test_indexed_at_survives_update() {
        let store = store();
        store.upsert_bookmark(&bookmark(URI, "https://example.com/", 10)).unwrap();
        let before = store.load_bookmark(URI).unwrap().unwrap().indexed_at;

        store.upsert_bookmark(&bookmark(URI, "https://example.com/b", 20)).unwrap();
        let after = store.load_bookmark(URI).unwrap().unwrap();

        assert_eq!(after.indexed_at, before);
        assert_eq!(after.subject, "https://example.com/b");
    }

    #[test]
    fn test_stale_update_is_ignored() {
        let store = store();
        store.upsert_bookmark(&bookmark(URI, "https://example.com/new", 20)).unwrap();

        let outcome = store
            .upsert_bookmark(&bookmark(URI, "https://example.com/old", 10))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Stale);
        assert_eq!(
            store.load_bookmark(URI).unwrap().unwrap().subject,
            "https://example.com/new"
        );
    }

    #[test]
    fn test_delete_removes_children_and_is_idempotent() {
        let store = store();
        store.upsert_bookmark(&bookmark(URI, "https://example.com/", 10)).unwrap();

        assert_eq!(store.delete_bookmark(URI, 20).unwrap(), WriteOutcome::Applied);
        assert_eq!(store.delete_bookmark(URI, 20).unwrap(), WriteOutcome::Applied);

        assert!(store.load_bookmark(URI).unwrap().is_none());
        let counts = store.counts().unwrap();
        assert_eq!(counts.bookmarks, 0);
        assert_eq!(counts.comments, 0);
        assert_eq!(store.tag_usage("rust").unwrap(), 0);
    }

    #[test]
    fn test_tombstone_blocks_redelivered_create() {
        let store = store();
        store.upsert_bookmark(&bookmark(URI, "https://example.com/", 10)).unwrap();
        store.delete_bookmark(URI, 30).unwrap();

        let outcome = store
            .upsert_bookmark(&bookmark(URI, "https://example.com/", 10))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Stale);
        assert!(store.load_bookmark(URI).unwrap().is_none());

        // A genuinely newer create is accepted again.
        let outcome = store
            .upsert_bookmark(&bookmark(URI, "https://example.com/", 40))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied);
    }

    #[test]
    fn test_stored_preview() {
        let store = store();
        assert!(store.stored_preview(URI).unwrap().is_none());

        store.upsert_bookmark(&bookmark(URI, "https://example.com/", 10)).unwrap();
        let preview = store.stored_preview(URI).unwrap().unwrap();
        assert_eq!(preview.subject, "https://example.com/");
        assert_eq!(preview.ogp.title.as_deref(), Some("Example"));
    }

    // =========================================================================
    // Tags
    // =========================================================================

    #[test]
    fn test_shared_tag_is_created_once() {
        let store = store();
        store.upsert_bookmark(&bookmark(URI, "https://a.example/", 10)).unwrap();
        store
            .upsert_bookmark(&bookmark(
                "at://did:plc:bob/blue.rito.feed.bookmark/3kbbb",
                "https://b.example/",
                11,
            ))
            .unwrap();

        // Verified + golang + rust
        assert_eq!(store.counts().unwrap().tags, 3);
        assert_eq!(store.tag_usage("golang").unwrap(), 2);
        assert_eq!(store.tag_usage("GOLANG").unwrap(), 2);
    }

    #[test]
    fn test_unicode_tag_identity_survives_cold_cache() {
        let db = Database::open_in_memory().unwrap();
        let warm = IndexStore::new(db.clone());

        let mut first = bookmark(URI, "https://a.example/", 10);
        first.tags = vec!["Äpfel".to_string(), "Ｒｕｓｔ".to_string()];
        warm.upsert_bookmark(&first).unwrap();

        let other = "at://did:plc:bob/blue.rito.feed.bookmark/3kbbb";
        let mut second = bookmark(other, "https://b.example/", 11);
        second.tags = vec!["äpfel".to_string(), "ｒｕｓｔ".to_string()];
        warm.upsert_bookmark(&second).unwrap();
        let warm_counts = warm.counts().unwrap();

        // A fresh store has an empty cache and must resolve through the table.
        let cold = IndexStore::new(db);
        cold.upsert_bookmark(&second).unwrap();

        assert_eq!(cold.counts().unwrap(), warm_counts);
        // Verified + Äpfel + Ｒｕｓｔ
        assert_eq!(warm_counts.tags, 3);
        assert_eq!(cold.tag_usage("ÄPFEL").unwrap(), 2);
        assert_eq!(cold.tag_usage("ｒｕｓｔ").unwrap(), 2);
        assert_eq!(
            cold.load_bookmark(other).unwrap().unwrap().tags,
            vec!["Äpfel".to_string(), "Ｒｕｓｔ".to_string()]
        );
    }

    #[test]
    fn test_user_cannot_assign_verified() {
        let store = store();
        let mut write = bookmark(URI, "https://example.com/", 10);
        write.tags.push("verified".to_string());
        store.upsert_bookmark(&write).unwrap();

        let loaded = store.load_bookmark(URI).unwrap().unwrap();
        assert!(!loaded.tags.iter().any(|t| t.eq_ignore_ascii_case(VERIFIED_TAG)));
    }

    #[test]
    fn test_sort_tags_verified_first() {
        let mut tags = vec![
            "zig".to_string(),
            VERIFIED_TAG.to_string(),
            "Alpha".to_string(),
            "beta".to_string(),
        ];
        sort_tags(&mut tags);
        assert_eq!(tags, vec![VERIFIED_TAG, "Alpha", "beta", "zig"]);
    }

    // =========================================================================
    // Verifications
    // =========================================================================

    #[test]
    fn test_verification_tags_existing_and_later_bookmarks() {
        let store = store();
        let subject = "https://example.com/";
        store.upsert_bookmark(&bookmark(URI, subject, 10)).unwrap();

        let vuri = "at://did:plc:owner/blue.rito.service.verification/v1";
        store.upsert_verification(&verification(vuri, subject, 20)).unwrap();

        let loaded = store.load_bookmark(URI).unwrap().unwrap();
        assert_eq!(loaded.tags.first().map(String::as_str), Some(VERIFIED_TAG));

        let later = "at://did:plc:bob/blue.rito.feed.bookmark/3kccc";
        store.upsert_bookmark(&bookmark(later, subject, 30)).unwrap();
        let loaded = store.load_bookmark(later).unwrap().unwrap();
        assert_eq!(loaded.tags.first().map(String::as_str), Some(VERIFIED_TAG));

        // Updating the bookmark keeps the pipeline-owned tag.
        store.upsert_bookmark(&bookmark(URI, subject, 40)).unwrap();
        assert_eq!(store.tag_usage(VERIFIED_TAG).unwrap(), 2);

        store.delete_verification(vuri, 50).unwrap();
        assert_eq!(store.tag_usage(VERIFIED_TAG).unwrap(), 0);
    }

    // =========================================================================
    // Resolvers
    // =========================================================================

    fn resolver(template: &str, did: &str, time_us: i64) -> ResolverWrite {
        ResolverWrite {
            uri: format!("at://{did}/blue.rito.service.schema/self"),
            did: did.to_string(),
            nsid: "app.bsky.feed.post".to_string(),
            schema_template: template.to_string(),
            created_at: created(),
            time_us,
        }
    }

    #[test]
    fn test_resolver_verified_flag_lifecycle() {
        let store = store();
        let template = "https://bsky.app/profile/{did}/post/{rkey}";
        store.upsert_resolver(&resolver(template, "did:plc:owner", 10)).unwrap();
        assert!(!store.get_resolver("app.bsky.feed.post").unwrap().unwrap().verified);

        assert!(store.set_resolver_verified("app.bsky.feed.post", template).unwrap());

        // Same template and owner: flag survives.
        store.upsert_resolver(&resolver(template, "did:plc:owner", 20)).unwrap();
        assert!(store.get_resolver("app.bsky.feed.post").unwrap().unwrap().verified);

        // Changed template: flag resets.
        store
            .upsert_resolver(&resolver("https://other.example/{rkey}", "did:plc:owner", 30))
            .unwrap();
        assert!(!store.get_resolver("app.bsky.feed.post").unwrap().unwrap().verified);

        // Verifying against a stale template is refused.
        assert!(!store.set_resolver_verified("app.bsky.feed.post", template).unwrap());
    }

    #[test]
    fn test_resolver_delete() {
        let store = store();
        let write = resolver("https://x.example/{rkey}", "did:plc:owner", 10);
        store.upsert_resolver(&write).unwrap();
        store.delete_resolver(&write.uri, 20).unwrap();
        assert!(store.get_resolver("app.bsky.feed.post").unwrap().is_none());
    }

    // =========================================================================
    // Likes and handles
    // =========================================================================

    #[test]
    fn test_like_lifecycle() {
        let store = store();
        let like = LikeWrite {
            uri: "at://did:plc:bob/blue.rito.feed.like/l1".to_string(),
            did: "did:plc:bob".to_string(),
            subject: URI.to_string(),
            created_at: created(),
            time_us: 10,
        };
        store.upsert_like(&like).unwrap();
        store.upsert_like(&like).unwrap();
        assert_eq!(store.counts().unwrap().likes, 1);

        assert_eq!(store.delete_like(&like.uri, 5).unwrap(), WriteOutcome::Stale);
        assert!(store.get_like(&like.uri).unwrap().is_some());

        assert_eq!(store.delete_like(&like.uri, 20).unwrap(), WriteOutcome::Applied);
        assert!(store.get_like(&like.uri).unwrap().is_none());
    }

    #[test]
    fn test_handle_refreshes_bookmarks() {
        let store = store();
        store.upsert_bookmark(&bookmark(URI, "https://example.com/", 10)).unwrap();

        store.upsert_handle("did:plc:alice", "alice.new").unwrap();
        assert_eq!(
            store.get_handle("did:plc:alice").unwrap().as_deref(),
            Some("alice.new")
        );
        assert_eq!(store.load_bookmark(URI).unwrap().unwrap().handle, "alice.new");
    }

    #[test]
    fn test_bookmark_remembers_handle_in_same_write() {
        let store = store();
        store.upsert_bookmark(&bookmark(URI, "https://example.com/", 10)).unwrap();

        let other = "at://did:plc:alice/blue.rito.feed.bookmark/3kccc";
        let mut write = bookmark(other, "https://example.org/", 11);
        write.handle = "alice.renamed".to_string();
        write.remember_handle = true;
        store.upsert_bookmark(&write).unwrap();

        assert_eq!(
            store.get_handle("did:plc:alice").unwrap().as_deref(),
            Some("alice.renamed")
        );
        assert_eq!(store.load_bookmark(URI).unwrap().unwrap().handle, "alice.renamed");

        // Stale bookmark writes still keep the resolved handle.
        let mut stale = bookmark(other, "https://example.org/", 5);
        stale.handle = "alice.latest".to_string();
        stale.remember_handle = true;
        assert_eq!(store.upsert_bookmark(&stale).unwrap(), WriteOutcome::Stale);
        assert_eq!(
            store.get_handle("did:plc:alice").unwrap().as_deref(),
            Some("alice.latest")
        );
    }

    #[test]
    fn test_prune_tombstones() {
        let store = store();
        store.delete_like("at://did:plc:bob/blue.rito.feed.like/a", 10).unwrap();
        store.delete_like("at://did:plc:bob/blue.rito.feed.like/b", 100).unwrap();

        assert_eq!(store.prune_tombstones(50).unwrap(), 1);
        assert_eq!(store.counts().unwrap().tombstones, 1);
    }
}
