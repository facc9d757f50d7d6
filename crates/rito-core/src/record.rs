//! Typed records and per-collection validation.
//!
//! Validation covers only the fields the index needs. Full lexicon conformance
//! is the job of an external validator; unknown fields are ignored here.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::uri::{AtUri, is_valid_nsid};
use crate::{BOOKMARK_COLLECTION, LIKE_COLLECTION, SCHEMA_COLLECTION, VERIFICATION_COLLECTION};

/// Maximum accepted length of a bookmark subject URL.
const MAX_SUBJECT_LEN: usize = 2048;

/// Languages a bookmark comment can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lang {
    Ja,
    En,
}

impl Lang {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ja => "ja",
            Self::En => "en",
        }
    }
}

impl std::str::FromStr for Lang {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ja" => Ok(Self::Ja),
            "en" => Ok(Self::En),
            _ => Err(()),
        }
    }
}

/// One localized comment attached to a bookmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentEntry {
    pub lang: Lang,
    pub title: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkRecord {
    /// Normalized http(s) URL of the bookmarked page.
    pub subject: String,
    pub comments: Vec<CommentEntry>,
    /// Tags exactly as written by the author; canonicalized later.
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LikeRecord {
    /// AT-URI of the liked record, or an http(s) URL.
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

/// AppView registration: "records of `nsid` are served at `schema_template`".
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSchemaRecord {
    pub nsid: String,
    pub schema_template: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRecord {
    /// Normalized http(s) URL the claim vouches for.
    pub subject: String,
    /// Resolver NSID the claim is offered as evidence for, if any.
    pub nsid: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A validated record of one of the tracked collections.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Bookmark(BookmarkRecord),
    Like(LikeRecord),
    ServiceSchema(ServiceSchemaRecord),
    Verification(VerificationRecord),
}

// Wire shapes. Everything is optional so that a missing field becomes a
// `MissingField` rejection rather than an opaque serde message.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBookmark {
    subject: Option<String>,
    #[serde(default)]
    comments: Vec<RawComment>,
    #[serde(default)]
    tags: Vec<String>,
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct RawComment {
    lang: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    comment: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLike {
    subject: Option<String>,
    created_at: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceSchema {
    nsid: Option<String>,
    schema: Option<String>,
    created_at: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerification {
    subject: Option<String>,
    nsid: Option<String>,
    created_at: Option<String>,
}

/// Validate a raw record body for the given collection.
///
/// # Errors
///
/// Returns an error if the collection is not tracked, the JSON does not
/// parse, or a required field is missing or malformed.
pub fn validate_record(collection: &str, raw: &str) -> Result<Record> {
    match collection {
        BOOKMARK_COLLECTION => validate_bookmark(raw).map(Record::Bookmark),
        LIKE_COLLECTION => validate_like(raw).map(Record::Like),
        SCHEMA_COLLECTION => validate_service_schema(raw).map(Record::ServiceSchema),
        VERIFICATION_COLLECTION => validate_verification(raw).map(Record::Verification),
        other => Err(Error::UnsupportedCollection(other.to_string())),
    }
}

fn validate_bookmark(raw: &str) -> Result<BookmarkRecord> {
    let parsed: RawBookmark = serde_json::from_str(raw)?;

    let subject = parse_web_url("subject", parsed.subject)?;
    let created_at = parse_datetime(parsed.created_at)?;

    let comments = parsed
        .comments
        .into_iter()
        .filter_map(|c| {
            let lang = c.lang.as_deref().and_then(|l| l.parse::<Lang>().ok());
            match lang {
                Some(lang) => Some(CommentEntry {
                    lang,
                    title: c.title.trim().to_string(),
                    comment: c.comment.trim().to_string(),
                }),
                None => {
                    tracing::debug!(lang = ?c.lang, "dropping comment with unsupported lang");
                    None
                }
            }
        })
        .collect::<Vec<_>>();

    // One comment per language; the first one wins.
    let mut seen = Vec::with_capacity(comments.len());
    let comments = comments
        .into_iter()
        .filter(|c| {
            if seen.contains(&c.lang) {
                false
            } else {
                seen.push(c.lang);
                true
            }
        })
        .collect();

    Ok(BookmarkRecord {
        subject,
        comments,
        tags: parsed.tags,
        created_at,
    })
}

fn validate_like(raw: &str) -> Result<LikeRecord> {
    let parsed: RawLike = serde_json::from_str(raw)?;

    let subject = parsed
        .subject
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(Error::MissingField("subject"))?;

    let subject = if subject.starts_with("at://") {
        AtUri::parse(&subject)?.to_string()
    } else {
        parse_web_url("subject", Some(subject))?
    };

    Ok(LikeRecord {
        subject,
        created_at: parse_datetime(parsed.created_at)?,
    })
}

fn validate_service_schema(raw: &str) -> Result<ServiceSchemaRecord> {
    let parsed: RawServiceSchema = serde_json::from_str(raw)?;

    let nsid = parse_nsid(parsed.nsid)?.ok_or(Error::MissingField("nsid"))?;

    let schema_template = parsed
        .schema
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(Error::MissingField("schema"))?;

    if !(schema_template.starts_with("https://") || schema_template.starts_with("http://")) {
        return Err(Error::InvalidField {
            field: "schema",
            reason: "template must be an http(s) URL".to_string(),
        });
    }

    Ok(ServiceSchemaRecord {
        nsid,
        schema_template,
        created_at: parse_datetime(parsed.created_at)?,
    })
}

fn validate_verification(raw: &str) -> Result<VerificationRecord> {
    let parsed: RawVerification = serde_json::from_str(raw)?;

    Ok(VerificationRecord {
        subject: parse_web_url("subject", parsed.subject)?,
        nsid: parse_nsid(parsed.nsid)?,
        created_at: parse_datetime(parsed.created_at)?,
    })
}

/// Parse and normalize an http(s) URL.
///
/// The normalized string (as produced by [`Url`]) is what gets stored, so two
/// spellings of the same page compare equal in the index.
pub fn parse_web_url(field: &'static str, value: Option<String>) -> Result<String> {
    let value = value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(Error::MissingField(field))?;

    if value.len() > MAX_SUBJECT_LEN {
        return Err(Error::InvalidField {
            field,
            reason: format!("longer than {MAX_SUBJECT_LEN} bytes"),
        });
    }

    let url = Url::parse(&value).map_err(|e| Error::InvalidField {
        field,
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidField {
            field,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidField {
            field,
            reason: "missing host".to_string(),
        });
    }

    Ok(url.to_string())
}

fn parse_nsid(value: Option<String>) -> Result<Option<String>> {
    match value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(nsid) if is_valid_nsid(&nsid) => Ok(Some(nsid)),
        Some(nsid) => Err(Error::InvalidField {
            field: "nsid",
            reason: format!("'{nsid}' is not a valid NSID"),
        }),
    }
}

fn parse_datetime(value: Option<String>) -> Result<DateTime<Utc>> {
    let value = value.ok_or(Error::MissingField("createdAt"))?;
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::InvalidField {
            field: "createdAt",
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bookmark(json: &str) -> Result<BookmarkRecord> {
        match validate_record(BOOKMARK_COLLECTION, json)? {
            Record::Bookmark(b) => Ok(b),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn test_valid_bookmark() {
        let b = bookmark(
            r##"{
                "$type": "blue.rito.feed.bookmark",
                "subject": "https://Example.com/articles/1",
                "comments": [
                    {"lang": "ja", "title": " タイトル ", "comment": "メモ"},
                    {"lang": "en", "title": "Title", "comment": "note"}
                ],
                "tags": ["golang", "#rust"],
                "createdAt": "2025-01-02T03:04:05.678Z"
            }"##,
        )
        .unwrap();

        assert_eq!(b.subject, "https://example.com/articles/1");
        assert_eq!(b.comments.len(), 2);
        assert_eq!(b.comments[0].lang, Lang::Ja);
        assert_eq!(b.comments[0].title, "タイトル");
        assert_eq!(b.tags, vec!["golang", "#rust"]);
    }

    #[test]
    fn test_bookmark_requires_subject() {
        let err = bookmark(r#"{"createdAt": "2025-01-02T03:04:05Z"}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("subject")));
    }

    #[test]
    fn test_bookmark_rejects_non_web_subject() {
        let err = bookmark(r#"{"subject": "ftp://example.com/x", "createdAt": "2025-01-02T03:04:05Z"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "subject", .. }));

        let err = bookmark(r#"{"subject": "not a url", "createdAt": "2025-01-02T03:04:05Z"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "subject", .. }));
    }

    #[test]
    fn test_bookmark_rejects_bad_timestamp() {
        let err = bookmark(r#"{"subject": "https://example.com", "createdAt": "yesterday"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "createdAt", .. }));
    }

    #[test]
    fn test_bookmark_drops_unknown_lang_and_duplicates() {
        let b = bookmark(
            r#"{
                "subject": "https://example.com",
                "comments": [
                    {"lang": "fr", "comment": "bonjour"},
                    {"lang": "en", "comment": "first"},
                    {"lang": "en", "comment": "second"}
                ],
                "createdAt": "2025-01-02T03:04:05Z"
            }"#,
        )
        .unwrap();
        assert_eq!(b.comments.len(), 1);
        assert_eq!(b.comments[0].comment, "first");
    }

    #[test]
    fn test_like_subjects() {
        let at = validate_record(
            LIKE_COLLECTION,
            r#"{"subject": "at://did:plc:abc/blue.rito.feed.bookmark/3k", "createdAt": "2025-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert!(matches!(at, Record::Like(ref l) if l.subject.starts_with("at://")));

        let web = validate_record(
            LIKE_COLLECTION,
            r#"{"subject": "https://example.com", "createdAt": "2025-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert!(matches!(web, Record::Like(ref l) if l.subject == "https://example.com/"));

        assert!(
            validate_record(
                LIKE_COLLECTION,
                r#"{"subject": "at://nope", "createdAt": "2025-01-02T03:04:05Z"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn test_service_schema() {
        let rec = validate_record(
            SCHEMA_COLLECTION,
            r#"{"nsid": "app.bsky.feed.post", "schema": "https://bsky.app/profile/{did}/post/{rkey}", "createdAt": "2025-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        let Record::ServiceSchema(s) = rec else {
            panic!("expected schema record");
        };
        assert_eq!(s.nsid, "app.bsky.feed.post");
        assert!(s.schema_template.contains("{rkey}"));

        assert!(
            validate_record(
                SCHEMA_COLLECTION,
                r#"{"nsid": "post", "schema": "https://x", "createdAt": "2025-01-02T03:04:05Z"}"#
            )
            .is_err()
        );
        assert!(
            validate_record(
                SCHEMA_COLLECTION,
                r#"{"nsid": "app.bsky.feed.post", "schema": "javascript:alert(1)", "createdAt": "2025-01-02T03:04:05Z"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn test_verification_optional_nsid() {
        let rec = validate_record(
            VERIFICATION_COLLECTION,
            r#"{"subject": "https://example.com/page", "createdAt": "2025-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert!(matches!(rec, Record::Verification(ref v) if v.nsid.is_none()));
    }

    #[test]
    fn test_unsupported_collection() {
        let err = validate_record("app.bsky.feed.post", "{}").unwrap_err();
        assert!(matches!(err, Error::UnsupportedCollection(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = validate_record(BOOKMARK_COLLECTION, "[1, 2").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
