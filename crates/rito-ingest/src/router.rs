//! Event classification.
//!
//! Pure mapping from an envelope to what the pipeline should do with it.
//! Events outside the tracked collections are dropped here, before any
//! record body is parsed.

use rito_core::{
    AtUri, BOOKMARK_COLLECTION, EventKind, JetstreamEvent, LIKE_COLLECTION, SCHEMA_COLLECTION,
    VERIFICATION_COLLECTION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Bookmark,
    Like,
    ServiceSchema,
    Verification,
}

impl Collection {
    pub fn from_nsid(nsid: &str) -> Option<Self> {
        match nsid {
            BOOKMARK_COLLECTION => Some(Self::Bookmark),
            LIKE_COLLECTION => Some(Self::Like),
            SCHEMA_COLLECTION => Some(Self::ServiceSchema),
            VERIFICATION_COLLECTION => Some(Self::Verification),
            _ => None,
        }
    }

    pub fn nsid(&self) -> &'static str {
        match self {
            Self::Bookmark => BOOKMARK_COLLECTION,
            Self::Like => LIKE_COLLECTION,
            Self::ServiceSchema => SCHEMA_COLLECTION,
            Self::Verification => VERIFICATION_COLLECTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Why an event was dropped without touching the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UntrackedCollection,
    UnknownOperation,
    UnknownKind,
    MissingPayload,
    InvalidUri,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UntrackedCollection => "untracked_collection",
            Self::UnknownOperation => "unknown_operation",
            Self::UnknownKind => "unknown_kind",
            Self::MissingPayload => "missing_payload",
            Self::InvalidUri => "invalid_uri",
        }
    }
}

/// A commit to one of the tracked collections.
#[derive(Debug, Clone)]
pub struct CommitRoute<'a> {
    pub uri: AtUri,
    pub collection: Collection,
    pub operation: Operation,
    /// Raw record JSON; absent on deletes.
    pub record: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub enum Route<'a> {
    Commit(CommitRoute<'a>),
    Identity { did: &'a str, handle: Option<&'a str> },
    Account { did: &'a str, active: bool, status: Option<&'a str> },
    Ignore(IgnoreReason),
}

/// Classify an envelope.
pub fn route(event: &JetstreamEvent) -> Route<'_> {
    match event.kind {
        EventKind::Commit => {
            let Some(commit) = event.commit.as_ref() else {
                return Route::Ignore(IgnoreReason::MissingPayload);
            };
            let Some(collection) = Collection::from_nsid(&commit.collection) else {
                return Route::Ignore(IgnoreReason::UntrackedCollection);
            };
            let Some(operation) = Operation::parse(&commit.operation) else {
                tracing::debug!(
                    operation = %commit.operation,
                    collection = %commit.collection,
                    "ignoring unknown commit operation"
                );
                return Route::Ignore(IgnoreReason::UnknownOperation);
            };
            let uri = match AtUri::new(&event.did, &commit.collection, &commit.rkey) {
                Ok(uri) => uri,
                Err(e) => {
                    tracing::debug!(did = %event.did, rkey = %commit.rkey, "{}", e);
                    return Route::Ignore(IgnoreReason::InvalidUri);
                }
            };
            Route::Commit(CommitRoute {
                uri,
                collection,
                operation,
                record: commit.record.as_deref().map(|r| r.get()),
            })
        }
        EventKind::Identity => match event.identity.as_ref() {
            Some(identity) => Route::Identity {
                did: &identity.did,
                handle: identity.handle.as_deref(),
            },
            None => Route::Ignore(IgnoreReason::MissingPayload),
        },
        EventKind::Account => match event.account.as_ref() {
            Some(account) => Route::Account {
                did: &account.did,
                active: account.active,
                status: account.status.as_deref(),
            },
            None => Route::Ignore(IgnoreReason::MissingPayload),
        },
        EventKind::Unknown => Route::Ignore(IgnoreReason::UnknownKind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: &str) -> JetstreamEvent {
        JetstreamEvent::from_json(json).unwrap()
    }

    #[test]
    fn test_routes_tracked_commit() {
        let e = event(
            r#"{"did":"did:plc:abc","time_us":1,"kind":"commit",
                "commit":{"operation":"create","collection":"blue.rito.feed.bookmark","rkey":"3k",
                          "record":{"subject":"https://example.com"}}}"#,
        );
        let Route::Commit(c) = route(&e) else {
            panic!("expected commit route");
        };
        assert_eq!(c.collection, Collection::Bookmark);
        assert_eq!(c.operation, Operation::Create);
        assert_eq!(c.uri.to_string(), "at://did:plc:abc/blue.rito.feed.bookmark/3k");
        assert!(c.record.unwrap().contains("example.com"));
    }

    #[test]
    fn test_ignores_untracked_collection() {
        let e = event(
            r#"{"did":"did:plc:abc","time_us":1,"kind":"commit",
                "commit":{"operation":"create","collection":"app.bsky.feed.post","rkey":"3k","record":{}}}"#,
        );
        assert!(matches!(
            route(&e),
            Route::Ignore(IgnoreReason::UntrackedCollection)
        ));
    }

    #[test]
    fn test_unknown_operation_is_noop() {
        let e = event(
            r#"{"did":"did:plc:abc","time_us":1,"kind":"commit",
                "commit":{"operation":"rename","collection":"blue.rito.feed.like","rkey":"3k"}}"#,
        );
        assert!(matches!(
            route(&e),
            Route::Ignore(IgnoreReason::UnknownOperation)
        ));
    }

    #[test]
    fn test_invalid_rkey() {
        let e = event(
            r#"{"did":"did:plc:abc","time_us":1,"kind":"commit",
                "commit":{"operation":"delete","collection":"blue.rito.feed.like","rkey":"a/b"}}"#,
        );
        assert!(matches!(route(&e), Route::Ignore(IgnoreReason::InvalidUri)));
    }

    #[test]
    fn test_identity_and_account() {
        let e = event(
            r#"{"did":"did:plc:abc","time_us":1,"kind":"identity",
                "identity":{"did":"did:plc:abc","handle":"alice.test","seq":1,"time":"t"}}"#,
        );
        assert!(matches!(
            route(&e),
            Route::Identity { handle: Some("alice.test"), .. }
        ));

        let e = event(
            r#"{"did":"did:plc:abc","time_us":1,"kind":"account",
                "account":{"active":false,"did":"did:plc:abc","seq":2,"status":"takendown","time":"t"}}"#,
        );
        assert!(matches!(
            route(&e),
            Route::Account { active: false, status: Some("takendown"), .. }
        ));
    }

    #[test]
    fn test_collection_nsid_roundtrip() {
        for c in [
            Collection::Bookmark,
            Collection::Like,
            Collection::ServiceSchema,
            Collection::Verification,
        ] {
            assert_eq!(Collection::from_nsid(c.nsid()), Some(c));
        }
    }
}
