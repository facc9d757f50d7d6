//! AT-URI handling.
//!
//! Every indexed row is keyed by the canonical URI of the record that produced
//! it: `at://{did}/{collection}/{rkey}`. The URI is the idempotency key for the
//! whole pipeline, so it is always rebuilt from the envelope fields rather than
//! taken from the record body.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Scheme prefix for AT Protocol URIs.
const AT_SCHEME: &str = "at://";

/// A parsed `at://{did}/{collection}/{rkey}` record URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    /// Build the canonical URI for a record.
    pub fn new(did: &str, collection: &str, rkey: &str) -> Result<Self> {
        if !is_valid_did(did) {
            return Err(Error::InvalidUri(format!("{AT_SCHEME}{did}/{collection}/{rkey}")));
        }
        if !is_valid_nsid(collection) {
            return Err(Error::InvalidUri(format!("{AT_SCHEME}{did}/{collection}/{rkey}")));
        }
        if !is_valid_rkey(rkey) {
            return Err(Error::InvalidUri(format!("{AT_SCHEME}{did}/{collection}/{rkey}")));
        }
        Ok(Self {
            did: did.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }

    /// Parse a full record URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(AT_SCHEME)
            .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;

        let mut parts = rest.splitn(3, '/');
        let (Some(did), Some(collection), Some(rkey)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidUri(uri.to_string()));
        };

        Self::new(did, collection, rkey).map_err(|_| Error::InvalidUri(uri.to_string()))
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{AT_SCHEME}{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Check a DID for the `did:{method}:{identifier}` shape.
pub fn is_valid_did(did: &str) -> bool {
    let mut parts = did.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("did"), Some(method), Some(id)) => {
            !method.is_empty()
                && method.chars().all(|c| c.is_ascii_lowercase())
                && !id.is_empty()
                && !id.contains('/')
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '%' | '-'))
        }
        _ => false,
    }
}

/// Check a namespaced identifier such as `blue.rito.feed.bookmark`.
///
/// Requires at least three dot-separated segments; the final segment (the
/// name) must start with a letter.
pub fn is_valid_nsid(nsid: &str) -> bool {
    if nsid.len() > 317 {
        return false;
    }
    let segments: Vec<&str> = nsid.split('.').collect();
    if segments.len() < 3 {
        return false;
    }
    let valid_segment = |s: &&str| {
        !s.is_empty()
            && s.len() <= 63
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !s.starts_with('-')
            && !s.ends_with('-')
    };
    let name = segments[segments.len() - 1];
    segments.iter().all(valid_segment)
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

/// Check a record key.
pub fn is_valid_rkey(rkey: &str) -> bool {
    !rkey.is_empty()
        && rkey.len() <= 512
        && rkey != "."
        && rkey != ".."
        && rkey
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_display() {
        let uri = AtUri::new("did:plc:abc123", "blue.rito.feed.bookmark", "3kabc").unwrap();
        assert_eq!(
            uri.to_string(),
            "at://did:plc:abc123/blue.rito.feed.bookmark/3kabc"
        );
        assert_eq!(AtUri::parse(&uri.to_string()).unwrap(), uri);
    }

    #[test]
    fn test_parse_did_web() {
        let uri = AtUri::parse("at://did:web:example.com/blue.rito.feed.like/self").unwrap();
        assert_eq!(uri.did, "did:web:example.com");
        assert_eq!(uri.rkey, "self");
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(AtUri::parse("https://example.com/a/b").is_err());
        assert!(AtUri::parse("at://did:plc:abc/blue.rito.feed.bookmark").is_err());
        assert!(AtUri::parse("at://alice.bsky.social/blue.rito.feed.bookmark/x").is_err());
        assert!(AtUri::parse("at://did:plc:abc/notansid/x").is_err());
        assert!(AtUri::parse("at://did:plc:abc/blue.rito.feed.bookmark/a/b").is_err());
    }

    #[test]
    fn test_nsid_validation() {
        assert!(is_valid_nsid("blue.rito.feed.bookmark"));
        assert!(is_valid_nsid("app.bsky.feed.post"));
        assert!(!is_valid_nsid("bookmark"));
        assert!(!is_valid_nsid("blue..feed"));
        assert!(!is_valid_nsid("blue.rito.1feed"));
    }

    #[test]
    fn test_did_validation() {
        assert!(is_valid_did("did:plc:z72i7hdynmk6r22z27h6tvur"));
        assert!(is_valid_did("did:web:example.com"));
        assert!(!is_valid_did("did:plc:"));
        assert!(!is_valid_did("plc:abc"));
        assert!(!is_valid_did("did:PLC:abc"));
    }
}
