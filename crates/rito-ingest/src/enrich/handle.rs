//! DID to handle resolution.

use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;

use crate::{Error, Result};

const HANDLE_CACHE_CAPACITY: u64 = 50_000;
const HANDLE_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";

/// Resolves a DID to its current handle.
#[async_trait]
pub trait HandleResolver: Send + Sync {
    /// `Ok(None)` when the DID document exists but declares no handle.
    async fn resolve(&self, did: &str) -> Result<Option<String>>;

    /// Learn a handle from another source (identity events).
    async fn remember(&self, _did: &str, _handle: &str) {}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidDocument {
    #[serde(default)]
    also_known_as: Vec<String>,
}

/// Resolves handles from DID documents (`did:plc` via the PLC directory,
/// `did:web` via `/.well-known/did.json`), with an in-memory cache.
pub struct DidDocumentResolver {
    client: reqwest::Client,
    plc_directory: String,
    cache: Cache<String, String>,
}

impl DidDocumentResolver {
    pub fn new(plc_directory: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let cache = Cache::builder()
            .max_capacity(HANDLE_CACHE_CAPACITY)
            .time_to_live(HANDLE_CACHE_TTL)
            .build();

        Ok(Self {
            client,
            plc_directory: plc_directory.trim_end_matches('/').to_string(),
            cache,
        })
    }

    fn document_url(&self, did: &str) -> Result<String> {
        if did.starts_with("did:plc:") {
            Ok(format!("{}/{}", self.plc_directory, did))
        } else if let Some(host) = did.strip_prefix("did:web:") {
            // did:web encodes a port as %3A
            let host = host.replace("%3A", ":");
            Ok(format!("https://{host}/.well-known/did.json"))
        } else {
            Err(Error::enrichment(
                "handle",
                format!("unsupported DID method: {did}"),
            ))
        }
    }
}

#[async_trait]
impl HandleResolver for DidDocumentResolver {
    async fn resolve(&self, did: &str) -> Result<Option<String>> {
        if let Some(handle) = self.cache.get(did).await {
            return Ok(Some(handle));
        }

        let url = self.document_url(did)?;
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::enrichment(
                "handle",
                format!("HTTP {} resolving {}", resp.status(), did),
            ));
        }

        let doc: DidDocument = resp.json().await?;
        let handle = handle_from_document(&doc);

        if let Some(ref handle) = handle {
            self.cache.insert(did.to_string(), handle.clone()).await;
        }

        Ok(handle)
    }

    async fn remember(&self, did: &str, handle: &str) {
        self.cache.insert(did.to_string(), handle.to_string()).await;
    }
}

fn handle_from_document(doc: &DidDocument) -> Option<String> {
    doc.also_known_as
        .iter()
        .find_map(|aka| aka.strip_prefix("at://"))
        .map(|h| h.trim_end_matches('/').to_ascii_lowercase())
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> DidDocumentResolver {
        DidDocumentResolver::new("https://plc.example/", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_document_urls() {
        let r = resolver();
        assert_eq!(
            r.document_url("did:plc:abc").unwrap(),
            "https://plc.example/did:plc:abc"
        );
        assert_eq!(
            r.document_url("did:web:example.com").unwrap(),
            "https://example.com/.well-known/did.json"
        );
        assert_eq!(
            r.document_url("did:web:localhost%3A8080").unwrap(),
            "https://localhost:8080/.well-known/did.json"
        );
        assert!(r.document_url("did:key:z6Mk").is_err());
    }

    #[test]
    fn test_handle_from_document() {
        let doc: DidDocument = serde_json::from_str(
            r#"{"id":"did:plc:abc","alsoKnownAs":["https://alice.example","at://Alice.Example.com"]}"#,
        )
        .unwrap();
        assert_eq!(handle_from_document(&doc).as_deref(), Some("alice.example.com"));

        let empty: DidDocument = serde_json::from_str(r#"{"id":"did:plc:abc"}"#).unwrap();
        assert_eq!(handle_from_document(&empty), None);
    }

    #[tokio::test]
    async fn test_remembered_handle_skips_network() {
        let r = resolver();
        r.remember("did:plc:abc", "alice.test").await;
        assert_eq!(
            r.resolve("did:plc:abc").await.unwrap().as_deref(),
            Some("alice.test")
        );
    }
}
