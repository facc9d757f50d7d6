//! Link preview (Open Graph) fetching.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderValue, USER_AGENT};
use scraper::{Html, Selector};
use url::Url;

use crate::store::OgpData;
use crate::{Error, Result};

/// Largest HTML body we parse.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const MAX_TITLE_CHARS: usize = 300;
const MAX_DESCRIPTION_CHARS: usize = 1000;

const DEFAULT_USER_AGENT: &str = concat!("rito-ingest/", env!("CARGO_PKG_VERSION"));

/// Fetches preview metadata for a URL.
#[async_trait]
pub trait PreviewFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<OgpData>;
}

/// Fetches the page over HTTP and scrapes its `<meta>` tags.
pub struct HttpPreviewFetcher {
    client: reqwest::Client,
}

impl HttpPreviewFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PreviewFetcher for HttpPreviewFetcher {
    async fn fetch(&self, url: &str) -> Result<OgpData> {
        let base = Url::parse(url).map_err(|e| Error::enrichment("ogp", e.to_string()))?;

        let resp = self
            .client
            .get(base.clone())
            .header(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::enrichment(
                "ogp",
                format!("HTTP {} from {}", resp.status(), url),
            ));
        }

        let is_html = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|ct| ct.contains("html"));
        if !is_html {
            return Ok(OgpData::default());
        }

        if resp
            .content_length()
            .is_some_and(|len| len as usize > MAX_BODY_BYTES)
        {
            return Err(Error::enrichment("ogp", "response too large"));
        }

        // Redirects may have moved us; relative image paths resolve against
        // the final URL.
        let final_url = resp.url().clone();
        let body = std::pin::pin!(resp.bytes_stream());
        let bytes = read_capped(body, MAX_BODY_BYTES).await?;

        let html = String::from_utf8_lossy(&bytes);
        Ok(parse_ogp(&html, &final_url))
    }
}

/// Collect a body stream, failing as soon as it grows past `max` bytes.
async fn read_capped<S, B, E>(mut stream: S, max: usize) -> Result<Vec<u8>>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    Error: From<E>,
{
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let chunk = chunk.as_ref();
        if body.len() + chunk.len() > max {
            return Err(Error::enrichment("ogp", "response too large"));
        }
        body.extend_from_slice(chunk);
    }
    Ok(body)
}

/// Extract preview metadata from an HTML document.
///
/// Falls back from `og:*` to `twitter:*` to plain `<title>` / description.
pub fn parse_ogp(html: &str, base: &Url) -> OgpData {
    let document = Html::parse_document(html);

    let title = meta_content(&document, r#"meta[property="og:title"]"#)
        .or_else(|| meta_content(&document, r#"meta[name="twitter:title"]"#))
        .or_else(|| first_text(&document, "title"))
        .map(|t| truncate(&t, MAX_TITLE_CHARS));

    let description = meta_content(&document, r#"meta[property="og:description"]"#)
        .or_else(|| meta_content(&document, r#"meta[name="twitter:description"]"#))
        .or_else(|| meta_content(&document, r#"meta[name="description"]"#))
        .map(|d| truncate(&d, MAX_DESCRIPTION_CHARS));

    let image = meta_content(&document, r#"meta[property="og:image"]"#)
        .or_else(|| meta_content(&document, r#"meta[property="og:image:url"]"#))
        .or_else(|| meta_content(&document, r#"meta[name="twitter:image"]"#))
        .and_then(|src| base.join(&src).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|u| u.to_string());

    OgpData {
        title,
        description,
        image,
    }
}

fn meta_content(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr("content"))
        .and_then(non_empty)
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| non_empty(&n.text().collect::<String>()))
}

fn non_empty(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
