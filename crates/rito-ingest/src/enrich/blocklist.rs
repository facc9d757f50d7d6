//! Domain blocklist.
//!
//! A blocked entry matches the domain itself and every subdomain:
//! `spam.net` blocks `deep.sub.spam.net` but not `notspam.net`.

use std::collections::HashSet;
use std::path::Path;

use url::Url;

use crate::Result;

/// Moderation value stored on bookmarks whose subject is blocked.
pub const BLOCKED_DOMAIN: &str = "blocked-domain";

#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    domains: HashSet<String>,
}

impl Blocklist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|d| normalize_domain(d.as_ref()))
            .collect();
        Self { domains }
    }

    /// Load one domain per line. Blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let list = Self::new(
            contents
                .lines()
                .map(|line| line.split('#').next().unwrap_or_default()),
        );
        tracing::info!(
            "Loaded {} blocked domains from {}",
            list.len(),
            path.display()
        );
        Ok(list)
    }

    /// Merge another list into this one.
    pub fn extend(&mut self, other: Blocklist) {
        self.domains.extend(other.domains);
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Whether `host` or any parent domain of it is listed.
    pub fn is_blocked(&self, host: &str) -> bool {
        let Some(host) = normalize_domain(host) else {
            return false;
        };

        let mut candidate = host.as_str();
        loop {
            if self.domains.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }

    /// Whether the host of `url` is blocked. Unparseable URLs are not.
    pub fn is_url_blocked(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| self.is_blocked(h)))
            .unwrap_or(false)
    }
}

fn normalize_domain(raw: &str) -> Option<String> {
    let d = raw.trim().trim_start_matches("*.").trim_matches('.');
    if d.is_empty() {
        None
    } else {
        Some(d.to_ascii_lowercase())
    }
}
