//! Command-line and environment configuration.
//!
//! Binaries parse the clap argument groups below (each flag also reads an
//! environment variable, and `.env` is loaded first), then convert them into
//! [`IngestConfig`] / [`EnrichConfig`] and call `validate` before touching
//! the network or the database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use rito_core::TRACKED_COLLECTIONS;

use crate::enrich::{
    Blocklist, DEFAULT_PLC_DIRECTORY, DidDocumentResolver, EnrichTimeouts, Enrichers,
    HttpPreviewFetcher, NeverVerify, SameAuthorPolicy, VerificationPolicy,
};
use crate::pipeline::CheckpointConfig;
use crate::source::{JetstreamConfig, ReconnectConfig};
use crate::{Error, Result};

pub const DEFAULT_DATABASE_PATH: &str = "./data/rito.db";

/// Where the index lives.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    /// SQLite database path
    #[arg(long, env = "RITO_DATABASE_PATH", default_value = DEFAULT_DATABASE_PATH)]
    pub database_path: PathBuf,
}

/// Which verification policy confirms resolvers.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyChoice {
    /// Never mark resolvers verified
    #[default]
    Never,
    /// Verified when the claim comes from the resolver's own DID
    SameAuthor,
}

/// Enrichment collaborators and their limits.
#[derive(clap::Args, Debug, Clone)]
pub struct EnrichArgs {
    /// Link preview fetch timeout in milliseconds
    #[arg(long, env = "RITO_OGP_TIMEOUT_MS", default_value = "5000")]
    pub ogp_timeout_ms: u64,

    /// Handle resolution timeout in milliseconds
    #[arg(long, env = "RITO_HANDLE_TIMEOUT_MS", default_value = "3000")]
    pub handle_timeout_ms: u64,

    /// Comment moderation timeout in milliseconds
    #[arg(long, env = "RITO_MODERATION_TIMEOUT_MS", default_value = "3000")]
    pub moderation_timeout_ms: u64,

    /// Verification policy timeout in milliseconds
    #[arg(long, env = "RITO_VERIFICATION_TIMEOUT_MS", default_value = "5000")]
    pub verification_timeout_ms: u64,

    /// Blocklist files, one domain per line (comma-separated)
    #[arg(long, env = "RITO_BLOCKLIST_FILES", value_delimiter = ',')]
    pub blocklist_file: Vec<PathBuf>,

    /// Additional blocked domains (comma-separated)
    #[arg(long, env = "RITO_BLOCKED_DOMAINS", value_delimiter = ',')]
    pub blocked_domains: Vec<String>,

    /// PLC directory used to resolve did:plc handles
    #[arg(long, env = "RITO_PLC_DIRECTORY", default_value = DEFAULT_PLC_DIRECTORY)]
    pub plc_directory: String,

    /// Resolver verification policy
    #[arg(long, env = "RITO_VERIFICATION_POLICY", value_enum, default_value_t = PolicyChoice::Never)]
    pub verification_policy: PolicyChoice,
}

/// Live ingestion settings.
#[derive(clap::Args, Debug, Clone)]
pub struct JetstreamArgs {
    /// Jetstream subscribe endpoints, tried in order (comma-separated)
    #[arg(long, env = "RITO_JETSTREAM_ENDPOINTS", value_delimiter = ',')]
    pub endpoints: Option<Vec<String>>,

    /// Collections to subscribe to (comma-separated, defaults to all tracked)
    #[arg(long, env = "RITO_COLLECTIONS", value_delimiter = ',')]
    pub collections: Option<Vec<String>>,

    /// Start this many minutes in the past when no cursor is stored
    #[arg(long, env = "RITO_LOOKBACK_MINUTES")]
    pub lookback_minutes: Option<u64>,

    /// Seconds between cursor checkpoints
    #[arg(long, env = "RITO_CHECKPOINT_INTERVAL_SECS", default_value = "5")]
    pub checkpoint_interval_secs: u64,

    /// Initial reconnect delay in milliseconds
    #[arg(long, env = "RITO_BACKOFF_INITIAL_MS", default_value = "500")]
    pub backoff_initial_ms: u64,

    /// Maximum reconnect delay in seconds
    #[arg(long, env = "RITO_BACKOFF_MAX_SECS", default_value = "60")]
    pub backoff_max_secs: u64,

    /// Reconnect when no frame arrives for this many seconds
    #[arg(long, env = "RITO_IDLE_TIMEOUT_SECS", default_value = "120")]
    pub idle_timeout_secs: u64,

    /// Days to keep delete tombstones (0 keeps them forever)
    #[arg(long, env = "RITO_TOMBSTONE_RETENTION_DAYS", default_value = "7")]
    pub tombstone_retention_days: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "RITO_METRICS_PORT", default_value = "9091")]
    pub metrics_port: u16,
}

/// Enrichment configuration after parsing.
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub timeouts: EnrichTimeouts,
    pub blocklist_files: Vec<PathBuf>,
    pub blocked_domains: Vec<String>,
    pub plc_directory: String,
    pub policy: PolicyChoice,
}

impl From<&EnrichArgs> for EnrichConfig {
    fn from(args: &EnrichArgs) -> Self {
        Self {
            timeouts: EnrichTimeouts {
                ogp: Duration::from_millis(args.ogp_timeout_ms),
                handle: Duration::from_millis(args.handle_timeout_ms),
                moderation: Duration::from_millis(args.moderation_timeout_ms),
                verification: Duration::from_millis(args.verification_timeout_ms),
            },
            blocklist_files: args.blocklist_file.clone(),
            blocked_domains: args.blocked_domains.clone(),
            plc_directory: args.plc_directory.clone(),
            policy: args.verification_policy,
        }
    }
}

impl EnrichConfig {
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("ogp", self.timeouts.ogp),
            ("handle", self.timeouts.handle),
            ("moderation", self.timeouts.moderation),
            ("verification", self.timeouts.verification),
        ];
        for (step, limit) in timeouts {
            if limit.is_zero() {
                return Err(Error::Config(format!("{step} timeout must be positive")));
            }
        }

        let plc = url::Url::parse(&self.plc_directory)
            .map_err(|e| Error::Config(format!("invalid PLC directory: {e}")))?;
        if !matches!(plc.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "PLC directory must be http(s): {}",
                self.plc_directory
            )));
        }

        for path in &self.blocklist_files {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "blocklist file not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Load every blocklist source into one list.
    pub fn load_blocklist(&self) -> Result<Blocklist> {
        let mut blocklist = Blocklist::new(&self.blocked_domains);
        for path in &self.blocklist_files {
            blocklist.extend(Blocklist::from_file(path)?);
        }
        Ok(blocklist)
    }

    /// Build the production collaborators.
    pub fn build_enrichers(&self) -> Result<Enrichers> {
        let preview = HttpPreviewFetcher::new(self.timeouts.ogp)?;
        let handles = DidDocumentResolver::new(&self.plc_directory, self.timeouts.handle)?;
        let policy: Arc<dyn VerificationPolicy> = match self.policy {
            PolicyChoice::Never => Arc::new(NeverVerify),
            PolicyChoice::SameAuthor => Arc::new(SameAuthorPolicy),
        };

        Ok(Enrichers::new(Arc::new(preview), Arc::new(handles))
            .with_policy(policy)
            .with_blocklist(self.load_blocklist()?)
            .with_timeouts(self.timeouts))
    }
}

/// Everything the live daemon needs.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_path: PathBuf,
    pub jetstream: JetstreamConfig,
    pub checkpoint: CheckpointConfig,
    pub enrich: EnrichConfig,
    pub metrics_port: u16,
}

impl IngestConfig {
    pub fn from_args(store: &StoreArgs, jetstream: &JetstreamArgs, enrich: &EnrichArgs) -> Self {
        let defaults = JetstreamConfig::default();
        let retention = (jetstream.tombstone_retention_days > 0)
            .then(|| Duration::from_secs(jetstream.tombstone_retention_days * 24 * 60 * 60));

        Self {
            database_path: store.database_path.clone(),
            jetstream: JetstreamConfig {
                endpoints: jetstream.endpoints.clone().unwrap_or(defaults.endpoints),
                wanted_collections: jetstream
                    .collections
                    .clone()
                    .unwrap_or(defaults.wanted_collections),
                lookback: jetstream
                    .lookback_minutes
                    .map(|m| Duration::from_secs(m * 60)),
                reconnect: ReconnectConfig {
                    initial_delay: Duration::from_millis(jetstream.backoff_initial_ms),
                    max_delay: Duration::from_secs(jetstream.backoff_max_secs),
                    ..ReconnectConfig::default()
                },
                idle_timeout: Duration::from_secs(jetstream.idle_timeout_secs),
                ..defaults
            },
            checkpoint: CheckpointConfig {
                interval: Duration::from_secs(jetstream.checkpoint_interval_secs),
                tombstone_retention: retention,
                ..CheckpointConfig::default()
            },
            enrich: EnrichConfig::from(enrich),
            metrics_port: jetstream.metrics_port,
        }
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database path is empty".into()));
        }

        if self.jetstream.endpoints.is_empty() {
            return Err(Error::Config("at least one Jetstream endpoint is required".into()));
        }
        for endpoint in &self.jetstream.endpoints {
            let url = url::Url::parse(endpoint)
                .map_err(|e| Error::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(Error::Config(format!(
                    "endpoint must use ws:// or wss://: {endpoint}"
                )));
            }
        }

        if self.jetstream.wanted_collections.is_empty() {
            return Err(Error::Config("no collections selected".into()));
        }
        for collection in &self.jetstream.wanted_collections {
            if !TRACKED_COLLECTIONS.contains(&collection.as_str()) {
                return Err(Error::Config(format!(
                    "unsupported collection '{collection}' (expected one of {})",
                    TRACKED_COLLECTIONS.join(", ")
                )));
            }
        }

        let reconnect = &self.jetstream.reconnect;
        if reconnect.initial_delay.is_zero() {
            return Err(Error::Config("initial backoff must be positive".into()));
        }
        if reconnect.max_delay < reconnect.initial_delay {
            return Err(Error::Config(
                "maximum backoff is shorter than the initial backoff".into(),
            ));
        }
        if self.jetstream.idle_timeout.is_zero() {
            return Err(Error::Config("idle timeout must be positive".into()));
        }
        if self.checkpoint.interval.is_zero() {
            return Err(Error::Config("checkpoint interval must be positive".into()));
        }

        self.enrich.validate()
    }
}
