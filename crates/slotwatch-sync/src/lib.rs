//! Watch pipeline orchestration: extract, reconcile, publish, remember.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotwatch_adapters::{
    FixtureExtractor, IdentityMode, KeywordSectionExtractor, SlotExtractor, WatchTarget,
};
use slotwatch_core::{reconcile, RecordSet, SeenPolicy};
use slotwatch_feed::{
    merge, parse_entries, synthesize_entry, ChannelInfo, NotificationEntry, DEFAULT_MAX_ENTRIES,
    DEFAULT_TTL_MINUTES,
};
use slotwatch_storage::{FeedStore, HttpClientConfig, HttpFetcher, SeenStateStore};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "slotwatch-sync";

pub const DEFAULT_CONFIG_PATH: &str = "slotwatch.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: &'static str, value: String },
    #[error("source_url must not be empty")]
    MissingSourceUrl,
    #[error("no watch targets configured")]
    NoTargets,
    #[error("target {label:?} needs at least one non-blank keyword")]
    EmptyKeywords { label: String },
    #[error("duplicate target label {0:?}")]
    DuplicateLabel(String),
    #[error("max_entries must be at least 1")]
    ZeroMaxEntries,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSettings {
    #[serde(default = "default_feed_title")]
    pub title: String,
    #[serde(default = "default_feed_description")]
    pub description: String,
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            title: default_feed_title(),
            description: default_feed_description(),
            ttl_minutes: default_ttl_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_feed_title() -> String {
    "Booking Slot Monitor".to_string()
}

fn default_feed_description() -> String {
    "Newly published booking slots".to_string()
}

fn default_ttl_minutes() -> u32 {
    DEFAULT_TTL_MINUTES
}

fn default_user_agent() -> String {
    "slotwatch/0.1".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_state_file() -> PathBuf {
    PathBuf::from("seen_dates.json")
}

fn default_feed_file() -> PathBuf {
    PathBuf::from("feed.xml")
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub source_url: String,
    pub targets: Vec<WatchTarget>,
    #[serde(default)]
    pub feed: FeedSettings,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_feed_file")]
    pub feed_file: PathBuf,
    #[serde(default)]
    pub seen_policy: SeenPolicy,
    #[serde(default)]
    pub http: HttpSettings,
    /// Read this saved page instead of fetching `source_url`.
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

impl WatchConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// `explicit`, else `$SLOTWATCH_CONFIG`, else `slotwatch.yaml`.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var("SLOTWATCH_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load the resolved config file and apply `SLOTWATCH_*` overrides from
    /// the process environment.
    pub fn from_env(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with(&Self::resolve_path(explicit), |key| std::env::var(key).ok())
    }

    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SLOTWATCH_SOURCE_URL") {
            self.source_url = v;
        }
        if let Some(v) = lookup("SLOTWATCH_STATE_FILE") {
            self.state_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLOTWATCH_FEED_FILE") {
            self.feed_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLOTWATCH_FIXTURE") {
            self.fixture_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SLOTWATCH_USER_AGENT") {
            self.http.user_agent = v;
        }
        if let Some(v) = lookup("SLOTWATCH_MAX_ENTRIES") {
            self.max_entries = v.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                key: "SLOTWATCH_MAX_ENTRIES",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("SLOTWATCH_HTTP_TIMEOUT_SECS") {
            self.http.timeout_secs =
                v.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                    key: "SLOTWATCH_HTTP_TIMEOUT_SECS",
                    value: v.clone(),
                })?;
        }
        if let Some(v) = lookup("SLOTWATCH_SEEN_POLICY") {
            self.seen_policy =
                SeenPolicy::from_name(&v).ok_or_else(|| ConfigError::InvalidOverride {
                    key: "SLOTWATCH_SEEN_POLICY",
                    value: v.clone(),
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_url.trim().is_empty() {
            return Err(ConfigError::MissingSourceUrl);
        }
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let mut labels = HashSet::new();
        for target in &self.targets {
            if target.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(ConfigError::EmptyKeywords {
                    label: target.label.clone(),
                });
            }
            if !labels.insert(target.label.trim()) {
                return Err(ConfigError::DuplicateLabel(target.label.clone()));
            }
        }
        if self.max_entries == 0 {
            return Err(ConfigError::ZeroMaxEntries);
        }
        Ok(())
    }

    /// Activity labels join the record identity once more than one activity
    /// is watched.
    pub fn identity_mode(&self) -> IdentityMode {
        if self.targets.len() > 1 {
            IdentityMode::WithActivity
        } else {
            IdentityMode::DateOnly
        }
    }

    pub fn channel(&self) -> ChannelInfo {
        ChannelInfo {
            title: self.feed.title.clone(),
            description: self.feed.description.clone(),
            link: self.source_url.clone(),
            ttl_minutes: self.feed.ttl_minutes,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs),
            user_agent: Some(self.http.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetch_failed: bool,
    pub current_slots: usize,
    pub new_slots: Vec<String>,
    pub feed_written: bool,
    pub feed_entries: usize,
    pub feed_repairs: usize,
    pub seen_saved: bool,
}

#[derive(Debug, Clone, Copy)]
struct FeedOutcome {
    written: bool,
    entries: usize,
    repairs: usize,
}

pub struct WatchPipeline {
    config: WatchConfig,
    seen: SeenStateStore,
    feed: FeedStore,
    extractor: Box<dyn SlotExtractor>,
}

impl WatchPipeline {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let extractor: Box<dyn SlotExtractor> = match &config.fixture_path {
            Some(path) => Box::new(FixtureExtractor::new(path.clone())),
            None => {
                let http = HttpFetcher::new(config.http_client_config())?;
                Box::new(KeywordSectionExtractor::new(http, config.source_url.clone()))
            }
        };
        Ok(Self {
            seen: SeenStateStore::new(config.state_file.clone()),
            feed: FeedStore::new(config.feed_file.clone()),
            config,
            extractor,
        })
    }

    pub fn with_extractor(mut self, extractor: Box<dyn SlotExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_at(Utc::now()).await
    }

    /// One polling pass stamped with `now`.
    ///
    /// A failed extraction announces nothing and leaves the seen-state alone;
    /// the feed is still created if it does not exist yet.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let identity = self.config.identity_mode();
        let current = match self.extractor.fetch_all(&self.config.targets, identity).await {
            Ok(current) => current,
            Err(err) => {
                warn!(
                    extractor = self.extractor.name(),
                    error = %err,
                    "extraction failed; no novelty this run"
                );
                let feed = self.publish(None, now).await?;
                return Ok(RunSummary {
                    started_at: now,
                    finished_at: Utc::now(),
                    fetch_failed: true,
                    current_slots: 0,
                    new_slots: Vec::new(),
                    feed_written: feed.written,
                    feed_entries: feed.entries,
                    feed_repairs: feed.repairs,
                    seen_saved: false,
                });
            }
        };

        let seen = self.seen.load().await;
        let new = reconcile(&current, &seen);
        if new.is_empty() {
            info!(current = current.len(), seen = seen.len(), "no new slots this run");
        } else {
            info!(current = current.len(), new = new.len(), "found new slots");
        }

        let entry = synthesize_entry(&new, &self.config.source_url, now);
        let feed = self.publish(entry.as_ref(), now).await?;

        let next_seen = self.config.seen_policy.next_seen(&seen, &current);
        self.seen.save(&next_seen).await?;
        debug!(
            path = %self.seen.path().display(),
            policy = self.config.seen_policy.as_str(),
            records = next_seen.len(),
            "seen-state saved"
        );

        Ok(RunSummary {
            started_at: now,
            finished_at: Utc::now(),
            fetch_failed: false,
            current_slots: current.len(),
            new_slots: new.to_strings(),
            feed_written: feed.written,
            feed_entries: feed.entries,
            feed_repairs: feed.repairs,
            seen_saved: true,
        })
    }

    /// Rewrite the feed when there is something to add, when it does not
    /// exist yet, or when the stored copy needs repair or trimming.
    async fn publish(&self, entry: Option<&NotificationEntry>, now: DateTime<Utc>) -> Result<FeedOutcome> {
        let existing = self.feed.read().await?;
        let merged = merge(
            existing.as_deref(),
            entry,
            &self.config.channel(),
            self.config.max_entries,
            now,
        );
        if merged.repairs > 0 {
            warn!(
                path = %self.feed.path().display(),
                repairs = merged.repairs,
                "rebalanced malformed feed entries"
            );
        }
        if merged.envelope_repaired {
            warn!(path = %self.feed.path().display(), "feed envelope is broken; rebuilding");
        }

        let must_write = entry.is_some()
            || existing.is_none()
            || merged.repairs > 0
            || merged.envelope_repaired
            || merged.evicted > 0;
        if !must_write {
            debug!(path = %self.feed.path().display(), "feed unchanged");
            return Ok(FeedOutcome {
                written: false,
                entries: merged.entry_count,
                repairs: 0,
            });
        }

        self.feed.write(&merged.document).await?;
        info!(
            path = %self.feed.path().display(),
            entries = merged.entry_count,
            "feed written"
        );
        Ok(FeedOutcome {
            written: true,
            entries: merged.entry_count,
            repairs: merged.repairs,
        })
    }
}

/// Markdown overview of the persisted seen-state and feed.
pub async fn status_report(config: &WatchConfig) -> Result<String> {
    let seen = SeenStateStore::new(config.state_file.clone()).load().await;
    let feed = FeedStore::new(config.feed_file.clone()).read().await?;

    let labels = config
        .targets
        .iter()
        .map(|t| t.label.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut lines = vec![
        "# slotwatch status".to_string(),
        String::new(),
        format!("- source: {}", config.source_url),
        format!("- targets: {labels}"),
        format!("- seen policy: {}", config.seen_policy.as_str()),
        String::new(),
        format!("## Seen slots ({})", seen.len()),
    ];
    lines.extend(seen.iter().map(|r| format!("- {r}")));
    lines.push(String::new());
    lines.push(format!("## Feed `{}`", config.feed_file.display()));

    match feed {
        None => lines.push("- not written yet".to_string()),
        Some(doc) => {
            let parsed = parse_entries(&doc);
            if parsed.entries.is_empty() {
                lines.push("- no entries".to_string());
            }
            for entry in &parsed.entries {
                lines.push(format!(
                    "- {} | {} | {}",
                    entry.guid().unwrap_or_else(|| "?".into()),
                    entry.title().unwrap_or_else(|| "(untitled)".into()),
                    entry.pub_date().unwrap_or_else(|| "?".into()),
                ));
            }
            if parsed.repairs > 0 {
                lines.push(format!(
                    "- {} malformed entries will be repaired on next write",
                    parsed.repairs
                ));
            }
            if !parsed.envelope_intact {
                lines.push("- channel envelope is broken; it will be rebuilt on next run".to_string());
            }
        }
    }

    Ok(lines.join("\n"))
}

/// Records the seen-state currently holds; used by `status --json`.
pub async fn load_seen(config: &WatchConfig) -> RecordSet {
    SeenStateStore::new(config.state_file.clone()).load().await
}
