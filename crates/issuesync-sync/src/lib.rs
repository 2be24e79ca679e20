//! Sync pipeline orchestration: configuration, the fetch → apply → evict
//! cycle, the single-flight scheduler and issue triage.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use issuesync_core::ConfigError;
use issuesync_github::{
    CredentialPool, FetcherConfig, GitHubSearchClient, HttpClientConfig, PaginatedFetcher, SearchApi,
    Termination, MAX_PAGE_SIZE,
};
use issuesync_storage::{IssueStore, DEFAULT_RETENTION_DAYS};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod scheduler;
pub mod triage;

pub use scheduler::{CycleScheduler, SchedulerDrivers, TriggerOutcome};

pub const CRATE_NAME: &str = "issuesync-sync";

pub const DEFAULT_QUERY: &str = "is:issue is:open sort:updated-desc";

/// GitHub search stops at 1000 results, i.e. 10 pages of 100.
pub const MAX_PAGES: u32 = 10;
pub const MAX_RETENTION_DAYS: i64 = 3650;
pub const MAX_DEADLINE_SECS: u64 = 86_400;
pub const MAX_HEARTBEAT_SECS: u64 = 86_400;
const MAX_PAUSE_MS: u64 = 600_000;

#[derive(Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub tokens: Vec<String>,
    pub api_base_url: String,
    pub query: String,
    pub per_page: u32,
    pub max_pages: u32,
    pub throttle: Duration,
    pub retry_backoff: Duration,
    pub cycle_deadline: Option<Duration>,
    pub retention_days: i64,
    pub heartbeat: Duration,
    pub refresh_cron: Option<String>,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openrouter_url: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("tokens", &format_args!("<{} redacted>", self.tokens.len()))
            .field("api_base_url", &self.api_base_url)
            .field("query", &self.query)
            .field("per_page", &self.per_page)
            .field("max_pages", &self.max_pages)
            .field("throttle", &self.throttle)
            .field("retry_backoff", &self.retry_backoff)
            .field("cycle_deadline", &self.cycle_deadline)
            .field("retention_days", &self.retention_days)
            .field("heartbeat", &self.heartbeat)
            .field("refresh_cron", &self.refresh_cron)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("web_port", &self.web_port)
            .field("openrouter", &self.openrouter_api_key.is_some())
            .finish()
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        _ => Ok(default),
    }
}

/// Like [`parse_var`], but values outside `range` are rejected too.
fn parse_bounded<T: FromStr + PartialOrd>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError> {
    let value = parse_var(lookup, key, default)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key,
            value: lookup(key).unwrap_or_default().trim().to_string(),
        })
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some("1" | "true" | "TRUE" | "True" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "False" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key,
            value: other.to_string(),
        }),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let tokens = non_empty("GITHUB_TOKENS")
            .or_else(|| non_empty("GITHUB_PERSONAL_TOKEN"))
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let deadline_secs: u64 =
            parse_bounded(&lookup, "ISSUESYNC_CYCLE_DEADLINE_SECS", 120, 0..=MAX_DEADLINE_SECS)?;
        let heartbeat_secs: u64 =
            parse_bounded(&lookup, "ISSUESYNC_HEARTBEAT_SECS", 50, 1..=MAX_HEARTBEAT_SECS)?;
        let refresh_cron = match lookup("ISSUESYNC_REFRESH_CRON") {
            None => Some("0 0 */6 * * *".to_string()),
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v.trim().to_string()),
        };

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            tokens,
            api_base_url: non_empty("GITHUB_API_URL")
                .unwrap_or_else(|| "https://api.github.com".to_string()),
            query: non_empty("ISSUESYNC_QUERY").unwrap_or_else(|| DEFAULT_QUERY.to_string()),
            per_page: parse_var(&lookup, "ISSUESYNC_PER_PAGE", MAX_PAGE_SIZE)?.clamp(1, MAX_PAGE_SIZE),
            max_pages: parse_bounded(&lookup, "ISSUESYNC_MAX_PAGES", 5, 1..=MAX_PAGES)?,
            throttle: Duration::from_millis(parse_bounded(
                &lookup,
                "ISSUESYNC_THROTTLE_MS",
                1000,
                0..=MAX_PAUSE_MS,
            )?),
            retry_backoff: Duration::from_millis(parse_bounded(
                &lookup,
                "ISSUESYNC_RETRY_BACKOFF_MS",
                0,
                0..=MAX_PAUSE_MS,
            )?),
            cycle_deadline: (deadline_secs > 0).then(|| Duration::from_secs(deadline_secs)),
            retention_days: parse_bounded(
                &lookup,
                "ISSUESYNC_RETENTION_DAYS",
                DEFAULT_RETENTION_DAYS,
                1..=MAX_RETENTION_DAYS,
            )?,
            heartbeat: Duration::from_secs(heartbeat_secs),
            refresh_cron,
            scheduler_enabled: parse_flag(&lookup, "ISSUESYNC_SCHEDULER_ENABLED", true)?,
            user_agent: non_empty("ISSUESYNC_USER_AGENT").unwrap_or_else(|| "issuesync/0.1".to_string()),
            http_timeout_secs: parse_bounded(
                &lookup,
                "ISSUESYNC_HTTP_TIMEOUT_SECS",
                20,
                1..=MAX_DEADLINE_SECS,
            )?,
            web_port: parse_var(&lookup, "ISSUESYNC_WEB_PORT", 5000)?,
            openrouter_api_key: non_empty("OPENROUTER_API_KEY"),
            openrouter_model: non_empty("OPENROUTER_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openrouter_url: non_empty("OPENROUTER_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1/chat/completions".to_string()),
        })
    }

    pub fn credential_pool(&self) -> Result<CredentialPool, ConfigError> {
        CredentialPool::from_tokens(&self.tokens)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            page_size: self.per_page,
            max_pages: self.max_pages,
            throttle: self.throttle,
            retry_backoff: self.retry_backoff,
            deadline: self.cycle_deadline,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.api_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Heartbeat,
    Refresh,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Heartbeat => "heartbeat",
            Self::Refresh => "refresh",
            Self::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub termination: Termination,
    pub pages_fetched: u32,
    pub fetched: usize,
    pub dropped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub evicted: u64,
    pub rotations: u64,
}

/// One fetch cycle end to end. Owns the credential pool so rotation state
/// is threaded through cycles explicitly.
pub struct SyncPipeline {
    query: String,
    retention: chrono::Duration,
    fetcher: PaginatedFetcher<Arc<dyn SearchApi>>,
    pool: Mutex<CredentialPool>,
    store: Arc<dyn IssueStore>,
}

impl SyncPipeline {
    pub fn new(
        api: Arc<dyn SearchApi>,
        pool: CredentialPool,
        fetcher_config: FetcherConfig,
        store: Arc<dyn IssueStore>,
    ) -> Self {
        Self {
            query: DEFAULT_QUERY.to_string(),
            retention: chrono::Duration::days(DEFAULT_RETENTION_DAYS),
            fetcher: PaginatedFetcher::new(api, fetcher_config),
            pool: Mutex::new(pool),
            store,
        }
    }

    pub fn from_config(config: &SyncConfig, store: Arc<dyn IssueStore>) -> Result<Self> {
        let pool = config.credential_pool().context("loading GitHub credentials")?;
        let client = GitHubSearchClient::new(config.http_client_config())?;
        Ok(Self::new(Arc::new(client), pool, config.fetcher_config(), store)
            .with_query(config.query.clone())
            .with_retention(config.retention()))
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<dyn IssueStore> {
        &self.store
    }

    pub async fn rotations(&self) -> u64 {
        self.pool.lock().await.rotations()
    }

    pub async fn run_cycle(&self, trigger: TriggerSource) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id, %trigger);
        self.run_cycle_inner(cycle_id, trigger).instrument(span).await
    }

    async fn run_cycle_inner(&self, cycle_id: Uuid, trigger: TriggerSource) -> CycleReport {
        let started_at = Utc::now();

        // Only the scheduler's winning trigger reaches this point, so the
        // pool lock is never contended.
        let (fetch, rotations) = {
            let mut pool = self.pool.lock().await;
            let before = pool.rotations();
            let fetch = self.fetcher.run_cycle(&mut pool, &self.query).await;
            (fetch, pool.rotations() - before)
        };

        let applied = self.store.apply(&fetch.records).await;
        let evicted = match self.store.evict_stale(self.retention).await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "evicting stale issues failed");
                0
            }
        };

        let report = CycleReport {
            cycle_id,
            trigger,
            started_at,
            finished_at: Utc::now(),
            termination: fetch.termination,
            pages_fetched: fetch.pages_fetched,
            fetched: fetch.records.len(),
            dropped: fetch.dropped_items,
            inserted: applied.inserted,
            updated: applied.updated,
            unchanged: applied.unchanged,
            failed: applied.failed.len(),
            evicted,
            rotations,
        };

        match &report.termination {
            Termination::Completed | Termination::Exhausted => info!(
                termination = %report.termination,
                pages = report.pages_fetched,
                fetched = report.fetched,
                inserted = report.inserted,
                updated = report.updated,
                evicted = report.evicted,
                "sync cycle finished"
            ),
            Termination::PoolExhausted | Termination::DeadlineExceeded => warn!(
                termination = %report.termination,
                pages = report.pages_fetched,
                fetched = report.fetched,
                "sync cycle ended early; partial results stored"
            ),
            Termination::HardApiError { .. } => error!(
                termination = %report.termination,
                pages = report.pages_fetched,
                fetched = report.fetched,
                "sync cycle aborted; earlier pages stored"
            ),
        }
        report
    }
}

/// Build a pipeline from the environment and run a single cycle.
pub async fn run_sync_once_from_env() -> Result<CycleReport> {
    let config = SyncConfig::from_env()?;
    let store = issuesync_storage::open_store(config.database_url.as_deref()).await?;
    let pipeline = SyncPipeline::from_config(&config, store)?;
    Ok(pipeline.run_cycle(TriggerSource::Manual).await)
}
