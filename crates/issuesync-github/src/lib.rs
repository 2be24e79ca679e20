//! GitHub search access: credential rotation, the HTTP search client and the
//! paginated fetch cycle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use issuesync_core::{normalize, ConfigError, IssueRecord, NormalizeError, SearchItem};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "issuesync-github";

/// Upper bound GitHub accepts for `per_page` on the search endpoint.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Available,
    Cooling,
}

#[derive(Clone)]
pub struct Credential {
    token: String,
    state: CredentialState,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> CredentialState {
        self.state
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("state", &self.state)
            .finish()
    }
}

/// Round-robin set of API tokens. Only the fetch cycle holding `&mut` rotates it.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    index: usize,
    rotations: u64,
}

impl CredentialPool {
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let credentials = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .map(|token| Credential {
                token,
                state: CredentialState::Available,
            })
            .collect::<Vec<_>>();
        if credentials.is_empty() {
            return Err(ConfigError::EmptyCredentialPool);
        }
        Ok(Self {
            credentials,
            index: 0,
            rotations: 0,
        })
    }

    pub fn acquire(&self) -> &Credential {
        &self.credentials[self.index]
    }

    /// Mark the current credential as cooling and move to the next one.
    pub fn rotate(&mut self) {
        self.credentials[self.index].state = CredentialState::Cooling;
        self.index = (self.index + 1) % self.credentials.len();
        self.rotations += 1;
    }

    pub fn size(&self) -> usize {
        self.credentials.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Cooling state is per cycle; the rotation index carries over.
    pub fn reset_cycle_state(&mut self) {
        for credential in &mut self.credentials {
            credential.state = CredentialState::Available;
        }
    }

    pub fn states(&self) -> Vec<CredentialState> {
        self.credentials.iter().map(|c| c.state).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub query: String,
    pub per_page: u32,
    pub page: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub incomplete_results: bool,
    /// Kept untyped so one malformed item drops alone.
    #[serde(default)]
    pub items: Vec<JsonValue>,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("rate limited (status {status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding search response: {0}")]
    Decode(String),
}

impl SearchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { status, .. } | Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode(_) => None,
        }
    }
}

/// One page of the search endpoint, authenticated with the given token.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search_page(&self, token: &str, request: &PageRequest) -> Result<SearchPage, SearchError>;
}

#[async_trait]
impl<T: SearchApi + ?Sized> SearchApi for Arc<T> {
    async fn search_page(&self, token: &str, request: &PageRequest) -> Result<SearchPage, SearchError> {
        (**self).search_page(token, request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Success,
    RateLimited,
    Hard,
}

/// GitHub signals rate limiting with 429, or with 403 plus either an
/// exhausted `x-ratelimit-remaining` or a `retry-after` (secondary limits).
pub fn classify_response(status: StatusCode, headers: &HeaderMap) -> ResponseDisposition {
    if status.is_success() {
        return ResponseDisposition::Success;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ResponseDisposition::RateLimited;
    }
    if status == StatusCode::FORBIDDEN {
        let exhausted = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0");
        if exhausted || headers.contains_key(RETRY_AFTER) {
            return ResponseDisposition::RateLimited;
        }
    }
    ResponseDisposition::Hard
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Pause before transport retry `retry` (0-based): doubles, then caps.
    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.base_delay.saturating_mul(1 << exponent).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "issuesync/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitHubSearchClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl GitHubSearchClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn search_url(&self) -> String {
        format!("{}/search/issues", self.base_url)
    }
}

#[async_trait]
impl SearchApi for GitHubSearchClient {
    async fn search_page(&self, token: &str, request: &PageRequest) -> Result<SearchPage, SearchError> {
        let url = self.search_url();
        let per_page = request.per_page.to_string();
        let page = request.page.to_string();

        // Only transport failures are retried here; rate limits belong to
        // the fetcher, which rotates credentials instead.
        let mut attempt = 0;
        let resp = loop {
            let sent = self
                .client
                .get(&url)
                .bearer_auth(token)
                .header(ACCEPT, "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28")
                .query(&[
                    ("q", request.query.as_str()),
                    ("per_page", per_page.as_str()),
                    ("page", page.as_str()),
                ])
                .send()
                .await;
            match sent {
                Ok(resp) => break resp,
                Err(err) if is_transient(&err) && attempt < self.backoff.max_retries => {
                    debug!(attempt, error = %err, "transient search failure, backing off");
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(SearchError::Request(err)),
            }
        };

        let status = resp.status();
        match classify_response(status, resp.headers()) {
            ResponseDisposition::Success => resp
                .json::<SearchPage>()
                .await
                .map_err(|err| SearchError::Decode(err.to_string())),
            ResponseDisposition::RateLimited => Err(SearchError::RateLimited {
                status: status.as_u16(),
                retry_after: retry_after(resp.headers()),
            }),
            ResponseDisposition::Hard => Err(SearchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            }),
        }
    }
}

/// Why a fetch cycle stopped requesting pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// All `max_pages` pages were fetched.
    Completed,
    /// A page came back empty.
    Exhausted,
    /// Every credential was rate limited on the same page.
    PoolExhausted,
    HardApiError { status: Option<u16>, message: String },
    DeadlineExceeded,
}

impl Termination {
    pub fn is_early(&self) -> bool {
        !matches!(self, Self::Completed | Self::Exhausted)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Exhausted => f.write_str("exhausted"),
            Self::PoolExhausted => f.write_str("pool_exhausted"),
            Self::HardApiError { message, .. } => write!(f, "hard_api_error: {message}"),
            Self::DeadlineExceeded => f.write_str("deadline_exceeded"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub page_size: u32,
    pub max_pages: u32,
    /// Pause between consecutive page requests.
    pub throttle: Duration,
    /// Pause before retrying a page with the next credential.
    pub retry_backoff: Duration,
    pub deadline: Option<Duration>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            max_pages: 5,
            throttle: Duration::from_secs(1),
            retry_backoff: Duration::ZERO,
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleFetch {
    pub records: Vec<IssueRecord>,
    pub termination: Termination,
    pub pages_fetched: u32,
    pub dropped_items: usize,
}

enum PageOutcome {
    Items(Vec<JsonValue>),
    PoolExhausted,
    Hard(SearchError),
    DeadlineExceeded,
}

async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

pub struct PaginatedFetcher<A> {
    api: A,
    config: FetcherConfig,
}

impl<A: SearchApi> PaginatedFetcher<A> {
    pub fn new(api: A, config: FetcherConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Fetch pages `1..=max_pages` in order, stopping early on an empty page,
    /// credential exhaustion, a hard API error or the cycle deadline.
    /// Completed pages are always returned.
    pub async fn run_cycle(&self, pool: &mut CredentialPool, query: &str) -> CycleFetch {
        pool.reset_cycle_state();
        // A deadline beyond the clock's range means no deadline at all.
        let deadline = self.config.deadline.and_then(|d| Instant::now().checked_add(d));
        let per_page = self.config.page_size.clamp(1, MAX_PAGE_SIZE);

        let mut records = Vec::new();
        let mut pages_fetched = 0;
        let mut dropped_items = 0;
        let mut termination = Termination::Completed;

        for page in 1..=self.config.max_pages {
            if page > 1
                && !self.config.throttle.is_zero()
                && within(deadline, tokio::time::sleep(self.config.throttle))
                    .await
                    .is_none()
            {
                termination = Termination::DeadlineExceeded;
                break;
            }

            let request = PageRequest {
                query: query.to_string(),
                per_page,
                page,
            };
            let outcome = self
                .fetch_page(pool, &request, deadline)
                .instrument(info_span!("search_page", page, per_page))
                .await;

            match outcome {
                PageOutcome::Items(items) if items.is_empty() => {
                    debug!(page, "empty page, stopping pagination");
                    termination = Termination::Exhausted;
                    break;
                }
                PageOutcome::Items(items) => {
                    pages_fetched += 1;
                    let fetched_at = Utc::now();
                    for raw in items {
                        match normalize_raw(raw, fetched_at) {
                            Ok(record) => records.push(record),
                            Err(err) => {
                                warn!(page, error = %err, "dropping search item");
                                dropped_items += 1;
                            }
                        }
                    }
                }
                PageOutcome::PoolExhausted => {
                    warn!(page, credentials = pool.size(), "all credentials rate limited");
                    termination = Termination::PoolExhausted;
                    break;
                }
                PageOutcome::Hard(err) => {
                    error!(page, error = %err, "search request failed");
                    termination = Termination::HardApiError {
                        status: err.status(),
                        message: err.to_string(),
                    };
                    break;
                }
                PageOutcome::DeadlineExceeded => {
                    warn!(page, "cycle deadline exceeded");
                    termination = Termination::DeadlineExceeded;
                    break;
                }
            }
        }

        CycleFetch {
            records,
            termination,
            pages_fetched,
            dropped_items,
        }
    }

    /// One page, retried with the next credential on each rate limit, at
    /// most `pool.size()` attempts.
    async fn fetch_page(
        &self,
        pool: &mut CredentialPool,
        request: &PageRequest,
        deadline: Option<Instant>,
    ) -> PageOutcome {
        for attempt in 0..pool.size() {
            if attempt > 0
                && !self.config.retry_backoff.is_zero()
                && within(deadline, tokio::time::sleep(self.config.retry_backoff))
                    .await
                    .is_none()
            {
                return PageOutcome::DeadlineExceeded;
            }

            let result = within(deadline, self.api.search_page(pool.acquire().token(), request)).await;
            match result {
                None => return PageOutcome::DeadlineExceeded,
                Some(Ok(page)) => return PageOutcome::Items(page.items),
                Some(Err(SearchError::RateLimited { status, retry_after })) => {
                    debug!(
                        attempt,
                        status,
                        retry_after = ?retry_after,
                        credential = pool.index(),
                        "rate limited, rotating credential"
                    );
                    pool.rotate();
                }
                Some(Err(err)) => return PageOutcome::Hard(err),
            }
        }
        PageOutcome::PoolExhausted
    }
}

fn normalize_raw(raw: JsonValue, fetched_at: chrono::DateTime<Utc>) -> Result<IssueRecord, NormalizeError> {
    let item: SearchItem =
        serde_json::from_value(raw).map_err(|err| NormalizeError::Malformed(err.to_string()))?;
    normalize(&item, fetched_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&str, u32, usize) -> Result<SearchPage, SearchError> + Send + Sync>;

    /// In-process stand-in for the search endpoint. The responder receives
    /// the token, the page number and how many times that page was asked for.
    struct ScriptedSearch {
        responder: Responder,
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl ScriptedSearch {
        fn new(
            responder: impl Fn(&str, u32, usize) -> Result<SearchPage, SearchError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }

        fn pages_requested(&self) -> Vec<u32> {
            let mut pages = self.calls().into_iter().map(|(_, p)| p).collect::<Vec<_>>();
            pages.dedup();
            pages
        }
    }

    #[async_trait]
    impl SearchApi for ScriptedSearch {
        async fn search_page(&self, token: &str, request: &PageRequest) -> Result<SearchPage, SearchError> {
            let seen = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((token.to_string(), request.page));
                calls.iter().filter(|(_, p)| *p == request.page).count()
            };
            (self.responder)(token, request.page, seen)
        }
    }

    fn item(id: i64) -> JsonValue {
        serde_json::json!({
            "id": id,
            "title": format!("issue {id}"),
            "html_url": format!("https://github.com/acme/widgets/issues/{id}"),
            "number": id,
            "repository_url": "https://api.github.com/repos/acme/widgets",
            "user": {"login": "octocat"},
            "created_at": "2026-10-01T00:00:00Z",
            "updated_at": "2026-10-17T00:00:00Z"
        })
    }

    fn page_of(ids: &[i64]) -> SearchPage {
        SearchPage {
            total_count: ids.len() as u64,
            incomplete_results: false,
            items: ids.iter().map(|id| item(*id)).collect(),
        }
    }

    fn rate_limited() -> SearchError {
        SearchError::RateLimited {
            status: 403,
            retry_after: None,
        }
    }

    fn config(page_size: u32, max_pages: u32) -> FetcherConfig {
        FetcherConfig {
            page_size,
            max_pages,
            throttle: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            deadline: None,
        }
    }

    #[test]
    fn empty_pool_is_a_config_error() {
        let err = CredentialPool::from_tokens(Vec::<String>::new()).unwrap_err();
        assert_eq!(err, ConfigError::EmptyCredentialPool);
        let err = CredentialPool::from_tokens(["", "  "]).unwrap_err();
        assert_eq!(err, ConfigError::EmptyCredentialPool);
    }

    #[test]
    fn rotation_wraps_and_marks_cooling() {
        let mut pool = CredentialPool::from_tokens(["a", "b", "c"]).unwrap();
        assert_eq!(pool.acquire().token(), "a");
        pool.rotate();
        pool.rotate();
        assert_eq!(pool.acquire().token(), "c");
        pool.rotate();
        assert_eq!(pool.acquire().token(), "a");
        assert_eq!(pool.rotations(), 3);
        assert!(pool.states().iter().all(|s| *s == CredentialState::Cooling));

        pool.reset_cycle_state();
        assert!(pool.states().iter().all(|s| *s == CredentialState::Available));
        assert_eq!(pool.acquire().token(), "a");
    }

    #[test]
    fn credential_debug_hides_the_token() {
        let pool = CredentialPool::from_tokens(["ghp_secret"]).unwrap();
        assert!(!format!("{pool:?}").contains("ghp_secret"));
    }

    #[test]
    fn transport_retry_delays_double_up_to_five_seconds() {
        let policy = BackoffPolicy::default();
        let delays = (0..6).map(|retry| policy.delay(retry).as_millis()).collect::<Vec<_>>();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000]);
        assert_eq!(policy.delay(usize::MAX), Duration::from_secs(5));
    }

    #[test]
    fn classifies_rate_limit_responses() {
        let empty = HeaderMap::new();
        assert_eq!(classify_response(StatusCode::OK, &empty), ResponseDisposition::Success);
        assert_eq!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, &empty),
            ResponseDisposition::RateLimited
        );
        assert_eq!(classify_response(StatusCode::FORBIDDEN, &empty), ResponseDisposition::Hard);

        let mut exhausted = HeaderMap::new();
        exhausted.insert("x-ratelimit-remaining", "0".parse().unwrap());
        assert_eq!(
            classify_response(StatusCode::FORBIDDEN, &exhausted),
            ResponseDisposition::RateLimited
        );
        let mut secondary = HeaderMap::new();
        secondary.insert(RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(
            classify_response(StatusCode::FORBIDDEN, &secondary),
            ResponseDisposition::RateLimited
        );
        assert_eq!(retry_after(&secondary), Some(Duration::from_secs(30)));

        assert_eq!(
            classify_response(StatusCode::UNPROCESSABLE_ENTITY, &empty),
            ResponseDisposition::Hard
        );
        assert_eq!(
            classify_response(StatusCode::BAD_GATEWAY, &empty),
            ResponseDisposition::Hard
        );
    }

    #[tokio::test]
    async fn pool_exhaustion_after_one_rotation_per_credential() {
        let api = ScriptedSearch::new(|_, _, _| Err(rate_limited()));
        let fetcher = PaginatedFetcher::new(api, config(10, 5));
        let mut pool = CredentialPool::from_tokens(["a", "b", "c"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "is:issue").await;

        assert_eq!(fetch.termination, Termination::PoolExhausted);
        assert_eq!(pool.rotations(), 3);
        assert!(fetch.records.is_empty());
        assert_eq!(fetcher.api().pages_requested(), vec![1]);
        assert_eq!(fetcher.api().calls().len(), 3);
    }

    #[tokio::test]
    async fn pool_exhaustion_keeps_completed_pages() {
        let api = ScriptedSearch::new(|_, page, _| match page {
            1 => Ok(page_of(&[1, 2])),
            _ => Err(rate_limited()),
        });
        let fetcher = PaginatedFetcher::new(api, config(2, 5));
        let mut pool = CredentialPool::from_tokens(["a", "b"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "is:issue").await;

        assert_eq!(fetch.termination, Termination::PoolExhausted);
        assert_eq!(fetch.records.len(), 2);
        assert_eq!(fetch.pages_fetched, 1);
    }

    #[tokio::test]
    async fn empty_page_short_circuits_pagination() {
        let api = ScriptedSearch::new(|_, page, _| match page {
            1 => Ok(page_of(&[1, 2])),
            2 => Ok(page_of(&[3, 4])),
            3 => Ok(page_of(&[])),
            _ => Ok(page_of(&[99])),
        });
        let fetcher = PaginatedFetcher::new(api, config(2, 5));
        let mut pool = CredentialPool::from_tokens(["a"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "is:issue").await;

        assert_eq!(fetch.termination, Termination::Exhausted);
        let ids = fetch.records.iter().map(|r| r.issue_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(fetcher.api().pages_requested(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn hard_error_aborts_but_keeps_earlier_pages() {
        let api = ScriptedSearch::new(|_, page, _| match page {
            1 => Ok(page_of(&[1])),
            _ => Err(SearchError::HttpStatus {
                status: 422,
                url: "https://api.github.com/search/issues".into(),
            }),
        });
        let fetcher = PaginatedFetcher::new(api, config(1, 5));
        let mut pool = CredentialPool::from_tokens(["a", "b"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "is:issue").await;

        assert!(matches!(
            fetch.termination,
            Termination::HardApiError { status: Some(422), .. }
        ));
        assert_eq!(fetch.records.len(), 1);
        assert_eq!(pool.rotations(), 0);
        assert_eq!(fetcher.api().pages_requested(), vec![1, 2]);
    }

    #[tokio::test]
    async fn malformed_items_are_dropped_individually() {
        let api = ScriptedSearch::new(|_, _, _| {
            let mut page = page_of(&[1, 2]);
            page.items.push(serde_json::json!({"id": 3, "title": "no url"}));
            let mut bad_ts = item(4);
            bad_ts["updated_at"] = serde_json::json!("not a date");
            page.items.push(bad_ts);
            Ok(page)
        });
        let fetcher = PaginatedFetcher::new(api, config(4, 1));
        let mut pool = CredentialPool::from_tokens(["a"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "is:issue").await;

        assert_eq!(fetch.termination, Termination::Completed);
        assert_eq!(fetch.records.len(), 2);
        assert_eq!(fetch.dropped_items, 2);
    }

    #[tokio::test]
    async fn rate_limited_page_is_retried_with_the_next_credential() {
        let api = ScriptedSearch::new(|token, page, _| match (page, token) {
            (1, _) => Ok(page_of(&[1, 2])),
            (2, "token-a") => Err(rate_limited()),
            (2, "token-b") => Ok(page_of(&[3])),
            _ => Ok(page_of(&[])),
        });
        let fetcher = PaginatedFetcher::new(api, config(2, 2));
        let mut pool = CredentialPool::from_tokens(["token-a", "token-b"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "is:issue is:open").await;

        assert_eq!(fetch.termination, Termination::Completed);
        assert_eq!(fetch.records.len(), 3);
        assert_eq!(pool.rotations(), 1);
        assert_eq!(
            fetcher.api().calls(),
            vec![
                ("token-a".to_string(), 1),
                ("token-a".to_string(), 2),
                ("token-b".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn rotation_index_persists_across_cycles() {
        let api = ScriptedSearch::new(|token, _, _| match token {
            "a" => Err(rate_limited()),
            _ => Ok(page_of(&[1])),
        });
        let fetcher = PaginatedFetcher::new(api, config(1, 1));
        let mut pool = CredentialPool::from_tokens(["a", "b"]).unwrap();

        fetcher.run_cycle(&mut pool, "q").await;
        assert_eq!(pool.acquire().token(), "b");
        let fetch = fetcher.run_cycle(&mut pool, "q").await;
        assert_eq!(fetch.termination, Termination::Completed);
        assert_eq!(pool.rotations(), 1);
        assert_eq!(pool.acquire().state(), CredentialState::Available);
    }

    struct HangingSearch;

    #[async_trait]
    impl SearchApi for HangingSearch {
        async fn search_page(&self, _token: &str, _request: &PageRequest) -> Result<SearchPage, SearchError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_the_in_flight_request() {
        let fetcher = PaginatedFetcher::new(
            HangingSearch,
            FetcherConfig {
                deadline: Some(Duration::from_secs(5)),
                ..config(10, 5)
            },
        );
        let mut pool = CredentialPool::from_tokens(["a"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "q").await;

        assert_eq!(fetch.termination, Termination::DeadlineExceeded);
        assert!(fetch.records.is_empty());
    }

    /// Records the paused-clock offset of every request.
    struct TimedSearch {
        inner: ScriptedSearch,
        started: Instant,
        offsets: Mutex<Vec<Duration>>,
    }

    impl TimedSearch {
        fn new(inner: ScriptedSearch) -> Self {
            Self {
                inner,
                started: Instant::now(),
                offsets: Mutex::new(Vec::new()),
            }
        }

        fn offsets(&self) -> Vec<Duration> {
            self.offsets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SearchApi for TimedSearch {
        async fn search_page(&self, token: &str, request: &PageRequest) -> Result<SearchPage, SearchError> {
            self.offsets.lock().unwrap().push(self.started.elapsed());
            self.inner.search_page(token, request).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_pages_but_not_the_first_request() {
        let api = TimedSearch::new(ScriptedSearch::new(|_, page, _| Ok(page_of(&[i64::from(page)]))));
        let fetcher = PaginatedFetcher::new(
            api,
            FetcherConfig {
                throttle: Duration::from_secs(1),
                ..config(1, 3)
            },
        );
        let mut pool = CredentialPool::from_tokens(["a"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "q").await;

        assert_eq!(fetch.termination, Termination::Completed);
        assert_eq!(fetch.records.len(), 3);
        let offsets = fetcher.api().offsets();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[0], Duration::ZERO);
        assert!(offsets[1] >= Duration::from_secs(1));
        assert!(offsets[2] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backoff_precedes_the_rotated_attempt() {
        let api = TimedSearch::new(ScriptedSearch::new(|token, _, _| match token {
            "a" => Err(rate_limited()),
            _ => Ok(page_of(&[1])),
        }));
        let fetcher = PaginatedFetcher::new(
            api,
            FetcherConfig {
                retry_backoff: Duration::from_millis(500),
                ..config(1, 1)
            },
        );
        let mut pool = CredentialPool::from_tokens(["a", "b"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "q").await;

        assert_eq!(fetch.termination, Termination::Completed);
        assert_eq!(pool.rotations(), 1);
        let offsets = fetcher.api().offsets();
        assert_eq!(offsets[0], Duration::ZERO);
        assert!(offsets[1] >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn unrepresentable_deadline_means_no_deadline() {
        let api = ScriptedSearch::new(|_, _, _| Ok(page_of(&[1])));
        let fetcher = PaginatedFetcher::new(
            api,
            FetcherConfig {
                deadline: Some(Duration::from_secs(u64::MAX)),
                ..config(1, 2)
            },
        );
        let mut pool = CredentialPool::from_tokens(["a"]).unwrap();

        let fetch = fetcher.run_cycle(&mut pool, "q").await;

        assert_eq!(fetch.termination, Termination::Completed);
        assert_eq!(fetch.pages_fetched, 2);
    }

    #[tokio::test]
    async fn github_client_maps_http_responses() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/search/issues")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("q".into(), "is:issue is:open".into()),
                mockito::Matcher::UrlEncoded("page".into(), "1".into()),
                mockito::Matcher::UrlEncoded("per_page".into(), "2".into()),
            ]))
            .match_header("authorization", "Bearer token-a")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "total_count": 1,
                    "incomplete_results": false,
                    "items": [item(7)]
                })
                .to_string(),
            )
            .create_async()
            .await;
        let limited = server
            .mock("GET", "/search/issues")
            .match_query(mockito::Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(403)
            .with_header("x-ratelimit-remaining", "0")
            .create_async()
            .await;
        let invalid = server
            .mock("GET", "/search/issues")
            .match_query(mockito::Matcher::UrlEncoded("page".into(), "3".into()))
            .with_status(422)
            .create_async()
            .await;

        let client = GitHubSearchClient::new(HttpClientConfig {
            base_url: server.url(),
            ..Default::default()
        })
        .unwrap();
        let request = |page| PageRequest {
            query: "is:issue is:open".into(),
            per_page: 2,
            page,
        };

        let page = client.search_page("token-a", &request(1)).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(matches!(
            client.search_page("token-a", &request(2)).await,
            Err(SearchError::RateLimited { status: 403, .. })
        ));
        assert!(matches!(
            client.search_page("token-a", &request(3)).await,
            Err(SearchError::HttpStatus { status: 422, .. })
        ));

        ok.assert_async().await;
        limited.assert_async().await;
        invalid.assert_async().await;
    }
}
