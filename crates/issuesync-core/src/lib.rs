//! Core domain model and record normalization for the global issue sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "issuesync-core";

/// Placeholder used when the search API omits the repository or author.
pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("credential pool is empty; configure GITHUB_TOKENS or GITHUB_PERSONAL_TOKEN")]
    EmptyCredentialPool,
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("item {issue_id}: missing {field}")]
    MissingTimestamp { issue_id: i64, field: &'static str },
    #[error("item {issue_id}: unparseable {field} {value:?}")]
    BadTimestamp {
        issue_id: i64,
        field: &'static str,
        value: String,
    },
    #[error("malformed search item: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchUser {
    pub login: String,
}

/// One raw entry of the `items` array returned by `GET /search/issues`.
///
/// Timestamps stay as strings here so a single bad value drops one record
/// instead of failing the whole page decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    pub id: i64,
    pub title: String,
    pub html_url: String,
    pub number: i64,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub user: Option<SearchUser>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Canonical issue shape handed from the fetcher to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub issue_id: i64,
    pub title: String,
    pub html_url: String,
    pub number: i64,
    pub repo_name: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

/// Persisted issue row. Timestamps are optional because rows written by
/// older schema versions may lack them; see `repair_missing_timestamps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIssue {
    pub issue_id: i64,
    pub title: String,
    pub html_url: String,
    pub number: i64,
    pub repo_name: String,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl StoredIssue {
    /// True when every field except `fetched_at` already matches `record`.
    pub fn same_content(&self, record: &IssueRecord) -> bool {
        self.issue_id == record.issue_id
            && self.title == record.title
            && self.html_url == record.html_url
            && self.number == record.number
            && self.repo_name == record.repo_name
            && self.author == record.author
            && self.created_at == Some(record.created_at)
            && self.updated_at == Some(record.updated_at)
    }

    pub fn is_missing_timestamps(&self) -> bool {
        self.created_at.is_none() || self.updated_at.is_none()
    }
}

impl From<IssueRecord> for StoredIssue {
    fn from(record: IssueRecord) -> Self {
        Self {
            issue_id: record.issue_id,
            title: record.title,
            html_url: record.html_url,
            number: record.number,
            repo_name: record.repo_name,
            author: record.author,
            created_at: Some(record.created_at),
            updated_at: Some(record.updated_at),
            fetched_at: Some(record.fetched_at),
        }
    }
}

/// `https://api.github.com/repos/owner/name` -> `owner/name`.
pub fn repo_full_name(repository_url: Option<&str>) -> String {
    let Some(url) = repository_url else {
        return UNKNOWN.to_string();
    };
    let segments = url
        .trim_end_matches('/')
        .rsplit('/')
        .take(2)
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .collect::<Vec<_>>();
    match segments.as_slice() {
        [name, owner] => format!("{owner}/{name}"),
        _ => UNKNOWN.to_string(),
    }
}

fn parse_timestamp(
    issue_id: i64,
    field: &'static str,
    value: Option<&str>,
) -> Result<DateTime<Utc>, NormalizeError> {
    let value = value.ok_or(NormalizeError::MissingTimestamp { issue_id, field })?;
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| NormalizeError::BadTimestamp {
            issue_id,
            field,
            value: value.to_string(),
        })
}

/// Map one raw search item into the canonical record observed at `fetched_at`.
pub fn normalize(item: &SearchItem, fetched_at: DateTime<Utc>) -> Result<IssueRecord, NormalizeError> {
    let created_at = parse_timestamp(item.id, "created_at", item.created_at.as_deref())?;
    let updated_at = parse_timestamp(item.id, "updated_at", item.updated_at.as_deref())?;
    Ok(IssueRecord {
        issue_id: item.id,
        title: item.title.clone(),
        html_url: item.html_url.clone(),
        number: item.number,
        repo_name: repo_full_name(item.repository_url.as_deref()),
        author: item
            .user
            .as_ref()
            .map(|u| u.login.clone())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        created_at,
        updated_at,
        fetched_at,
    })
}
