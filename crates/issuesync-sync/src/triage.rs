//! Issue triage: assign a developer and priority to a small batch of issues,
//! through a remote chat-completions model when configured and a
//! deterministic round robin otherwise.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use issuesync_core::StoredIssue;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::SyncConfig;

/// Largest batch handed to a classifier in one call.
pub const TRIAGE_BATCH_LIMIT: usize = 5;

const DEVELOPERS: [&str; 3] = ["Dev1", "Dev2", "Dev3"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriageInput {
    pub title: String,
    pub repo: String,
    pub body: Option<String>,
}

impl From<&StoredIssue> for TriageInput {
    fn from(issue: &StoredIssue) -> Self {
        Self {
            title: issue.title.clone(),
            repo: issue.repo_name.clone(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub issue_title: String,
    pub repo: String,
    pub assigned_dev: String,
    pub priority: Priority,
}

#[async_trait]
pub trait IssueClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` means the classifier could not produce an answer and the
    /// caller should fall back.
    async fn classify(&self, issues: &[TriageInput]) -> Option<Vec<Assignment>>;
}

/// Assigns `Dev1..Dev3` and `high/medium/low` by position.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinClassifier;

impl RoundRobinClassifier {
    pub fn assign(&self, issues: &[TriageInput]) -> Vec<Assignment> {
        const PRIORITIES: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
        issues
            .iter()
            .enumerate()
            .map(|(i, issue)| Assignment {
                issue_title: issue.title.clone(),
                repo: issue.repo.clone(),
                assigned_dev: DEVELOPERS[i % DEVELOPERS.len()].to_string(),
                priority: PRIORITIES[i % PRIORITIES.len()],
            })
            .collect()
    }
}

#[async_trait]
impl IssueClassifier for RoundRobinClassifier {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    async fn classify(&self, issues: &[TriageInput]) -> Option<Vec<Assignment>> {
        Some(self.assign(issues))
    }
}

#[derive(Debug, Clone)]
pub struct RemoteClassifierConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

/// OpenRouter-compatible chat completions classifier.
pub struct RemoteClassifier {
    client: reqwest::Client,
    config: RemoteClassifierConfig,
}

impl RemoteClassifier {
    pub fn new(config: RemoteClassifierConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building triage HTTP client")?;
        Ok(Self { client, config })
    }

    fn prompt(issues: &[TriageInput]) -> String {
        let listing = serde_json::to_string_pretty(issues).unwrap_or_else(|_| "[]".to_string());
        format!(
            "You are a project manager triaging GitHub issues.\n\
             For each issue, assign:\n\
             - a \"priority\" (high, medium, or low)\n\
             - a \"developer\" (Dev1, Dev2, or Dev3) based on the issue's complexity or title\n\n\
             Return only valid JSON in this format:\n\
             [{{\"issue_title\": \"...\", \"repo\": \"...\", \"assigned_dev\": \"...\", \"priority\": \"high/medium/low\"}}]\n\n\
             Here are the issues:\n{listing}\n"
        )
    }

    async fn request(&self, issues: &[TriageInput]) -> Result<String> {
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": Self::prompt(issues)}],
        });
        let response: JsonValue = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("sending triage request")?
            .error_for_status()
            .context("triage request rejected")?
            .json()
            .await
            .context("decoding triage response")?;
        response
            .pointer("/choices/0/message/content")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .context("triage response has no message content")
    }
}

/// Models often wrap JSON in a markdown fence.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[async_trait]
impl IssueClassifier for RemoteClassifier {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn classify(&self, issues: &[TriageInput]) -> Option<Vec<Assignment>> {
        let content = match self.request(issues).await {
            Ok(content) => content,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "remote triage failed");
                return None;
            }
        };
        match serde_json::from_str::<Vec<Assignment>>(strip_code_fence(&content)) {
            Ok(assignments) => Some(assignments),
            Err(err) => {
                warn!(error = %err, "remote triage returned non-JSON output");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriageResult {
    pub classifier: &'static str,
    pub assignments: Vec<Assignment>,
}

pub struct TriageService {
    remote: Option<Box<dyn IssueClassifier>>,
    fallback: RoundRobinClassifier,
    batch_limit: usize,
}

impl TriageService {
    pub fn new(remote: Option<Box<dyn IssueClassifier>>) -> Self {
        Self {
            remote,
            fallback: RoundRobinClassifier,
            batch_limit: TRIAGE_BATCH_LIMIT,
        }
    }

    pub fn round_robin_only() -> Self {
        Self::new(None)
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let remote = match &config.openrouter_api_key {
            Some(api_key) => Some(Box::new(RemoteClassifier::new(RemoteClassifierConfig {
                url: config.openrouter_url.clone(),
                api_key: api_key.clone(),
                model: config.openrouter_model.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
            })?) as Box<dyn IssueClassifier>),
            None => None,
        };
        Ok(Self::new(remote))
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    pub async fn triage(&self, issues: &[TriageInput]) -> TriageResult {
        let batch = &issues[..issues.len().min(self.batch_limit)];
        if batch.is_empty() {
            return TriageResult {
                classifier: self.fallback.name(),
                assignments: Vec::new(),
            };
        }
        if let Some(remote) = &self.remote {
            if let Some(assignments) = remote.classify(batch).await {
                debug!(count = assignments.len(), "remote triage succeeded");
                return TriageResult {
                    classifier: remote.name(),
                    assignments,
                };
            }
        }
        TriageResult {
            classifier: self.fallback.name(),
            assignments: self.fallback.assign(batch),
        }
    }
}
