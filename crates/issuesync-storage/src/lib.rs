//! Upsert store for synchronized issues: in-memory and PostgreSQL backends.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use issuesync_core::{IssueRecord, StoredIssue};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "issuesync-storage";

/// Default retention window for stored issues.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Existing row whose content fields changed.
    Updated,
    /// Existing row where only `fetched_at` moved.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUpsert {
    pub issue_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: Vec<FailedUpsert>,
}

impl ApplyReport {
    fn record(&mut self, issue_id: i64, outcome: Result<UpsertOutcome, StoreError>) {
        match outcome {
            Ok(UpsertOutcome::Inserted) => self.inserted += 1,
            Ok(UpsertOutcome::Updated) => self.updated += 1,
            Ok(UpsertOutcome::Unchanged) => self.unchanged += 1,
            Err(err) => {
                warn!(issue_id, error = %err, "upsert failed");
                self.failed.push(FailedUpsert {
                    issue_id,
                    error: err.to_string(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Rows whose missing timestamps were backfilled from `fetched_at`.
    pub repaired: u64,
    /// Rows with no timestamp at all, deleted.
    pub removed: u64,
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn upsert(&self, record: &IssueRecord) -> Result<UpsertOutcome, StoreError>;

    /// Unordered bulk upsert. Not atomic across records: each failure is
    /// reported individually and the rest still apply.
    async fn apply(&self, records: &[IssueRecord]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for record in records {
            let outcome = self.upsert(record).await;
            report.record(record.issue_id, outcome);
        }
        report
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// A retention window reaching past the representable range evicts nothing.
    async fn evict_stale(&self, retention: Duration) -> Result<u64, StoreError> {
        match Utc::now().checked_sub_signed(retention) {
            Some(cutoff) => self.evict_older_than(cutoff).await,
            None => Ok(0),
        }
    }

    async fn repair_missing_timestamps(&self) -> Result<RepairReport, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn sample(&self, limit: usize) -> Result<Vec<StoredIssue>, StoreError>;

    /// Stored issues, most recently updated first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<StoredIssue>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryIssueStore {
    rows: RwLock<HashMap<i64, StoredIssue>>,
}

impl MemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as-is, bypassing normalization. Used to load rows
    /// written by older schema versions.
    pub async fn insert_stored(&self, issue: StoredIssue) {
        self.rows.write().await.insert(issue.issue_id, issue);
    }

    pub async fn get(&self, issue_id: i64) -> Option<StoredIssue> {
        self.rows.read().await.get(&issue_id).cloned()
    }
}

fn sort_recent_first(rows: &mut [StoredIssue]) {
    rows.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.issue_id.cmp(&a.issue_id))
    });
}

#[async_trait]
impl IssueStore for MemoryIssueStore {
    async fn upsert(&self, record: &IssueRecord) -> Result<UpsertOutcome, StoreError> {
        let mut rows = self.rows.write().await;
        let outcome = match rows.get(&record.issue_id) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.same_content(record) => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        rows.insert(record.issue_id, StoredIssue::from(record.clone()));
        Ok(outcome)
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, issue| !matches!(issue.updated_at, Some(ts) if ts < cutoff));
        Ok((before - rows.len()) as u64)
    }

    async fn repair_missing_timestamps(&self) -> Result<RepairReport, StoreError> {
        let mut rows = self.rows.write().await;
        let mut report = RepairReport::default();
        rows.retain(|_, issue| {
            if !issue.is_missing_timestamps() {
                return true;
            }
            match issue.fetched_at {
                Some(fetched_at) => {
                    issue.created_at = issue.created_at.or(Some(fetched_at));
                    issue.updated_at = issue.updated_at.or(Some(fetched_at));
                    report.repaired += 1;
                    true
                }
                None => {
                    report.removed += 1;
                    false
                }
            }
        });
        Ok(report)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.read().await.len() as u64)
    }

    async fn sample(&self, limit: usize) -> Result<Vec<StoredIssue>, StoreError> {
        let mut rows = self.rows.read().await.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<StoredIssue>, StoreError> {
        let mut rows = self.rows.read().await.values().cloned().collect::<Vec<_>>();
        sort_recent_first(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
pub struct PgIssueStore {
    pool: PgPool,
}

const UPSERT_SQL: &str = r#"
WITH prev AS (
    SELECT title, html_url, number, repo_name, author, created_at, updated_at
      FROM global_issues
     WHERE issue_id = $1
)
INSERT INTO global_issues
       (issue_id, title, html_url, number, repo_name, author, created_at, updated_at, fetched_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (issue_id) DO UPDATE
   SET title = EXCLUDED.title,
       html_url = EXCLUDED.html_url,
       number = EXCLUDED.number,
       repo_name = EXCLUDED.repo_name,
       author = EXCLUDED.author,
       created_at = EXCLUDED.created_at,
       updated_at = EXCLUDED.updated_at,
       fetched_at = EXCLUDED.fetched_at
RETURNING
    NOT EXISTS (SELECT 1 FROM prev) AS inserted,
    EXISTS (
        SELECT 1 FROM prev p
         WHERE (p.title, p.html_url, p.number, p.repo_name, p.author, p.created_at, p.updated_at)
               IS DISTINCT FROM
               (global_issues.title, global_issues.html_url, global_issues.number,
                global_issues.repo_name, global_issues.author,
                global_issues.created_at, global_issues.updated_at)
    ) AS changed
"#;

const SELECT_COLUMNS: &str =
    "issue_id, title, html_url, number, repo_name, author, created_at, updated_at, fetched_at";

impl PgIssueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Postgres `LIMIT` is a signed bigint.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn row_to_issue(row: &PgRow) -> Result<StoredIssue, sqlx::Error> {
    Ok(StoredIssue {
        issue_id: row.try_get("issue_id")?,
        title: row.try_get("title")?,
        html_url: row.try_get("html_url")?,
        number: row.try_get("number")?,
        repo_name: row.try_get("repo_name")?,
        author: row.try_get("author")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        fetched_at: row.try_get("fetched_at")?,
    })
}

#[async_trait]
impl IssueStore for PgIssueStore {
    async fn upsert(&self, record: &IssueRecord) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(UPSERT_SQL)
            .bind(record.issue_id)
            .bind(&record.title)
            .bind(&record.html_url)
            .bind(record.number)
            .bind(&record.repo_name)
            .bind(&record.author)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.fetched_at)
            .fetch_one(&self.pool)
            .await?;
        let inserted: bool = row.try_get("inserted")?;
        let changed: bool = row.try_get("changed")?;
        Ok(match (inserted, changed) {
            (true, _) => UpsertOutcome::Inserted,
            (false, true) => UpsertOutcome::Updated,
            (false, false) => UpsertOutcome::Unchanged,
        })
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM global_issues WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn repair_missing_timestamps(&self) -> Result<RepairReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            r#"
            DELETE FROM global_issues
             WHERE (created_at IS NULL OR updated_at IS NULL)
               AND fetched_at IS NULL
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let repaired = sqlx::query(
            r#"
            UPDATE global_issues
               SET created_at = COALESCE(created_at, fetched_at),
                   updated_at = COALESCE(updated_at, fetched_at)
             WHERE created_at IS NULL OR updated_at IS NULL
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(RepairReport { repaired, removed })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM global_issues")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn sample(&self, limit: usize) -> Result<Vec<StoredIssue>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM global_issues ORDER BY fetched_at DESC NULLS LAST LIMIT $1"
        ))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_issue).collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<StoredIssue>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM global_issues \
             ORDER BY updated_at DESC NULLS LAST, issue_id DESC LIMIT $1"
        ))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_issue).collect::<Result<Vec<_>, _>>()?)
    }
}

/// PostgreSQL when a database URL is configured, otherwise an in-memory store.
pub async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn IssueStore>> {
    match database_url {
        Some(url) => {
            let store = PgIssueStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            info!("using postgres issue store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; stored issues live in memory only");
            Ok(Arc::new(MemoryIssueStore::new()))
        }
    }
}
