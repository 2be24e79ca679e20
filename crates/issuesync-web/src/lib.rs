//! Axum JSON API over the issue store: read, maintenance and triage routes.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use issuesync_core::StoredIssue;
use issuesync_storage::{IssueStore, RepairReport};
use issuesync_sync::triage::{TriageInput, TriageService};
use issuesync_sync::{CycleReport, CycleScheduler};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "issuesync-web";

pub const DEFAULT_LIST_LIMIT: usize = 500;
const DEBUG_SAMPLE_SIZE: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IssueStore>,
    pub triage: Arc<TriageService>,
    /// Present when the background sync runs in this process.
    pub scheduler: Option<Arc<CycleScheduler>>,
}

impl AppState {
    pub fn new(store: Arc<dyn IssueStore>, triage: TriageService) -> Self {
        Self {
            store,
            triage: Arc::new(triage),
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<CycleScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct DebugSnapshot {
    total: u64,
    sample: Vec<StoredIssue>,
}

#[derive(Debug, Serialize)]
struct SyncStatus {
    running: bool,
    cycles_started: u64,
    triggers_skipped: u64,
    last_cycle: Option<CycleReport>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/github/global", get(global_handler))
        .route("/api/github/debug", get(debug_handler))
        .route("/api/github/fix-fields", post(fix_fields_handler))
        .route("/api/github/assigned", get(assigned_handler))
        .route("/api/github/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "issue api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn global_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match state.store.list_recent(limit).await {
        Ok(issues) => Json(issues).into_response(),
        Err(err) => server_error("listing issues", err),
    }
}

async fn debug_handler(State(state): State<Arc<AppState>>) -> Response {
    let total = match state.store.count().await {
        Ok(total) => total,
        Err(err) => return server_error("counting issues", err),
    };
    match state.store.sample(DEBUG_SAMPLE_SIZE).await {
        Ok(sample) => Json(DebugSnapshot { total, sample }).into_response(),
        Err(err) => server_error("sampling issues", err),
    }
}

async fn fix_fields_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.repair_missing_timestamps().await {
        Ok(report) => {
            let RepairReport { repaired, removed } = report;
            info!(repaired, removed, "repaired stored issues");
            Json(report).into_response()
        }
        Err(err) => server_error("repairing issues", err),
    }
}

async fn assigned_handler(State(state): State<Arc<AppState>>) -> Response {
    let recent = match state.store.list_recent(state.triage.batch_limit()).await {
        Ok(recent) => recent,
        Err(err) => return server_error("loading issues for triage", err),
    };
    let inputs = recent.iter().map(TriageInput::from).collect::<Vec<_>>();
    let result = state.triage.triage(&inputs).await;
    info!(classifier = result.classifier, count = result.assignments.len(), "triaged issues");
    Json(result.assignments).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(scheduler) = &state.scheduler else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "background sync is not running in this process"})),
        )
            .into_response();
    };
    Json(SyncStatus {
        running: scheduler.state() == issuesync_sync::scheduler::SchedulerState::Running,
        cycles_started: scheduler.cycles_started(),
        triggers_skipped: scheduler.triggers_skipped(),
        last_cycle: scheduler.last_report(),
    })
    .into_response()
}

fn server_error(action: &str, err: impl std::fmt::Display) -> Response {
    error!(error = %err, "{action} failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": format!("{action} failed")})),
    )
        .into_response()
}
