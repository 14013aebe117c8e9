//! Handlers for the six `/validate*`/`/task/*`/`/health` routes of spec §6.1,
//! grounded on `validation_api.py`'s FastAPI handlers of the same names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::{Path as AxumPath, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::AppState;
use crate::error::{Result, SandboxError};
use crate::queue::record::JobStatus;
use crate::queue::store::safe_name;

fn default_timeout_s() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_tail() -> i64 {
    200
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub workspace_zip_path: String,
    pub task_json: Value,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default)]
    pub net_checks: bool,
    #[serde(default)]
    pub stream_log: bool,
    #[serde(default = "default_true")]
    pub quiet_kernel: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub result: Value,
    pub log_url: String,
    pub log_path: String,
    pub submission_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sandbox_ready: bool,
    pub sandbox_workers: usize,
    pub sandbox_queue_size: usize,
    pub sandbox_queued: usize,
    pub sandbox_running: usize,
    pub token_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_error: Option<String>,
    pub timestamp: String,
}

/// `GET /health`.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (token_ready, token_error) = match state.service.credentials.get_token().await {
        Ok(_) => (true, None),
        Err(err) => (false, Some(err.to_string())),
    };

    Json(HealthResponse {
        status: "healthy",
        sandbox_ready: true,
        sandbox_workers: state.service.pool.max_workers(),
        sandbox_queue_size: state.service.queue.capacity(),
        sandbox_queued: state.service.queue.queued_count(),
        sandbox_running: state.service.pool.active_count(),
        token_ready,
        token_error,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Rejects a `workspace_zip_path` that resolves outside `root`, matching the
/// `ALPHACORE_VALIDATION_ARCHIVE_ROOT` guard in `validation_api.py`.
fn check_within_archive_root(path: &Path, root: &Path) -> Result<()> {
    let canon_path = std::fs::canonicalize(path)
        .map_err(|err| SandboxError::BadRequest(format!("workspace_zip_path: {err}")))?;
    let canon_root = std::fs::canonicalize(root)
        .map_err(|err| SandboxError::Internal(format!("archive root unreadable: {err}")))?;
    if canon_path == canon_root || canon_path.starts_with(&canon_root) {
        Ok(())
    } else {
        Err(SandboxError::Forbidden(
            "workspace_zip_path is outside the configured archive root".into(),
        ))
    }
}

/// `POST /validate`.
pub async fn submit(State(state): State<AppState>, Json(body): Json<SubmitRequest>) -> Result<Json<SubmitResponse>> {
    state
        .service
        .credentials
        .get_token()
        .await
        .map_err(|err| SandboxError::NotReady(format!("token manager not ready: {err}")))?;

    if !body.workspace_zip_path.to_ascii_lowercase().ends_with(".zip") {
        return Err(SandboxError::BadRequest("workspace_zip_path must end with .zip".into()));
    }

    let zip_path = PathBuf::from(&body.workspace_zip_path);
    if !zip_path.is_file() {
        return Err(SandboxError::BadRequest(format!(
            "workspace_zip_path is not a file: {}",
            body.workspace_zip_path
        )));
    }

    if let Some(root) = &state.archive_root {
        check_within_archive_root(&zip_path, root)?;
    }

    let timeout_s = body.timeout_s.max(1);
    let (record, result_rx) = state
        .service
        .queue
        .submit(&zip_path, body.task_json, timeout_s, body.net_checks, body.quiet_kernel)
        .await?;

    let await_deadline = Duration::from_secs(timeout_s + 30);
    let result = tokio::time::timeout(await_deadline, result_rx)
        .await
        .map_err(|_| SandboxError::AwaitTimeout)?
        .map_err(|_| SandboxError::Internal("result channel dropped before resolving".into()))?;

    let status = match result.status {
        JobStatus::Pass => "pass",
        JobStatus::Fail => "fail",
    };

    Ok(Json(SubmitResponse {
        job_id: record.job_id.clone(),
        task_id: (!record.task_id.is_empty()).then(|| record.task_id.clone()),
        result: json!({
            "status": status,
            "score": result.score,
            "msg": result.msg,
        }),
        log_url: format!("/validate/{}/log", record.job_id),
        log_path: record.log_path.map(|p| p.display().to_string()).unwrap_or_default(),
        submission_path: record
            .stored_submission_path
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        tap: result.tap.clone(),
    }))
}

/// `GET /validate/active`. Registered before `/validate/{job_id}` in
/// `routes.rs` for readability (see DESIGN.md's Open Question 1).
pub async fn list_active(State(state): State<AppState>) -> Json<Value> {
    let jobs = state.service.queue.list_active().await;
    let active: Vec<Value> = jobs
        .iter()
        .map(|record| {
            json!({
                "job_id": record.job_id,
                "status": record.phase,
                "log_url": format!("/validate/{}/log", record.job_id),
            })
        })
        .collect();
    Json(json!({ "active": active }))
}

/// `GET /validate/{job_id}`.
pub async fn get_status(State(state): State<AppState>, AxumPath(job_id): AxumPath<String>) -> Result<Json<Value>> {
    let record = state
        .service
        .queue
        .get(&job_id)
        .await
        .ok_or_else(|| SandboxError::NotFound(format!("unknown job_id: {job_id}")))?;

    Ok(Json(json!({
        "job_id": record.job_id,
        "status": record.phase,
        "queued_at": record.submitted_at.to_rfc3339(),
        "started_at": record.started_at.map(|t| t.to_rfc3339()),
        "finished_at": record.finished_at.map(|t| t.to_rfc3339()),
        "result": record.result,
        "error": record.error,
        "log_tail": record.log_tail,
        "log_path": record.log_path.map(|p| p.display().to_string()),
    })))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_tail")]
    pub tail: i64,
}

/// `GET /validate/{job_id}/log?tail=N`.
pub async fn get_log(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
    Query(params): Query<LogQuery>,
) -> Result<String> {
    let record = state
        .service
        .queue
        .get(&job_id)
        .await
        .ok_or_else(|| SandboxError::NotFound(format!("unknown job_id: {job_id}")))?;

    let log_path = record
        .log_path
        .ok_or_else(|| SandboxError::NotFound("no log recorded for job".into()))?;
    let safe_path = state.service.queue.resolve_log_path(&log_path)?;

    if !safe_path.exists() {
        return Err(SandboxError::NotFound("log file not found (yet)".into()));
    }

    let tail = params.tail.clamp(1, 5000) as usize;
    let contents = tokio::fs::read_to_string(&safe_path).await?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(tail);
    Ok(lines[start..].join("\n"))
}

/// `GET /task/{task_id}`.
pub async fn get_task(State(state): State<AppState>, AxumPath(task_id): AxumPath<String>) -> Json<Value> {
    let jobs = state.service.queue.list_for_task(&task_id).await;
    let matches: Vec<Value> = jobs
        .iter()
        .map(|record| {
            json!({
                "job_id": record.job_id,
                "status": record.phase,
                "queued_at": record.submitted_at.to_rfc3339(),
                "started_at": record.started_at.map(|t| t.to_rfc3339()),
                "finished_at": record.finished_at.map(|t| t.to_rfc3339()),
                "log_path": record.log_path.as_ref().map(|p| p.display().to_string()),
                "submission_path": record.stored_submission_path.as_ref().map(|p| p.display().to_string()),
            })
        })
        .collect();

    let by_task_dir = state.service.queue.archive_root().join("by_task").join(safe_name(&task_id));
    let submission_index_dir = by_task_dir.exists().then(|| by_task_dir.display().to_string());

    Json(json!({
        "task_id": task_id,
        "jobs": matches,
        "submission_index_dir": submission_index_dir,
    }))
}
