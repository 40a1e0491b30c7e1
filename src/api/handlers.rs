use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::error::GridqError;
use crate::scheduler::job::{Job, JobStatus, NewJob};

use super::{authenticate, AppState};

const SUBMIT_GUARD_PER_MINUTE: usize = 100;
const READ_GUARD_PER_MINUTE: usize = 200;
const GUARD_WINDOW: Duration = Duration::from_secs(60);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Submit config payload. The option set is closed: unknown fields are a
/// validation error, not silently ignored.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitConfig {
    pub principal: String,
    pub token: String,
    pub competition: String,
    pub project: String,
    pub expected_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub node: usize,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmitResponse {
    fn pending(job: &Job, message: Option<String>) -> Self {
        Self {
            job_id: job.job_id,
            node: job.node,
            status: job.status,
            stdout: None,
            stderr: None,
            exit_status: None,
            started_at: job.started_at,
            finished_at: None,
            message,
        }
    }

    fn finished(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            node: job.node,
            status: job.status,
            stdout: job.result.clone().or_else(|| job.stdout.clone()),
            stderr: job.stderr.clone(),
            exit_status: job.exit_status,
            started_at: job.started_at,
            finished_at: job.finished_at,
            message: None,
        }
    }
}

pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "gridq",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "submit": "POST /submit?wait=bool",
            "status": "GET /status/{job_id}",
            "results": "GET /results/{job_id}",
            "cancel": "POST /cancel/{job_id}",
            "jobs": "GET /jobs",
            "nodes": "GET /nodes",
            "dashboard": "GET /dashboard",
        },
    }))
}

pub async fn submit(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, GridqError> {
    state.endpoint_guard.check(
        &client_id(connect_info),
        SUBMIT_GUARD_PER_MINUTE,
        GUARD_WINDOW,
    )?;

    let mut code: Option<Vec<u8>> = None;
    let mut config_text: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GridqError::Validation(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(|name| name.to_string());
        match name.as_deref() {
            Some("code") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| GridqError::Validation(format!("code field: {e}")))?;
                code = Some(bytes.to_vec());
            }
            Some("config") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| GridqError::Validation(format!("config field: {e}")))?;
                config_text = Some(text);
            }
            other => {
                return Err(GridqError::Validation(format!(
                    "unexpected multipart field '{}'",
                    other.unwrap_or("<unnamed>")
                )));
            }
        }
    }
    let code = code.ok_or_else(|| GridqError::Validation("missing 'code' field".to_string()))?;
    let config_text =
        config_text.ok_or_else(|| GridqError::Validation("missing 'config' field".to_string()))?;

    let job_config: SubmitConfig = serde_yaml::from_str(&config_text)
        .map_err(|e| GridqError::Validation(format!("malformed submit config: {e}")))?;
    if job_config.expected_seconds <= 0 {
        return Err(GridqError::Validation(
            "expected_seconds must be positive".to_string(),
        ));
    }
    if code.is_empty() {
        return Err(GridqError::Validation("code artifact is empty".to_string()));
    }

    let identity = auth::validate_secret(&state.store, &job_config.token)?;
    if identity.principal != job_config.principal {
        return Err(GridqError::PrincipalMismatch(job_config.principal));
    }

    if let Some(scanner) = &state.scanner {
        let verdict = scanner
            .scan(&String::from_utf8_lossy(&code), &job_config.competition)
            .await;
        if !verdict.admitted {
            return Err(GridqError::ScannerReject(verdict.issues.join("; ")));
        }
    }

    state.submissions.check(&identity.principal)?;

    let job_id = Uuid::new_v4();
    let job_dir = state.config.jobs_dir.join(job_id.to_string());
    tokio::fs::create_dir_all(&job_dir)
        .await
        .map_err(|e| GridqError::Storage(format!("jobs directory: {e}")))?;
    let code_path = job_dir.join("artifact");
    tokio::fs::write(&code_path, &code)
        .await
        .map_err(|e| GridqError::Storage(format!("artifact write: {e}")))?;

    let new_job = NewJob {
        job_id,
        principal: identity.principal.clone(),
        competition: job_config.competition,
        project: job_config.project,
        expected_seconds: job_config.expected_seconds,
        code_path: code_path.to_string_lossy().into_owned(),
    };
    let job = match state
        .store
        .admit_job(&new_job, state.config.max_active_jobs_per_principal)
    {
        Ok(job) => job,
        Err(err) => {
            let _ = tokio::fs::remove_dir_all(&job_dir).await;
            return Err(err);
        }
    };
    tracing::info!(
        job_id = %job.job_id,
        principal = %job.principal,
        node = job.node,
        expected_seconds = job.expected_seconds,
        "job admitted"
    );

    if !query.wait {
        return Ok(Json(SubmitResponse::pending(&job, None)));
    }

    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(state.config.wait_max_seconds);
    loop {
        let current = state.store.get_job(&job.job_id)?;
        if current.status.is_terminal() {
            return Ok(Json(SubmitResponse::finished(&current)));
        }
        if tokio::time::Instant::now() >= deadline {
            let message = format!(
                "wait limit of {}s reached, poll /status/{} for the outcome",
                state.config.wait_max_seconds, job.job_id
            );
            return Ok(Json(SubmitResponse::pending(&current, Some(message))));
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub node: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,
}

pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, GridqError> {
    state
        .endpoint_guard
        .check(&client_id(connect_info), READ_GUARD_PER_MINUTE, GUARD_WINDOW)?;
    let identity = authenticate(&state, &headers)?;
    let job = state.store.get_job(&job_id)?;
    ensure_owner(&job, &identity.principal, identity.is_admin)?;
    let queue_position = state.scheduler.queue_position(&job_id)?;
    Ok(Json(StatusResponse {
        job_id: job.job_id,
        status: job.status,
        node: job.node,
        queue_position,
        created_at: job.created_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        exit_status: job.exit_status,
    }))
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub async fn results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<ResultsResponse>, GridqError> {
    state
        .endpoint_guard
        .check(&client_id(connect_info), READ_GUARD_PER_MINUTE, GUARD_WINDOW)?;
    let identity = authenticate(&state, &headers)?;
    let job = state.store.get_job(&job_id)?;
    ensure_owner(&job, &identity.principal, identity.is_admin)?;
    Ok(Json(ResultsResponse {
        job_id: job.job_id,
        status: job.status,
        // The result artifact is the primary output; fall back to the
        // captured process stdout when the run produced none.
        stdout: job.result.clone().or_else(|| job.stdout.clone()),
        stderr: job.stderr,
        exit_status: job.exit_status,
        failure_cause: job.failure_cause,
        started_at: job.started_at,
        finished_at: job.finished_at,
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: &'static str,
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<CancelResponse>, GridqError> {
    let identity = authenticate(&state, &headers)?;
    state
        .scheduler
        .cancel(&job_id, &identity.principal, identity.is_admin)?;
    Ok(Json(CancelResponse {
        job_id,
        status: "cancelled",
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub principal: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub principal: String,
    pub status: JobStatus,
    pub node: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GridqError> {
    state
        .endpoint_guard
        .check(&client_id(connect_info), READ_GUARD_PER_MINUTE, GUARD_WINDOW)?;
    let identity = authenticate(&state, &headers)?;

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(|_| GridqError::Validation(format!("unknown status '{raw}'")))?,
        ),
    };
    // Non-admin callers always see their own jobs only; the principal
    // filter is an admin affordance.
    let principal = if identity.is_admin {
        query.principal
    } else {
        Some(identity.principal.clone())
    };
    let limit = query.limit.unwrap_or(50);

    let jobs = state.store.list_jobs(principal.as_deref(), status, limit)?;
    let summaries: Vec<JobSummary> = jobs
        .into_iter()
        .map(|job| JobSummary {
            job_id: job.job_id,
            principal: job.principal,
            status: job.status,
            node: job.node,
            created_at: job.created_at,
            finished_at: job.finished_at,
        })
        .collect();
    Ok(Json(json!({ "jobs": summaries })))
}

#[derive(Debug, Serialize)]
pub struct NodeStats {
    pub node: usize,
    pub projected_seconds: i64,
    pub busy: bool,
    pub reachable: bool,
    pub queue_length: i64,
    pub address: String,
}

pub async fn nodes(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Json<serde_json::Value>, GridqError> {
    state
        .endpoint_guard
        .check(&client_id(connect_info), READ_GUARD_PER_MINUTE, GUARD_WINDOW)?;
    let snapshot = state.store.node_snapshot()?;
    let nodes: Vec<NodeStats> = snapshot
        .into_iter()
        .map(|record| {
            let address = state
                .config
                .node_addresses
                .get(record.node)
                .cloned()
                .unwrap_or_default();
            NodeStats {
                node: record.node,
                projected_seconds: record.projected_seconds,
                busy: record.busy,
                reachable: record.reachable,
                queue_length: record.queued,
                address,
            }
        })
        .collect();
    Ok(Json(json!({ "nodes": nodes })))
}

fn client_id(connect_info: Option<ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Ownership gate shared by the job-scoped read endpoints: a foreign job
/// reads as forbidden (it exists, the caller may not see it).
fn ensure_owner(job: &Job, principal: &str, is_admin: bool) -> Result<(), GridqError> {
    if is_admin || job.principal == principal {
        Ok(())
    } else {
        Err(GridqError::Forbidden(format!(
            "job {} is not owned by {principal}",
            job.job_id
        )))
    }
}
