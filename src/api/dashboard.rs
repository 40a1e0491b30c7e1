//! Dashboard snapshot: job counts, per-node queue descriptors, active and
//! recent jobs, and health aggregates, owner-filtered for non-admins.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::GridqError;
use crate::scheduler::job::JobStatus;

use super::{authenticate, AppState};

const RECENT_JOBS: usize = 10;
const SUCCESS_WINDOW: usize = 100;
const GUARD_WINDOW: Duration = Duration::from_secs(60);
const DASHBOARD_GUARD_PER_MINUTE: usize = 200;

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub timestamp: DateTime<Utc>,
    pub principal: String,
    pub is_admin: bool,
    pub job_counts: BTreeMap<&'static str, i64>,
    pub total_jobs: i64,
    pub queues: Vec<QueueDescriptor>,
    pub active_jobs: Vec<ActiveJobEntry>,
    pub recent_jobs: Vec<RecentJobEntry>,
    pub health: HealthMetrics,
}

#[derive(Debug, Serialize)]
pub struct QueueDescriptor {
    pub node: usize,
    pub queue_size: i64,
    pub projected_seconds: i64,
    pub busy: bool,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job: Option<CurrentJob>,
}

#[derive(Debug, Serialize)]
pub struct CurrentJob {
    pub job_id: Uuid,
    pub principal: String,
    pub competition: String,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ActiveJobEntry {
    pub job_id: Uuid,
    pub principal: String,
    pub competition: String,
    pub status: JobStatus,
    pub node: usize,
    pub expected_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RecentJobEntry {
    pub job_id: Uuid,
    pub principal: String,
    pub competition: String,
    pub status: JobStatus,
    pub node: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthMetrics {
    pub node_utilization_percent: f64,
    pub average_projected_seconds: f64,
    pub total_active_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate_percent: Option<f64>,
    pub submissions_last_24h: i64,
}

pub async fn dashboard(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<DashboardResponse>, GridqError> {
    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    state
        .endpoint_guard
        .check(&client, DASHBOARD_GUARD_PER_MINUTE, GUARD_WINDOW)?;
    let identity = authenticate(&state, &headers)?;
    let filter = if identity.is_admin {
        None
    } else {
        Some(identity.principal.as_str())
    };

    let counts = state.store.status_counts(filter)?;
    let mut job_counts = BTreeMap::new();
    let mut total_jobs = 0;
    for status in JobStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        job_counts.insert(status.as_str(), count);
        total_jobs += count;
    }

    let snapshot = state.store.node_snapshot()?;
    let mut queues = Vec::with_capacity(snapshot.len());
    for record in &snapshot {
        let current_job = match record.current_job {
            Some(job_id) => match state.store.get_job(&job_id) {
                Ok(job) if job.status.is_active() => Some(CurrentJob {
                    job_id: job.job_id,
                    principal: job.principal,
                    competition: job.competition,
                    started_at: job.started_at,
                }),
                _ => None,
            },
            None => None,
        };
        queues.push(QueueDescriptor {
            node: record.node,
            queue_size: record.queued,
            projected_seconds: record.projected_seconds,
            busy: record.busy,
            reachable: record.reachable,
            current_job,
        });
    }

    let active = state.store.active_jobs(filter)?;
    let mut active_jobs = Vec::with_capacity(active.len());
    for job in active {
        let queue_position = if job.status == JobStatus::Queued {
            state.scheduler.queue_position(&job.job_id)?
        } else {
            None
        };
        active_jobs.push(ActiveJobEntry {
            job_id: job.job_id,
            principal: job.principal,
            competition: job.competition,
            status: job.status,
            node: job.node,
            expected_seconds: job.expected_seconds,
            created_at: job.created_at,
            started_at: job.started_at,
            queue_position,
        });
    }

    let recent_jobs: Vec<RecentJobEntry> = state
        .store
        .recent_terminal_jobs(filter, RECENT_JOBS)?
        .into_iter()
        .map(|job| {
            let duration_seconds = match (job.started_at, job.finished_at) {
                (Some(started), Some(finished)) => {
                    Some((finished - started).num_seconds())
                }
                _ => None,
            };
            RecentJobEntry {
                job_id: job.job_id,
                principal: job.principal,
                competition: job.competition,
                status: job.status,
                node: job.node,
                created_at: job.created_at,
                started_at: job.started_at,
                finished_at: job.finished_at,
                duration_seconds,
            }
        })
        .collect();

    let busy = snapshot.iter().filter(|record| record.busy).count();
    let node_utilization_percent = if snapshot.is_empty() {
        0.0
    } else {
        busy as f64 / snapshot.len() as f64 * 100.0
    };
    let average_projected_seconds = if snapshot.is_empty() {
        0.0
    } else {
        snapshot.iter().map(|r| r.projected_seconds as f64).sum::<f64>() / snapshot.len() as f64
    };
    let success_rate_percent = state
        .store
        .success_ratio(SUCCESS_WINDOW)?
        .map(|ratio| ratio * 100.0);
    let submissions_last_24h = state
        .store
        .submissions_since(Utc::now() - chrono::Duration::hours(24), filter)?;

    Ok(Json(DashboardResponse {
        timestamp: Utc::now(),
        principal: identity.principal,
        is_admin: identity.is_admin,
        job_counts,
        total_jobs,
        queues,
        health: HealthMetrics {
            node_utilization_percent,
            average_projected_seconds,
            total_active_jobs: active_jobs.len(),
            success_rate_percent,
            submissions_last_24h,
        },
        active_jobs,
        recent_jobs,
    }))
}
