//! Remote-process supervision: liveness polling, cancellation, the
//! wall-clock limit, and output retrieval with reconnect retries.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{decode_exit_file, Job};
use crate::store::Store;
use crate::transport::{Transport, TransportError};

use super::{RemotePaths, WorkerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionEnd {
    /// The remote pid is gone; the process exited on its own.
    Exited,
    /// Cancellation was observed and the kill issued.
    Cancelled,
    /// The wall-clock limit fired and the kill issued.
    TimedOut,
    /// Reconnection budget exhausted with the pid unobservable.
    Lost,
    /// Server shutdown; the job is left running for reconciliation.
    Shutdown,
}

/// Poll the remote pid until it disappears or something ends the watch.
/// Transport failures do not fail the job here; only a run of consecutive
/// failed probes beyond the budget gives up (the job is then lost).
pub async fn supervise(
    transport: &mut dyn Transport,
    store: &Store,
    job: &Job,
    pid: u32,
    cfg: &WorkerConfig,
    shutdown: &CancellationToken,
) -> Result<SupervisionEnd> {
    let limit_seconds = cfg.wall_clock_multiplier as i64 * job.expected_seconds.max(0);
    let started = job.started_at.unwrap_or_else(Utc::now);
    let deadline = started + chrono::Duration::seconds(limit_seconds);
    let mut failed_probes = 0u32;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(cfg.supervision_interval) => {}
            _ = shutdown.cancelled() => return Ok(SupervisionEnd::Shutdown),
        }

        if store.cancel_flag(&job.job_id)? {
            tracing::info!(job_id = %job.job_id, pid, "cancellation observed, killing remote process");
            kill_best_effort(transport, &job.job_id, pid).await;
            return Ok(SupervisionEnd::Cancelled);
        }

        if Utc::now() >= deadline {
            tracing::warn!(
                job_id = %job.job_id,
                pid,
                limit_seconds,
                "wall-clock limit exceeded, killing remote process"
            );
            kill_best_effort(transport, &job.job_id, pid).await;
            return Ok(SupervisionEnd::TimedOut);
        }

        match transport.is_alive_pid(pid).await {
            Ok(true) => failed_probes = 0,
            Ok(false) => return Ok(SupervisionEnd::Exited),
            Err(err) => {
                failed_probes += 1;
                tracing::warn!(
                    job_id = %job.job_id,
                    pid,
                    failed_probes,
                    budget = cfg.reconnect_budget,
                    error = %err,
                    "liveness probe failed"
                );
                if failed_probes > cfg.reconnect_budget {
                    return Ok(SupervisionEnd::Lost);
                }
            }
        }
    }
}

async fn kill_best_effort(transport: &mut dyn Transport, job_id: &Uuid, pid: u32) {
    if let Err(err) = transport.kill_pid(pid).await {
        tracing::warn!(job_id = %job_id, pid, error = %err, "kill failed, proceeding to retrieval");
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedOutputs {
    pub stdout: String,
    pub stderr: String,
    pub result: String,
    /// Wire-encoded exit status; `None` when the exit file never appeared.
    pub exit_code: Option<i32>,
}

/// Fetch the output files, reconnecting between attempts. Exhausting the
/// attempts makes the job lost at the caller.
pub async fn retrieve_outputs(
    transport: &mut dyn Transport,
    job_id: &Uuid,
    paths: &RemotePaths,
    max_attempts: u32,
) -> std::result::Result<RetrievedOutputs, TransportError> {
    let attempts = max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match try_retrieve(transport, paths).await {
            Ok(outputs) => {
                tracing::debug!(job_id = %job_id, attempt, "outputs retrieved");
                return Ok(outputs);
            }
            Err(err) => {
                tracing::warn!(job_id = %job_id, attempt, attempts, error = %err, "output retrieval failed");
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(5 * attempt as u64)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| TransportError::Channel("no retrieval attempts".to_string())))
}

async fn try_retrieve(
    transport: &mut dyn Transport,
    paths: &RemotePaths,
) -> std::result::Result<RetrievedOutputs, TransportError> {
    let result = transport.read_file(&paths.results).await?;
    let stdout = transport.read_file(&paths.stdout).await?;
    let stderr = transport.read_file(&paths.stderr).await?;
    let exit_raw = transport.read_file(&paths.exit).await?;
    Ok(RetrievedOutputs {
        stdout,
        stderr,
        result,
        exit_code: decode_exit_file(&exit_raw),
    })
}
