//! Per-node workers: each owns one transport and drives one job at a time
//! through launch, supervision and retrieval, persisting every
//! transition. Workers never propagate errors to callers; failures are
//! recorded on the affected job and the loop continues.

pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::GridqError;
use crate::scheduler::job::{Job, JobStatus, EXIT_STATUS_UNKNOWN};
use crate::store::{FinishedOutputs, Store};
use crate::transport::{BastionTransport, Transport, TransportError};

use supervisor::{retrieve_outputs, supervise, RetrievedOutputs, SupervisionEnd};

/// Per-worker settings cut from the server configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub node: usize,
    /// Idle sleep between queue polls.
    pub poll_interval: Duration,
    /// Interval between liveness probes.
    pub supervision_interval: Duration,
    pub wall_clock_multiplier: u32,
    pub restart_remote_workspace: bool,
    pub remote_workdir: String,
    /// Grading invocation template; `{solution}`, `{competition}` and
    /// `{results}` are substituted per job.
    pub grading_command: String,
    pub exec_timeout: Duration,
    pub reconnect_budget: u32,
    pub retrieval_max_attempts: u32,
    /// Server-side directory where retrieved result artifacts are mirrored.
    pub jobs_dir: PathBuf,
}

impl WorkerConfig {
    pub fn from_server(config: &ServerConfig, node: usize) -> Self {
        Self {
            node,
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            supervision_interval: Duration::from_millis(config.supervision_poll_interval_ms),
            wall_clock_multiplier: config.wall_clock_multiplier,
            restart_remote_workspace: config.restart_remote_workspace,
            remote_workdir: config.remote.workdir.clone(),
            grading_command: config.remote.grading_command.clone(),
            exec_timeout: Duration::from_secs(config.transport.exec_timeout_secs),
            reconnect_budget: config.reconnect_budget,
            retrieval_max_attempts: config.retrieval_max_attempts,
            jobs_dir: config.jobs_dir.clone(),
        }
    }
}

/// Remote file locations for one job. The workspace holds the artifact
/// and the result file; per-job stdout/stderr/exit files live in /tmp so
/// a workspace reset cannot eat them mid-run.
#[derive(Debug, Clone)]
pub struct RemotePaths {
    pub solution: String,
    pub results: String,
    pub stdout: String,
    pub stderr: String,
    pub exit: String,
}

impl RemotePaths {
    pub fn new(workdir: &str, job_id: &Uuid) -> Self {
        Self {
            solution: format!("{workdir}/solution.py"),
            results: format!("{workdir}/results.jsonl"),
            stdout: format!("/tmp/job_{job_id}.out"),
            stderr: format!("/tmp/job_{job_id}.err"),
            exit: format!("/tmp/job_{job_id}.exit"),
        }
    }
}

pub struct Worker {
    cfg: WorkerConfig,
    store: Arc<Store>,
    transport: Box<dyn Transport>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        cfg: WorkerConfig,
        store: Arc<Store>,
        transport: Box<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            store,
            transport,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(node = self.cfg.node, "worker started");
        if let Err(err) = self.reconcile().await {
            tracing::error!(node = self.cfg.node, error = %err, "reconciliation failed");
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if !self.transport.is_channel_alive().await {
                match self.transport.connect().await {
                    Ok(()) => {
                        let _ = self.store.set_node_reachable(self.cfg.node, true);
                    }
                    Err(err) => {
                        tracing::warn!(node = self.cfg.node, error = %err, "node unreachable");
                        let _ = self.store.set_node_reachable(self.cfg.node, false);
                        if self.idle_sleep().await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let claimed = match self.store.claim_next_for_node(self.cfg.node) {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::error!(node = self.cfg.node, error = %err, "queue claim failed");
                    if self.idle_sleep().await {
                        break;
                    }
                    continue;
                }
            };

            match claimed {
                Some(job) => self.process_job(job).await,
                None => {
                    if self.idle_sleep().await {
                        break;
                    }
                }
            }
        }

        self.transport.disconnect().await;
        tracing::info!(node = self.cfg.node, "worker stopped");
    }

    /// Returns true when shutdown was requested during the sleep.
    async fn idle_sleep(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.cfg.poll_interval) => false,
            _ = self.shutdown.cancelled() => true,
        }
    }

    /// Pick up jobs this node left in flight before a restart: resume
    /// supervision when a pid was recorded, otherwise the outcome is
    /// unknowable and the job is lost.
    async fn reconcile(&mut self) -> crate::error::Result<()> {
        let stranded = self.store.jobs_active_on_node(self.cfg.node)?;
        for job in stranded {
            match job.remote_pid {
                Some(pid) => {
                    tracing::info!(
                        job_id = %job.job_id,
                        node = self.cfg.node,
                        pid,
                        status = %job.status,
                        "resuming supervision of stranded job"
                    );
                    if self.supervise_and_retrieve(&job, pid).await {
                        let _ = self.store.release_node(self.cfg.node, job.expected_seconds);
                    }
                }
                None => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        node = self.cfg.node,
                        "stranded job has no pid, marking lost"
                    );
                    self.store.finish_job(
                        &job.job_id,
                        JobStatus::Lost,
                        &FinishedOutputs {
                            exit_status: Some(EXIT_STATUS_UNKNOWN),
                            failure_cause: Some(
                                "server restarted before launch completed".to_string(),
                            ),
                            ..Default::default()
                        },
                    )?;
                    self.store.release_node(self.cfg.node, job.expected_seconds)?;
                }
            }
        }
        Ok(())
    }

    async fn process_job(&mut self, job: Job) {
        tracing::info!(
            job_id = %job.job_id,
            node = self.cfg.node,
            principal = %job.principal,
            expected_seconds = job.expected_seconds,
            "starting job"
        );
        let finished = match self.launch(&job).await {
            Ok(pid) => self.supervise_and_retrieve(&job, pid).await,
            Err(err) => {
                tracing::warn!(job_id = %job.job_id, error = %err, "pre-launch failure");
                let outputs = FinishedOutputs {
                    stderr: Some(err.to_string()),
                    failure_cause: Some(err.kind().to_string()),
                    ..Default::default()
                };
                if let Err(store_err) =
                    self.store.finish_job(&job.job_id, JobStatus::Failed, &outputs)
                {
                    tracing::error!(job_id = %job.job_id, error = %store_err, "failed to record pre-launch failure");
                }
                true
            }
        };
        // A job left running for reconciliation keeps its projected time;
        // the node record is re-derived on the next start.
        if finished {
            if let Err(err) = self.store.release_node(self.cfg.node, job.expected_seconds) {
                tracing::error!(node = self.cfg.node, error = %err, "failed to release node load");
            }
        }
    }

    /// Upload the artifact and start the grading command detached from the
    /// session (`setsid nohup ... &`) so it survives channel loss, then
    /// record the captured pid.
    async fn launch(&mut self, job: &Job) -> crate::error::Result<u32> {
        let paths = RemotePaths::new(&self.cfg.remote_workdir, &job.job_id);

        if self.cfg.restart_remote_workspace {
            let reset = format!(
                "rm -rf {workdir} && mkdir -p {workdir}",
                workdir = self.cfg.remote_workdir
            );
            if let Err(err) = self.transport.exec(&reset, self.cfg.exec_timeout).await {
                tracing::warn!(job_id = %job.job_id, error = %err, "workspace reset failed, continuing");
            }
        }
        self.transport
            .exec(
                &format!("mkdir -p {}", self.cfg.remote_workdir),
                self.cfg.exec_timeout,
            )
            .await?;

        let code_path = job
            .code_path
            .as_deref()
            .ok_or_else(|| GridqError::Validation("job has no artifact".to_string()))?;
        let artifact = tokio::fs::read(code_path)
            .await
            .map_err(|e| GridqError::Storage(format!("artifact read ({code_path}): {e}")))?;
        self.transport.put_file(&artifact, &paths.solution).await?;

        let grading = self
            .cfg
            .grading_command
            .replace("{solution}", &paths.solution)
            .replace("{competition}", &job.competition)
            .replace("{results}", &paths.results);
        let launch = format!(
            "setsid nohup bash -c '{grading}; echo $? > {exit}' > {out} 2> {err} < /dev/null & echo $!",
            exit = paths.exit,
            out = paths.stdout,
            err = paths.stderr,
        );
        let output = self.transport.exec(&launch, self.cfg.exec_timeout).await?;
        let pid: u32 = output.stdout.trim().parse().map_err(|_| {
            GridqError::Transport(TransportError::Protocol(format!(
                "launch did not return a pid: '{}'",
                output.stdout.trim()
            )))
        })?;

        self.store.set_running(&job.job_id, pid)?;
        tracing::info!(job_id = %job.job_id, node = self.cfg.node, pid, "job launched");
        Ok(pid)
    }

    /// Returns false when shutdown interrupted supervision and the job was
    /// intentionally left in flight.
    async fn supervise_and_retrieve(&mut self, job: &Job, pid: u32) -> bool {
        let end = match supervise(
            self.transport.as_mut(),
            &self.store,
            job,
            pid,
            &self.cfg,
            &self.shutdown,
        )
        .await
        {
            Ok(end) => end,
            Err(err) => {
                tracing::error!(job_id = %job.job_id, error = %err, "supervision aborted on storage error");
                let _ = self.store.finish_job(
                    &job.job_id,
                    JobStatus::Failed,
                    &FinishedOutputs {
                        failure_cause: Some("storage".to_string()),
                        stderr: Some(err.to_string()),
                        ..Default::default()
                    },
                );
                return true;
            }
        };

        match end {
            SupervisionEnd::Shutdown => {
                tracing::info!(job_id = %job.job_id, "shutdown during supervision, leaving job for reconciliation");
                return false;
            }
            SupervisionEnd::Lost => {
                let _ = self.store.finish_job(
                    &job.job_id,
                    JobStatus::Lost,
                    &FinishedOutputs {
                        exit_status: Some(EXIT_STATUS_UNKNOWN),
                        failure_cause: Some(
                            "reconnection budget exhausted during supervision".to_string(),
                        ),
                        ..Default::default()
                    },
                );
            }
            SupervisionEnd::Exited | SupervisionEnd::Cancelled | SupervisionEnd::TimedOut => {
                self.retrieve_and_finish(job, end).await;
            }
        }
        true
    }

    async fn retrieve_and_finish(&mut self, job: &Job, end: SupervisionEnd) {
        if let Err(err) = self.store.set_retrieving(&job.job_id) {
            tracing::error!(job_id = %job.job_id, error = %err, "failed to enter retrieval");
        }
        let paths = RemotePaths::new(&self.cfg.remote_workdir, &job.job_id);
        match retrieve_outputs(
            self.transport.as_mut(),
            &job.job_id,
            &paths,
            self.cfg.retrieval_max_attempts,
        )
        .await
        {
            Ok(outputs) => {
                let (status, finished) = self.classify(job, end, outputs);
                match self.store.finish_job(&job.job_id, status, &finished) {
                    Ok(()) => {
                        tracing::info!(
                            job_id = %job.job_id,
                            node = self.cfg.node,
                            status = %status,
                            exit_status = ?finished.exit_status,
                            "job finished"
                        );
                        self.mirror_results(job, finished.result.as_deref()).await;
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.job_id, error = %err, "failed to persist outcome");
                    }
                }
                self.cleanup_remote(&paths).await;
            }
            Err(err) => {
                tracing::warn!(job_id = %job.job_id, error = %err, "retrieval exhausted, job lost");
                let _ = self.store.finish_job(
                    &job.job_id,
                    JobStatus::Lost,
                    &FinishedOutputs {
                        exit_status: Some(EXIT_STATUS_UNKNOWN),
                        failure_cause: Some(format!("output retrieval failed: {err}")),
                        ..Default::default()
                    },
                );
            }
        }
    }

    fn classify(
        &self,
        job: &Job,
        end: SupervisionEnd,
        outputs: RetrievedOutputs,
    ) -> (JobStatus, FinishedOutputs) {
        let (status, exit_status, failure_cause) = match end {
            SupervisionEnd::Cancelled => (JobStatus::Cancelled, outputs.exit_code, None),
            SupervisionEnd::TimedOut => (
                JobStatus::Failed,
                outputs.exit_code,
                Some(format!(
                    "wall-clock limit exceeded ({}s)",
                    self.cfg.wall_clock_multiplier as i64 * job.expected_seconds
                )),
            ),
            _ => match outputs.exit_code {
                Some(0) => (JobStatus::Completed, Some(0), None),
                Some(code) if code < 0 => (
                    JobStatus::Failed,
                    Some(code),
                    Some(format!("remote process killed by signal {}", -code)),
                ),
                Some(code) => (
                    JobStatus::Failed,
                    Some(code),
                    Some(format!("remote process exited with status {code}")),
                ),
                None => (
                    JobStatus::Lost,
                    Some(EXIT_STATUS_UNKNOWN),
                    Some("remote process vanished without an exit status".to_string()),
                ),
            },
        };
        let finished = FinishedOutputs {
            stdout: none_if_empty(outputs.stdout),
            stderr: none_if_empty(outputs.stderr),
            result: none_if_empty(outputs.result),
            exit_status,
            failure_cause,
        };
        (status, finished)
    }

    /// Mirror the result artifact under the server's jobs directory, named
    /// by submitter and competition. Best-effort.
    async fn mirror_results(&self, job: &Job, result: Option<&str>) {
        let Some(result) = result else { return };
        let dir = self.cfg.jobs_dir.join("results");
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(error = %err, "cannot create results directory");
            return;
        }
        let name = format!(
            "{}_{}_{}.jsonl",
            job.principal,
            job.competition,
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        if let Err(err) = tokio::fs::write(dir.join(&name), result).await {
            tracing::warn!(error = %err, file = %name, "failed to mirror result artifact");
        }
    }

    async fn cleanup_remote(&mut self, paths: &RemotePaths) {
        let cmd = format!(
            "rm -f {} {} {} {} {}",
            paths.solution, paths.results, paths.stdout, paths.stderr, paths.exit
        );
        if let Err(err) = self.transport.exec(&cmd, self.cfg.exec_timeout).await {
            tracing::debug!(error = %err, "remote cleanup failed");
        }
    }
}

fn none_if_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// One worker per compute node, each with its own bastion transport.
pub fn spawn_workers(
    store: Arc<Store>,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..config.num_nodes)
        .map(|node| {
            let transport = BastionTransport::new(
                node,
                config.node_addresses[node].clone(),
                config.bastion.clone(),
                config.remote.clone(),
                config.transport.clone(),
            );
            let worker = Worker::new(
                WorkerConfig::from_server(config, node),
                store.clone(),
                Box::new(transport),
                shutdown.clone(),
            );
            tokio::spawn(worker.run())
        })
        .collect()
}
