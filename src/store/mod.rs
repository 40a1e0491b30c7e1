//! SQLite-backed persistence for jobs, node state and credentials.
//!
//! One connection behind a mutex; WAL journal mode so readers are not
//! excluded during writes. Every multi-step update runs in a transaction
//! on that connection, which is what makes admission (quota check +
//! placement + insert) and queue claims race-free.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{GridqError, Result};
use crate::scheduler::job::{Job, JobStatus, NewJob};
use crate::scheduler::placer::{self, NodeLoad};

const JOB_COLUMNS: &str = "job_id, principal, competition, project, expected_seconds, status, \
     node, code_path, remote_pid, stdout, stderr, result, exit_status, failure_cause, \
     cancel_requested, created_at, started_at, finished_at";

const ACTIVE_STATUSES: &str = "('queued', 'launching', 'running', 'retrieving')";
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled', 'lost')";

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node: usize,
    pub projected_seconds: i64,
    pub current_job: Option<Uuid>,
    pub busy: bool,
    pub reachable: bool,
    pub queued: i64,
}

#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub principal: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Terminal fields written in one shot when a job finishes.
#[derive(Debug, Clone, Default)]
pub struct FinishedOutputs {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub result: Option<String>,
    pub exit_status: Option<i32>,
    pub failure_cause: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Job was still queued; it left the ready view synchronously.
    Dequeued,
    /// Job was launching or running; the owning worker will observe the flag.
    Signalled,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path, num_nodes: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema(num_nodes)?;
        Ok(store)
    }

    pub fn open_in_memory(num_nodes: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema(num_nodes)?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| GridqError::Storage(format!("connection lock poisoned: {e}")))
    }

    fn init_schema(&self, num_nodes: usize) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                principal TEXT NOT NULL,
                competition TEXT NOT NULL,
                project TEXT NOT NULL,
                expected_seconds INTEGER NOT NULL,
                status TEXT NOT NULL,
                node INTEGER NOT NULL,
                code_path TEXT,
                remote_pid INTEGER,
                stdout TEXT,
                stderr TEXT,
                result TEXT,
                exit_status INTEGER,
                failure_cause TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_principal_status ON jobs(principal, status);
            CREATE INDEX IF NOT EXISTS idx_jobs_node_status ON jobs(node, status);

            CREATE TABLE IF NOT EXISTS node_state (
                node INTEGER PRIMARY KEY,
                projected_seconds INTEGER NOT NULL DEFAULT 0,
                current_job TEXT,
                busy INTEGER NOT NULL DEFAULT 0,
                reachable INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS credentials (
                secret_hash TEXT PRIMARY KEY,
                principal TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            "#,
        )?;
        for node in 0..num_nodes {
            conn.execute(
                "INSERT OR IGNORE INTO node_state (node, projected_seconds, busy, reachable) \
                 VALUES (?1, 0, 0, 1)",
                params![node as i64],
            )?;
        }
        // Reconcile node records against the jobs table: projected time and
        // busy flags are derived state and may be stale after a crash.
        conn.execute_batch(&format!(
            "UPDATE node_state SET \
             projected_seconds = (SELECT COALESCE(SUM(expected_seconds), 0) FROM jobs \
                 WHERE jobs.node = node_state.node AND jobs.status IN {ACTIVE_STATUSES}), \
             busy = EXISTS (SELECT 1 FROM jobs WHERE jobs.node = node_state.node \
                 AND jobs.status IN ('launching', 'running', 'retrieving')), \
             current_job = (SELECT job_id FROM jobs WHERE jobs.node = node_state.node \
                 AND jobs.status IN ('launching', 'running', 'retrieving') \
                 ORDER BY started_at ASC LIMIT 1);"
        ))?;
        Ok(())
    }

    // ----- jobs -----

    /// Admit a new job: concurrency check, placement, insert and
    /// projected-time bump as a single transaction. Two concurrent
    /// submissions by one principal cannot both pass the check.
    pub fn admit_job(&self, new: &NewJob, max_active: usize) -> Result<Job> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let active: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM jobs WHERE principal = ?1 AND status IN {ACTIVE_STATUSES}"
            ),
            params![new.principal],
            |row| row.get(0),
        )?;
        if active >= max_active as i64 {
            return Err(GridqError::ConcurrencyLimited {
                active,
                max: max_active,
            });
        }

        let loads = {
            let mut stmt = tx.prepare(
                "SELECT node, projected_seconds, reachable FROM node_state ORDER BY node ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(NodeLoad {
                    node: row.get::<_, i64>(0)? as usize,
                    projected_seconds: row.get(1)?,
                    reachable: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let node = placer::choose(&loads)
            .ok_or_else(|| GridqError::Storage("no compute nodes registered".to_string()))?;

        tx.execute(
            "UPDATE node_state SET projected_seconds = projected_seconds + ?1 WHERE node = ?2",
            params![new.expected_seconds, node as i64],
        )?;

        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO jobs (job_id, principal, competition, project, expected_seconds, \
             status, node, code_path, cancel_requested, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                new.job_id.to_string(),
                new.principal,
                new.competition,
                new.project,
                new.expected_seconds,
                JobStatus::Queued.as_str(),
                node as i64,
                new.code_path,
                fmt_ts(created_at),
            ],
        )?;
        tx.commit()?;

        Ok(Job {
            job_id: new.job_id,
            principal: new.principal.clone(),
            competition: new.competition.clone(),
            project: new.project.clone(),
            expected_seconds: new.expected_seconds,
            status: JobStatus::Queued,
            node,
            code_path: Some(new.code_path.clone()),
            remote_pid: None,
            stdout: None,
            stderr: None,
            result: None,
            exit_status: None,
            failure_cause: None,
            cancel_requested: false,
            created_at,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn get_job(&self, job_id: &Uuid) -> Result<Job> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
            params![job_id.to_string()],
            job_from_row,
        )
        .optional()?
        .ok_or_else(|| GridqError::NotFound(format!("job {job_id}")))
    }

    /// Pop the oldest queued job for a node: queued -> launching, stamps
    /// `started_at`, clears the cancel flag, marks the node busy.
    pub fn claim_next_for_node(&self, node: usize) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let job = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE node = ?1 AND status = 'queued' \
                     ORDER BY created_at ASC, job_id ASC LIMIT 1"
                ),
                params![node as i64],
                job_from_row,
            )
            .optional()?;
        let Some(mut job) = job else {
            return Ok(None);
        };
        let started_at = Utc::now();
        tx.execute(
            "UPDATE jobs SET status = 'launching', started_at = ?1, cancel_requested = 0 \
             WHERE job_id = ?2",
            params![fmt_ts(started_at), job.job_id.to_string()],
        )?;
        tx.execute(
            "UPDATE node_state SET busy = 1, current_job = ?1 WHERE node = ?2",
            params![job.job_id.to_string(), node as i64],
        )?;
        tx.commit()?;
        job.status = JobStatus::Launching;
        job.started_at = Some(started_at);
        job.cancel_requested = false;
        Ok(Some(job))
    }

    pub fn set_running(&self, job_id: &Uuid, pid: u32) -> Result<()> {
        self.expect_updated(
            "UPDATE jobs SET status = 'running', remote_pid = ?1 WHERE job_id = ?2",
            params![pid as i64, job_id.to_string()],
            job_id,
        )
    }

    pub fn set_retrieving(&self, job_id: &Uuid) -> Result<()> {
        self.expect_updated(
            "UPDATE jobs SET status = 'retrieving' WHERE job_id = ?1",
            params![job_id.to_string()],
            job_id,
        )
    }

    pub fn finish_job(
        &self,
        job_id: &Uuid,
        status: JobStatus,
        outputs: &FinishedOutputs,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        self.expect_updated(
            "UPDATE jobs SET status = ?1, stdout = ?2, stderr = ?3, result = ?4, \
             exit_status = ?5, failure_cause = ?6, finished_at = ?7 WHERE job_id = ?8",
            params![
                status.as_str(),
                outputs.stdout,
                outputs.stderr,
                outputs.result,
                outputs.exit_status,
                outputs.failure_cause,
                fmt_ts(Utc::now()),
                job_id.to_string(),
            ],
            job_id,
        )
    }

    /// Apply the cancellation rules of the scheduler: queued jobs leave the
    /// ready view at once and return their budget; in-flight jobs get the
    /// advisory flag. Terminal and retrieving jobs reject the call.
    pub fn cancel_job(&self, job_id: &Uuid) -> Result<CancelOutcome> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let row = tx
            .query_row(
                "SELECT status, node, expected_seconds FROM jobs WHERE job_id = ?1",
                params![job_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((status_raw, node, expected_seconds)) = row else {
            return Err(GridqError::NotFound(format!("job {job_id}")));
        };
        let status = parse_status(&status_raw)?;
        match status {
            JobStatus::Queued => {
                tx.execute(
                    "UPDATE jobs SET status = 'cancelled', finished_at = ?1 WHERE job_id = ?2",
                    params![fmt_ts(Utc::now()), job_id.to_string()],
                )?;
                tx.execute(
                    "UPDATE node_state SET projected_seconds = MAX(0, projected_seconds - ?1) \
                     WHERE node = ?2",
                    params![expected_seconds, node],
                )?;
                tx.commit()?;
                Ok(CancelOutcome::Dequeued)
            }
            JobStatus::Launching | JobStatus::Running => {
                tx.execute(
                    "UPDATE jobs SET cancel_requested = 1 WHERE job_id = ?1",
                    params![job_id.to_string()],
                )?;
                tx.commit()?;
                Ok(CancelOutcome::Signalled)
            }
            other => Err(GridqError::TerminalState(other.as_str().to_string())),
        }
    }

    pub fn cancel_flag(&self, job_id: &Uuid) -> Result<bool> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT cancel_requested FROM jobs WHERE job_id = ?1",
            params![job_id.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| GridqError::NotFound(format!("job {job_id}")))
    }

    pub fn list_jobs(
        &self,
        principal: Option<&str>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        let mut clauses = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(principal) = principal {
            values.push(principal.to_string().into());
            clauses.push(format!("principal = ?{}", values.len()));
        }
        if let Some(status) = status {
            values.push(status.as_str().to_string().into());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        values.push((limit as i64).into());
        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT ?{}",
            values.len()
        ));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn active_jobs(&self, principal: Option<&str>) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let sql = match principal {
            Some(_) => format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN {ACTIVE_STATUSES} \
                 AND principal = ?1 ORDER BY created_at ASC"
            ),
            None => format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN {ACTIVE_STATUSES} \
                 ORDER BY created_at ASC"
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = match principal {
            Some(p) => stmt.query_map(params![p], job_from_row)?,
            None => stmt.query_map([], job_from_row)?,
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Jobs a restarted worker must reconcile: claimed by this node but not
    /// yet terminal. Queued jobs are not included; they are simply claimed
    /// again.
    pub fn jobs_active_on_node(&self, node: usize) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE node = ?1 \
             AND status IN ('launching', 'running', 'retrieving') ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![node as i64], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Position in the per-node FIFO, 0-indexed. `None` once the job left
    /// the queued state.
    pub fn queue_position(&self, job_id: &Uuid) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT status, node, created_at FROM jobs WHERE job_id = ?1",
                params![job_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((status_raw, node, created_at)) = row else {
            return Err(GridqError::NotFound(format!("job {job_id}")));
        };
        if parse_status(&status_raw)? != JobStatus::Queued {
            return Ok(None);
        }
        let ahead: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE node = ?1 AND status = 'queued' \
             AND (created_at < ?2 OR (created_at = ?2 AND job_id < ?3))",
            params![node, created_at, job_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(Some(ahead))
    }

    // ----- node state -----

    pub fn release_node(&self, node: usize, expected_seconds: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE node_state SET projected_seconds = MAX(0, projected_seconds - ?1), \
             busy = 0, current_job = NULL WHERE node = ?2",
            params![expected_seconds, node as i64],
        )?;
        Ok(())
    }

    pub fn set_node_reachable(&self, node: usize, reachable: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE node_state SET reachable = ?1 WHERE node = ?2",
            params![reachable, node as i64],
        )?;
        Ok(())
    }

    pub fn node_snapshot(&self) -> Result<Vec<NodeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT n.node, n.projected_seconds, n.current_job, n.busy, n.reachable, \
             (SELECT COUNT(*) FROM jobs j WHERE j.node = n.node AND j.status = 'queued') \
             FROM node_state n ORDER BY n.node ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let current_job: Option<String> = row.get(2)?;
            Ok(NodeRecord {
                node: row.get::<_, i64>(0)? as usize,
                projected_seconds: row.get(1)?,
                current_job: current_job.and_then(|s| Uuid::parse_str(&s).ok()),
                busy: row.get(3)?,
                reachable: row.get(4)?,
                queued: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ----- dashboard aggregates -----

    pub fn status_counts(&self, principal: Option<&str>) -> Result<HashMap<JobStatus, i64>> {
        let conn = self.conn()?;
        let sql = match principal {
            Some(_) => "SELECT status, COUNT(*) FROM jobs WHERE principal = ?1 GROUP BY status",
            None => "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        };
        let mut stmt = conn.prepare(sql)?;
        let rows: Vec<(String, i64)> = match principal {
            Some(p) => stmt
                .query_map(params![p], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        let mut counts = HashMap::new();
        for (status_raw, count) in rows {
            counts.insert(parse_status(&status_raw)?, count);
        }
        Ok(counts)
    }

    pub fn recent_terminal_jobs(&self, principal: Option<&str>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let sql = match principal {
            Some(_) => format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN {TERMINAL_STATUSES} \
                 AND principal = ?1 ORDER BY finished_at DESC LIMIT ?2"
            ),
            None => format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN {TERMINAL_STATUSES} \
                 ORDER BY finished_at DESC LIMIT ?1"
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = match principal {
            Some(p) => stmt.query_map(params![p, limit as i64], job_from_row)?,
            None => stmt.query_map(params![limit as i64], job_from_row)?,
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fraction of completed jobs among the last `window` jobs that ended
    /// in completed or failed. `None` when no such jobs exist.
    pub fn success_ratio(&self, window: usize) -> Result<Option<f64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status FROM jobs WHERE status IN ('completed', 'failed') \
             ORDER BY finished_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![window as i64], |row| row.get::<_, String>(0))?;
        let statuses = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        if statuses.is_empty() {
            return Ok(None);
        }
        let completed = statuses.iter().filter(|s| s.as_str() == "completed").count();
        Ok(Some(completed as f64 / statuses.len() as f64))
    }

    pub fn submissions_since(
        &self,
        cutoff: DateTime<Utc>,
        principal: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let count = match principal {
            Some(p) => conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE created_at >= ?1 AND principal = ?2",
                params![fmt_ts(cutoff), p],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE created_at >= ?1",
                params![fmt_ts(cutoff)],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    // ----- credentials -----

    /// Insert a credential, deactivating all prior active credentials for
    /// the same principal in the same transaction.
    pub fn insert_credential(
        &self,
        principal: &str,
        secret_hash: &str,
        is_admin: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM credentials WHERE secret_hash = ?1",
            params![secret_hash],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(GridqError::Validation(
                "credential already exists".to_string(),
            ));
        }
        tx.execute(
            "UPDATE credentials SET is_active = 0 WHERE principal = ?1 AND is_active = 1",
            params![principal],
        )?;
        tx.execute(
            "INSERT INTO credentials (secret_hash, principal, is_admin, is_active, created_at, \
             expires_at) VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            params![
                secret_hash,
                principal,
                is_admin,
                fmt_ts(Utc::now()),
                fmt_ts(expires_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn lookup_credential(&self, secret_hash: &str) -> Result<Option<CredentialRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT principal, is_admin, is_active, created_at, expires_at \
                 FROM credentials WHERE secret_hash = ?1",
                params![secret_hash],
                |row| {
                    Ok(CredentialRecord {
                        principal: row.get(0)?,
                        is_admin: row.get(1)?,
                        is_active: row.get(2)?,
                        created_at: parse_ts(row, 3)?,
                        expires_at: parse_ts(row, 4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn deactivate_credential(&self, secret_hash: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE credentials SET is_active = 0 WHERE secret_hash = ?1",
            params![secret_hash],
        )?;
        Ok(updated > 0)
    }

    pub fn active_credential_count(&self, principal: &str) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM credentials WHERE principal = ?1 AND is_active = 1",
            params![principal],
            |row| row.get(0),
        )?)
    }

    fn expect_updated(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
        job_id: &Uuid,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(sql, args)?;
        if updated == 0 {
            return Err(GridqError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }
}

/// RFC 3339 with fixed microsecond precision so lexicographic ordering in
/// SQL matches chronological ordering.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn parse_status(raw: &str) -> Result<JobStatus> {
    raw.parse()
        .map_err(|_| GridqError::Storage(format!("unknown job status '{raw}' in datastore")))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let job_id: String = row.get(0)?;
    let status: String = row.get(5)?;
    Ok(Job {
        job_id: Uuid::parse_str(&job_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        principal: row.get(1)?,
        competition: row.get(2)?,
        project: row.get(3)?,
        expected_seconds: row.get(4)?,
        status: status.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown status '{status}'").into(),
            )
        })?,
        node: row.get::<_, i64>(6)? as usize,
        code_path: row.get(7)?,
        remote_pid: row.get::<_, Option<i64>>(8)?.map(|pid| pid as u32),
        stdout: row.get(9)?,
        stderr: row.get(10)?,
        result: row.get(11)?,
        exit_status: row.get(12)?,
        failure_cause: row.get(13)?,
        cancel_requested: row.get(14)?,
        created_at: parse_ts(row, 15)?,
        started_at: parse_opt_ts(row, 16)?,
        finished_at: parse_opt_ts(row, 17)?,
    })
}
