use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exit-status sentinel for a job whose remote process vanished before an
/// exit code could be recorded.
pub const EXIT_STATUS_UNKNOWN: i32 = -256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Launching,
    Running,
    Retrieving,
    Completed,
    Failed,
    Cancelled,
    Lost,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Queued,
        JobStatus::Launching,
        JobStatus::Running,
        JobStatus::Retrieving,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Lost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Launching => "launching",
            JobStatus::Running => "running",
            JobStatus::Retrieving => "retrieving",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Lost => "lost",
        }
    }

    /// Active jobs count against the per-principal concurrency cap and
    /// contribute to projected queue time.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Launching | JobStatus::Running | JobStatus::Retrieving
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Lost
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: Uuid,
    pub principal: String,
    pub competition: String,
    pub project: String,
    /// Declared budget in seconds, advisory.
    pub expected_seconds: i64,
    pub status: JobStatus,
    /// Assigned at admission, immutable thereafter.
    pub node: usize,
    pub code_path: Option<String>,
    pub remote_pid: Option<u32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Contents of the result artifact produced by the grading run.
    pub result: Option<String>,
    pub exit_status: Option<i32>,
    pub failure_cause: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields known at admission time.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub principal: String,
    pub competition: String,
    pub project: String,
    pub expected_seconds: i64,
    pub code_path: String,
}

/// Decode the remote exit file into the wire encoding: non-negative for a
/// normal exit, negative signal number for signalled termination, `None`
/// when the file is missing or unparsable.
pub fn decode_exit_file(contents: &str) -> Option<i32> {
    let raw: i32 = contents.trim().parse().ok()?;
    if raw > 128 {
        Some(-(raw - 128))
    } else {
        Some(raw)
    }
}
