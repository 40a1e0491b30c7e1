//! Command channel to one compute node. The rest of the crate depends on
//! the [`Transport`] trait only; the bastion-relayed SSH implementation
//! lives in [`bastion`].

pub mod bastion;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use bastion::BastionTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bastion unreachable: {0}")]
    BastionUnreachable(String),

    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("remote authentication failed: {0}")]
    Auth(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel failure: {0}")]
    Channel(String),

    #[error("protocol failure: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Resilient command channel to one remote compute node.
///
/// Contract: every operation that finds its channel dead transparently
/// re-establishes it before running; only the second consecutive failure
/// surfaces. Operations never re-run a command that failed mid-flight —
/// retrying is the caller's decision. The transport does not interpret
/// command output and does not know what a job is.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the session. Bounded retries with exponential back-off.
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self);

    /// Lightweight liveness check; never re-establishes.
    async fn is_channel_alive(&mut self) -> bool;

    /// Run a shell command, returning captured output and exit status.
    async fn exec(&mut self, cmd: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;

    async fn put_file(&mut self, bytes: &[u8], remote_path: &str) -> Result<(), TransportError>;

    async fn read_file(&mut self, remote_path: &str) -> Result<String, TransportError>;

    /// Whether a process with this pid exists on the remote.
    async fn is_alive_pid(&mut self, pid: u32) -> Result<bool, TransportError>;

    /// Best-effort termination with signal escalation. `Ok(true)` means
    /// the pid is no longer observable.
    async fn kill_pid(&mut self, pid: u32) -> Result<bool, TransportError>;
}
