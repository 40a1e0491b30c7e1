use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{GridqError, Result};

/// Top-level server configuration, loaded from a YAML file with every
/// field optional (defaults below mirror a small eight-node deployment).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP surface binds to.
    pub listen_addr: SocketAddr,
    /// SQLite datastore path.
    pub database_path: PathBuf,
    /// Directory for uploaded artifacts and mirrored results.
    pub jobs_dir: PathBuf,

    /// Size of the worker pool; one worker per compute node.
    pub num_nodes: usize,
    /// Second-hop targets, indexed by node id. `host` or `host:port`.
    pub node_addresses: Vec<String>,

    pub bastion: BastionConfig,
    pub remote: RemoteConfig,
    pub transport: TransportTuning,

    /// Submissions allowed per principal in any rolling 60-second window.
    pub submit_rate_per_minute: usize,
    /// Active-job cap per principal.
    pub max_active_jobs_per_principal: usize,
    /// Cap applied to newly issued credentials.
    pub credential_max_validity_days: i64,
    /// Wall-clock kill threshold as a multiple of the declared budget.
    pub wall_clock_multiplier: u32,
    /// Cap for the synchronous submit path (`wait=true`).
    pub wait_max_seconds: u64,

    pub scanner_enabled: bool,
    /// Static-analysis-only screening. The LLM half of the scanner is an
    /// external collaborator; with only the static half in-tree this flag
    /// is accepted for compatibility and selects the same behavior.
    pub scanner_quick: bool,

    /// Reset the remote workspace before each job (best-effort).
    pub restart_remote_workspace: bool,

    /// Idle sleep between queue polls, per worker.
    pub worker_poll_interval_ms: u64,
    /// Interval between remote pid liveness probes.
    pub supervision_poll_interval_ms: u64,
    /// Consecutive failed probes tolerated before a job is declared lost.
    pub reconnect_budget: u32,
    /// Attempts at output retrieval before a job is declared lost.
    pub retrieval_max_attempts: u32,
}

/// First-hop (jump host) settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BastionConfig {
    pub address: String,
    pub user: String,
    /// Attempted when the primary bastion is unreachable.
    pub secondary: Option<String>,
    /// Private key for the bastion hop; defaults to `~/.ssh/id_rsa`.
    pub identity_path: Option<PathBuf>,
    /// Connect straight to the node when no bastion can be reached.
    pub direct_fallback: bool,
}

/// Second-hop (compute node) settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub user: String,
    pub secret: String,
    pub port: u16,
    /// Remote working directory for uploaded artifacts and result files.
    pub workdir: String,
    /// Grading invocation. `{solution}`, `{competition}` and `{results}`
    /// are substituted per job. Must not contain single quotes.
    pub grading_command: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportTuning {
    /// Overall budget for establishing one hop, also used as the
    /// banner/auth sub-budget.
    pub connect_timeout_secs: u64,
    /// Bounded retries for connection establishment.
    pub connect_attempts: u32,
    /// Keep-alive frame interval on both hops.
    pub keepalive_interval_secs: u64,
    /// Default per-call timeout for short control commands.
    pub exec_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8001".parse().expect("static addr"),
            database_path: PathBuf::from("./gridq.db"),
            jobs_dir: PathBuf::from("./jobs"),
            num_nodes: 0,
            node_addresses: Vec::new(),
            bastion: BastionConfig::default(),
            remote: RemoteConfig::default(),
            transport: TransportTuning::default(),
            submit_rate_per_minute: 5,
            max_active_jobs_per_principal: 1,
            credential_max_validity_days: 30,
            wall_clock_multiplier: 2,
            wait_max_seconds: 300,
            scanner_enabled: false,
            scanner_quick: false,
            restart_remote_workspace: false,
            worker_poll_interval_ms: 1_000,
            supervision_poll_interval_ms: 2_000,
            reconnect_budget: 5,
            retrieval_max_attempts: 5,
        }
    }
}

impl Default for BastionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            user: String::new(),
            secondary: None,
            identity_path: None,
            direct_fallback: false,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: "gpuuser".to_string(),
            secret: String::new(),
            port: 22,
            workdir: "/home/gpuuser/work".to_string(),
            grading_command: "grade {solution} {competition} {results}".to_string(),
        }
    }
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            connect_attempts: 3,
            keepalive_interval_secs: 60,
            exec_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GridqError::Validation(format!("cannot read {}: {e}", path.display())))?;
        let mut config: ServerConfig = serde_yaml::from_str(&raw)
            .map_err(|e| GridqError::Validation(format!("malformed config: {e}")))?;
        config.normalize()?;
        Ok(config)
    }

    /// Fill derived fields and reject inconsistent settings.
    pub fn normalize(&mut self) -> Result<()> {
        if self.num_nodes == 0 {
            self.num_nodes = self.node_addresses.len();
        }
        if self.num_nodes == 0 {
            return Err(GridqError::Validation(
                "at least one node address is required".to_string(),
            ));
        }
        if self.node_addresses.len() != self.num_nodes {
            return Err(GridqError::Validation(format!(
                "num_nodes is {} but {} node addresses were given",
                self.num_nodes,
                self.node_addresses.len()
            )));
        }
        if self.max_active_jobs_per_principal == 0 {
            return Err(GridqError::Validation(
                "max_active_jobs_per_principal must be at least 1".to_string(),
            ));
        }
        if self.wall_clock_multiplier == 0 {
            return Err(GridqError::Validation(
                "wall_clock_multiplier must be at least 1".to_string(),
            ));
        }
        if self.remote.grading_command.contains('\'') {
            return Err(GridqError::Validation(
                "grading_command must not contain single quotes".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent_once_nodes_are_set() {
        let mut config = ServerConfig {
            node_addresses: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            ..Default::default()
        };
        config.normalize().unwrap();
        assert_eq!(config.num_nodes, 2);
        assert_eq!(config.submit_rate_per_minute, 5);
        assert_eq!(config.max_active_jobs_per_principal, 1);
    }

    #[test]
    fn node_count_mismatch_is_rejected() {
        let mut config = ServerConfig {
            num_nodes: 3,
            node_addresses: vec!["10.0.0.1".into()],
            ..Default::default()
        };
        assert!(config.normalize().is_err());
    }

    #[test]
    fn parses_partial_yaml() {
        let raw = "node_addresses: ['10.0.0.1']\nsubmit_rate_per_minute: 2\n";
        let mut config: ServerConfig = serde_yaml::from_str(raw).unwrap();
        config.normalize().unwrap();
        assert_eq!(config.submit_rate_per_minute, 2);
        assert_eq!(config.wait_max_seconds, 300);
    }
}
