//! Two-hop SSH transport: local -> bastion (publickey) -> compute node
//! (password), the second hop tunnelled through a `direct-tcpip` channel
//! on the first. Keep-alive frames run on both hops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;

use crate::config::{BastionConfig, RemoteConfig, TransportTuning};

use super::{ExecOutput, Transport, TransportError};

/// Exit status reported when the remote closed the channel without
/// sending one.
const EXIT_CHANNEL_CLOSED: i32 = -1;

struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    // Host keys are pinned by the deployment (known, fixed pool); the
    // transport accepts and relies on the per-hop credentials.
    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct BastionTransport {
    node: usize,
    node_addr: String,
    bastion: BastionConfig,
    remote: RemoteConfig,
    tuning: TransportTuning,
    jump: Option<Handle<AcceptingHandler>>,
    session: Option<Handle<AcceptingHandler>>,
}

impl BastionTransport {
    pub fn new(
        node: usize,
        node_addr: String,
        bastion: BastionConfig,
        remote: RemoteConfig,
        tuning: TransportTuning,
    ) -> Self {
        Self {
            node,
            node_addr,
            bastion,
            remote,
            tuning,
            jump: None,
            session: None,
        }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(self.tuning.keepalive_interval_secs)),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tuning.connect_timeout_secs)
    }

    fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.tuning.exec_timeout_secs)
    }

    async fn connect_bastion(
        &self,
        config: Arc<client::Config>,
        address: &str,
    ) -> Result<Handle<AcceptingHandler>, TransportError> {
        let (host, port) = split_host_port(address, 22);
        let mut handle = tokio::time::timeout(
            self.connect_timeout(),
            client::connect(config, (host.as_str(), port), AcceptingHandler),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.connect_timeout()))?
        .map_err(|e| TransportError::BastionUnreachable(e.to_string()))?;

        let identity = self
            .bastion
            .identity_path
            .clone()
            .unwrap_or_else(default_identity_path);
        let pair = russh_keys::load_secret_key(&identity, None)
            .map_err(|e| TransportError::Auth(format!("{}: {e}", identity.display())))?;
        let authed = handle
            .authenticate_publickey(self.bastion.user.clone(), Arc::new(pair))
            .await
            .map_err(|e| TransportError::Auth(e.to_string()))?;
        if !authed {
            return Err(TransportError::Auth(format!(
                "bastion rejected publickey for {}",
                self.bastion.user
            )));
        }
        Ok(handle)
    }

    async fn authenticate_node(
        &self,
        handle: &mut Handle<AcceptingHandler>,
    ) -> Result<(), TransportError> {
        let authed = handle
            .authenticate_password(self.remote.user.clone(), self.remote.secret.clone())
            .await
            .map_err(|e| TransportError::Auth(e.to_string()))?;
        if !authed {
            return Err(TransportError::Auth(format!(
                "node rejected password for {}",
                self.remote.user
            )));
        }
        Ok(())
    }

    /// One full establishment attempt: bastion (primary, then secondary),
    /// direct-tcpip tunnel, node session. With `direct_fallback` a last
    /// attempt connects straight to the node.
    async fn establish(&mut self) -> Result<(), TransportError> {
        let config = self.client_config();

        let jump = match self.connect_bastion(config.clone(), &self.bastion.address.clone()).await
        {
            Ok(handle) => Some(handle),
            Err(primary_err) => match &self.bastion.secondary {
                Some(secondary) => {
                    tracing::warn!(
                        node = self.node,
                        error = %primary_err,
                        secondary = %secondary,
                        "primary bastion unreachable, trying secondary"
                    );
                    match self.connect_bastion(config.clone(), &secondary.clone()).await {
                        Ok(handle) => Some(handle),
                        Err(secondary_err) => {
                            if self.bastion.direct_fallback {
                                None
                            } else {
                                return Err(secondary_err);
                            }
                        }
                    }
                }
                None if self.bastion.direct_fallback => None,
                None => return Err(primary_err),
            },
        };

        let mut session = match &jump {
            Some(jump) => {
                let (host, port) = split_host_port(&self.node_addr, self.remote.port);
                let channel = jump
                    .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
                    .await
                    .map_err(|e| TransportError::NodeUnreachable(e.to_string()))?;
                tokio::time::timeout(
                    self.connect_timeout(),
                    client::connect_stream(config, channel.into_stream(), AcceptingHandler),
                )
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout()))?
                .map_err(|e| TransportError::NodeUnreachable(e.to_string()))?
            }
            None => {
                tracing::warn!(node = self.node, "no bastion reachable, connecting directly");
                let (host, port) = split_host_port(&self.node_addr, self.remote.port);
                tokio::time::timeout(
                    self.connect_timeout(),
                    client::connect(config, (host.as_str(), port), AcceptingHandler),
                )
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout()))?
                .map_err(|e| TransportError::NodeUnreachable(e.to_string()))?
            }
        };

        self.authenticate_node(&mut session).await?;
        self.jump = jump;
        self.session = Some(session);
        tracing::info!(node = self.node, addr = %self.node_addr, "transport connected");
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session
                .disconnect(Disconnect::ByApplication, "closing", "en")
                .await;
        }
        if let Some(jump) = self.jump.take() {
            let _ = jump
                .disconnect(Disconnect::ByApplication, "closing", "en")
                .await;
        }
    }

    /// Run a command on the current session without the reconnect dance.
    async fn raw_exec(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TransportError::Channel("not connected".to_string()))?;
        let work = async {
            let mut channel = session
                .channel_open_session()
                .await
                .map_err(|e| TransportError::Channel(e.to_string()))?;
            channel
                .exec(true, cmd)
                .await
                .map_err(|e| TransportError::Channel(e.to_string()))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_status = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status: code } => {
                        exit_status = Some(code as i32)
                    }
                    _ => {}
                }
            }
            Ok(ExecOutput {
                exit_status: exit_status.unwrap_or(EXIT_CHANNEL_CLOSED),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn probe(&self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if session.is_closed() {
            return false;
        }
        match self.raw_exec("echo alive", Duration::from_secs(5)).await {
            Ok(output) => output.stdout.trim() == "alive",
            Err(_) => false,
        }
    }

    /// Reconnect-before-fail: a dead channel is re-established once; a
    /// failure of that reconnect is what the caller sees.
    async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.probe().await {
            return Ok(());
        }
        if self.session.is_some() {
            tracing::warn!(node = self.node, "channel lost, re-establishing");
        }
        self.teardown().await;
        self.connect().await
    }
}

#[async_trait]
impl Transport for BastionTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let attempts = self.tuning.connect_attempts.max(1);
        let mut delay = Duration::from_secs(2);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.establish().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        node = self.node,
                        attempt,
                        attempts,
                        error = %err,
                        "connection attempt failed"
                    );
                    self.teardown().await;
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| TransportError::BastionUnreachable("no attempts made".to_string())))
    }

    async fn disconnect(&mut self) {
        self.teardown().await;
    }

    async fn is_channel_alive(&mut self) -> bool {
        self.probe().await
    }

    async fn exec(&mut self, cmd: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        self.ensure_connected().await?;
        self.raw_exec(cmd, timeout).await
    }

    async fn put_file(&mut self, bytes: &[u8], remote_path: &str) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TransportError::Channel("not connected".to_string()))?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| TransportError::Protocol(format!("{remote_path}: {e}")))?;
        file.write_all(bytes)
            .await
            .map_err(|e| TransportError::Protocol(format!("{remote_path}: {e}")))?;
        file.shutdown()
            .await
            .map_err(|e| TransportError::Protocol(format!("{remote_path}: {e}")))?;
        Ok(())
    }

    async fn read_file(&mut self, remote_path: &str) -> Result<String, TransportError> {
        self.ensure_connected().await?;
        // Missing files read as empty, same as a job that wrote nothing.
        let output = self
            .raw_exec(
                &format!("cat {remote_path} 2>/dev/null || true"),
                self.exec_timeout(),
            )
            .await?;
        Ok(output.stdout)
    }

    async fn is_alive_pid(&mut self, pid: u32) -> Result<bool, TransportError> {
        self.ensure_connected().await?;
        let output = self
            .raw_exec(
                &format!("ps -p {pid} > /dev/null 2>&1 && echo running || echo stopped"),
                self.exec_timeout(),
            )
            .await?;
        Ok(output.stdout.trim() == "running")
    }

    async fn kill_pid(&mut self, pid: u32) -> Result<bool, TransportError> {
        self.ensure_connected().await?;
        self.raw_exec(
            &format!("kill {pid} 2>/dev/null || true"),
            self.exec_timeout(),
        )
        .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.raw_exec(
            &format!("kill -9 {pid} 2>/dev/null || true"),
            self.exec_timeout(),
        )
        .await?;
        let output = self
            .raw_exec(
                &format!("ps -p {pid} > /dev/null 2>&1 && echo running || echo stopped"),
                self.exec_timeout(),
            )
            .await?;
        Ok(output.stdout.trim() == "stopped")
    }
}

fn default_identity_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".ssh/id_rsa")
}

fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), default_port),
        },
        None => (address.to_string(), default_port),
    }
}
