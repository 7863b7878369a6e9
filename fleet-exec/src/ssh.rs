//! SSH transport for remote command execution.
//!
//! One `SshClient` per execute call; every command gets a fresh channel on
//! that client. Commands stream stdout/stderr into buffers and race
//! against a deadline and a cancel signal; both losers get SIGTERM.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect, Sig};
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use fleet_core::credentials::{CredentialKind, CredentialProvider};
use fleet_core::server::Server;

use crate::command::{Command, ExecStatus};
use crate::error::ExecError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured output of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub status: ExecStatus,
}

/// Seam between the executor and the transport; tests substitute a fake.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one shell command line to completion, timeout or cancellation.
    async fn run(
        &self,
        command_line: &str,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<CommandOutput, ExecError>;

    /// Stream `content` to `path` on the remote, mode 600.
    async fn upload(&self, path: &str, content: &[u8]) -> Result<(), ExecError>;
}

/// Host keys are accepted without verification. Pinning is a deliberate
/// non-feature of this handler; a known-hosts handler implements the same
/// `russh` seam and replaces this type wholesale.
pub struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(self, _server_public_key: &key::PublicKey) -> Result<(Self, bool), Self::Error> {
        Ok((self, true))
    }
}

/// A live, authenticated SSH connection to one server.
#[derive(Clone)]
pub struct SshClient {
    handle: Arc<Handle<AcceptAnyHostKey>>,
    host: String,
}

impl SshClient {
    /// Resolve the server credential and dial, giving the dial 30 s.
    pub async fn connect(
        server: &Server,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self, ExecError> {
        let (content, kind) = credentials
            .credential_content(&server.credential_id)
            .await
            .map_err(|e| ExecError::Credential(e.to_string()))?;

        let config = Arc::new(client::Config::default());
        let connect = client::connect(config, (server.host.as_str(), server.port), AcceptAnyHostKey);
        let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| ExecError::Connect {
                host: server.host.clone(),
                port: server.port,
                reason: "connect timeout".to_string(),
            })?
            .map_err(|e| ExecError::Connect {
                host: server.host.clone(),
                port: server.port,
                reason: e.to_string(),
            })?;

        let authenticated = match kind {
            CredentialKind::SshKey => {
                let pair = russh_keys::decode_secret_key(&content, None)
                    .map_err(|e| ExecError::Credential(format!("decode private key: {e}")))?;
                handle
                    .authenticate_publickey(&server.username, Arc::new(pair))
                    .await
                    .map_err(|e| ExecError::Channel(e.to_string()))?
            }
            CredentialKind::Password => handle
                .authenticate_password(&server.username, &content)
                .await
                .map_err(|e| ExecError::Channel(e.to_string()))?,
        };
        if !authenticated {
            return Err(ExecError::AuthRejected {
                user: server.username.clone(),
                host: server.host.clone(),
            });
        }

        Ok(Self {
            handle: Arc::new(handle),
            host: server.host.clone(),
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("ssh disconnect from {}: {e}", self.host);
        }
    }
}

#[async_trait]
impl CommandRunner for SshClient {
    async fn run(
        &self,
        command_line: &str,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<CommandOutput, ExecError> {
        if *cancel.borrow() {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                status: ExecStatus::Cancelled,
            });
        }

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::Channel(e.to_string()))?;
        channel
            .exec(true, command_line)
            .await
            .map_err(|e| ExecError::Channel(e.to_string()))?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut exit_code: Option<i32> = None;
        let mut cancellable = true;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                _ = &mut deadline => {
                    let _ = channel.signal(Sig::TERM).await;
                    break ExecStatus::Timeout;
                }
                changed = cancel.changed(), if cancellable => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            let _ = channel.signal(Sig::TERM).await;
                            break ExecStatus::Cancelled;
                        }
                        Ok(()) => {}
                        // Sender gone: nobody can cancel any more.
                        Err(_) => cancellable = false,
                    }
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { ref data }) => stdout.extend_from_slice(data),
                        Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                            stderr.extend_from_slice(data)
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            exit_code = Some(exit_status as i32);
                        }
                        Some(_) => {}
                        None => {
                            break if exit_code == Some(0) {
                                ExecStatus::Success
                            } else {
                                ExecStatus::Failed
                            };
                        }
                    }
                }
            }
        };

        let _ = channel.close().await;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            status,
        })
    }

    async fn upload(&self, path: &str, content: &[u8]) -> Result<(), ExecError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::Channel(e.to_string()))?;
        channel
            .exec(true, format!("cat > {path} && chmod 600 {path}"))
            .await
            .map_err(|e| ExecError::Channel(e.to_string()))?;
        channel
            .data(content)
            .await
            .map_err(|e| ExecError::Channel(e.to_string()))?;
        channel
            .eof()
            .await
            .map_err(|e| ExecError::Channel(e.to_string()))?;

        let wait = async {
            let mut exit_code: Option<i32> = None;
            while let Some(msg) = channel.wait().await {
                if let ChannelMsg::ExitStatus { exit_status } = msg {
                    exit_code = Some(exit_status as i32);
                }
            }
            exit_code
        };
        let exit_code = tokio::time::timeout(UPLOAD_TIMEOUT, wait)
            .await
            .map_err(|_| ExecError::Channel(format!("upload to {path} timed out")))?;

        match exit_code {
            Some(0) => Ok(()),
            other => Err(ExecError::Channel(format!(
                "upload to {path} exited with {other:?}"
            ))),
        }
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the remote command line: working directory first, then exports,
/// then the user command.
pub fn build_command_line(cmd: &Command) -> String {
    let mut parts = Vec::with_capacity(2 + cmd.env.len());
    if let Some(dir) = &cmd.work_dir {
        parts.push(format!("cd {dir}"));
    }
    for (key, value) in &cmd.env {
        parts.push(format!("export {key}={}", shell_quote(value)));
    }
    parts.push(cmd.command.clone());
    parts.join(" && ")
}
