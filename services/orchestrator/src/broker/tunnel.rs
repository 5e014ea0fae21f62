//! Authenticated port-forwarding tunnels to remote nodes.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;

/// Who to authenticate as, and where.
#[derive(Clone)]
pub struct TunnelTarget {
    pub host: String,
    pub user: String,
    /// OpenSSH private key.
    pub private_key: String,
}

impl std::fmt::Debug for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTarget")
            .field("host", &self.host)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Forward `127.0.0.1:local_port` to `remote_host:remote_port` as seen from
/// the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// An open tunnel. Dropping it tears the tunnel down as well.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn local_port(&self) -> u16;

    /// Close the tunnel. Safe to call more than once.
    async fn disconnect(&mut self);
}

#[async_trait]
pub trait TunnelClient: Send + Sync {
    async fn open(
        &self,
        target: &TunnelTarget,
        forward: &PortForward,
    ) -> Result<Box<dyn Tunnel>, OrchestratorError>;
}

/// Tunnels through the system `ssh` client (`ssh -N -L`).
#[derive(Debug, Clone)]
pub struct SshTunnelClient {
    ssh_binary: PathBuf,
    ready_timeout: Duration,
}

impl Default for SshTunnelClient {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            ready_timeout: Duration::from_secs(15),
        }
    }
}

impl SshTunnelClient {
    pub fn new(ssh_binary: impl Into<PathBuf>, ready_timeout: Duration) -> Self {
        Self {
            ssh_binary: ssh_binary.into(),
            ready_timeout,
        }
    }

    fn write_key(private_key: &str) -> Result<NamedTempFile, OrchestratorError> {
        let io_err = |e: std::io::Error| {
            OrchestratorError::Connectivity(format!("failed to stage private key: {e}"))
        };
        // NamedTempFile is created with mode 0600.
        let mut file = tempfile::Builder::new()
            .prefix("sparkling-key-")
            .tempfile()
            .map_err(io_err)?;
        file.write_all(private_key.trim_end().as_bytes())
            .map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(file)
    }

    fn command(&self, target: &TunnelTarget, forward: &PortForward, key: &NamedTempFile) -> Command {
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.arg("-N")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-i")
            .arg(key.path())
            .arg("-L")
            .arg(format!(
                "127.0.0.1:{}:{}:{}",
                forward.local_port, forward.remote_host, forward.remote_port
            ))
            .arg(format!("{}@{}", target.user, target.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TunnelClient for SshTunnelClient {
    async fn open(
        &self,
        target: &TunnelTarget,
        forward: &PortForward,
    ) -> Result<Box<dyn Tunnel>, OrchestratorError> {
        let key = Self::write_key(&target.private_key)?;
        let mut child = self.command(target, forward, &key).spawn().map_err(|e| {
            OrchestratorError::Connectivity(format!("failed to spawn ssh: {e}"))
        })?;

        debug!(host = %target.host, local_port = forward.local_port, "waiting for ssh tunnel");

        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let stderr = read_stderr(&mut child).await;
                    return Err(OrchestratorError::Connectivity(format!(
                        "ssh to {}@{} exited with {status}: {}",
                        target.user,
                        target.host,
                        stderr.trim()
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(OrchestratorError::Connectivity(format!(
                        "failed to poll ssh process: {e}"
                    )));
                }
            }

            if TcpStream::connect(("127.0.0.1", forward.local_port)).await.is_ok() {
                info!(host = %target.host, local_port = forward.local_port, "ssh tunnel established");
                return Ok(Box::new(SshTunnel {
                    child: Some(child),
                    local_port: forward.local_port,
                    _key: key,
                }));
            }

            if tokio::time::Instant::now() >= deadline {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill ssh process");
                }
                return Err(OrchestratorError::Connectivity(format!(
                    "ssh tunnel to {} not ready within {:?}",
                    target.host, self.ready_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let mut out = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut out).await;
    }
    out
}

struct SshTunnel {
    child: Option<Child>,
    local_port: u16,
    _key: NamedTempFile,
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn disconnect(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(local_port = self.local_port, error = %e, "failed to kill ssh tunnel");
            } else {
                debug!(local_port = self.local_port, "ssh tunnel closed");
            }
        }
    }
}
