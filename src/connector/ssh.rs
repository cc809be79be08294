//! SSH tunnel to a remote Docker socket.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{ConnectorError, DEFAULT_SOCKET};

/// A running `ssh -L` process forwarding a local unix socket to the remote
/// Docker socket. The process is killed and the socket removed on drop.
pub struct SshTunnel {
    _child: Child,
    socket: PathBuf,
}

impl SshTunnel {
    /// Start the tunnel and wait until the local socket appears.
    pub async fn open(
        user: Option<&str>,
        host: &str,
        port: Option<u16>,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let socket = std::env::temp_dir().join(format!(
            "fleetwatch-ssh-{}-{}.sock",
            std::process::id(),
            rand::random::<u32>()
        ));

        let mut child = Command::new("ssh")
            .args(ssh_args(user, host, port, &socket))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectorError::Unreachable(format!("failed to spawn ssh: {}", e)))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if socket.exists() {
                debug!("SSH tunnel to {} ready at {}", host, socket.display());
                return Ok(Self { _child: child, socket });
            }

            if let Ok(Some(_)) = child.try_wait() {
                let output = child
                    .wait_with_output()
                    .await
                    .map_err(|e| ConnectorError::Unreachable(e.to_string()))?;
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Err(classify_ssh_failure(&stderr));
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ConnectorError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket);
    }
}

fn ssh_args(user: Option<&str>, host: &str, port: Option<u16>, socket: &Path) -> Vec<String> {
    let mut args = vec![
        "-nNT".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-L".to_string(),
        format!("{}:{}", socket.display(), DEFAULT_SOCKET),
    ];
    if let Some(p) = port {
        args.push("-p".to_string());
        args.push(p.to_string());
    }
    args.push(match user {
        Some(u) => format!("{}@{}", u, host),
        None => host.to_string(),
    });
    args
}

fn classify_ssh_failure(stderr: &str) -> ConnectorError {
    if stderr.contains("Permission denied") || stderr.contains("Host key verification failed") {
        ConnectorError::Auth(stderr.to_string())
    } else if stderr.contains("Could not resolve hostname") {
        ConnectorError::InvalidAddress(stderr.to_string())
    } else {
        ConnectorError::Unreachable(format!("ssh exited: {}", stderr))
    }
}
