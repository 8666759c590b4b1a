//! Transport that execs bundles on a DUT through the system `ssh` client.
//!
//! Connections are transient: every operation spawns an `ssh` or `scp`
//! process, which keeps the controller free of connection-pool state and
//! survives DUT reboots without special handling. The remote command layout
//! is fixed at `env [VAR=VAL ...] <bundle-path>` so proxy settings can be
//! forwarded without a login shell interpreting anything else.
//!
//! # Prerequisites
//!
//! - Key-based authentication (`BatchMode=yes`, no password prompts)
//! - `ssh` and `scp` available on the controller
//!
//! File copies preserve symlinks; cleanup on the DUT side is a plain
//! `rm -rf -- <path>` after the copy lands.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    Connector, DutConnection, ProcessHandle, SshTarget, Transport, TransportError, TransportResult,
};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Executes commands on one SSH-reachable DUT.
pub struct SshTransport {
    target: SshTarget,
    ssh_opts: Vec<String>,
}

impl SshTransport {
    pub fn new(target: SshTarget) -> Self {
        let mut ssh_opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
        ];
        if let Some(key_path) = &target.key_path {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            ssh_opts.push("-i".to_string());
            ssh_opts.push(key);
        }
        Self { target, ssh_opts }
    }

    fn dest(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    fn ssh_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        for opt in &self.ssh_opts {
            cmd.arg(opt);
        }
        cmd.arg("-p");
        cmd.arg(self.target.port.to_string());
        cmd.arg(self.dest());
        cmd
    }

    /// Builds the remote command line for a bundle invocation.
    fn remote_command(&self, path: &str, env: &[(String, String)]) -> String {
        let mut words: Vec<String> = Vec::with_capacity(env.len() + 2);
        words.push("env".to_string());
        for (key, value) in self.target.forward_env.iter().chain(env) {
            words.push(format!("{key}={value}"));
        }
        words.push(path.to_string());
        shell_words::join(&words)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn spawn(&self, path: &str, env: &[(String, String)]) -> TransportResult<ProcessHandle> {
        let remote = self.remote_command(path, env);
        debug!(host = %self.target.host, command = %remote, "spawning remote bundle");
        let mut cmd = self.ssh_command();
        cmd.arg(remote);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        let child = cmd.spawn().map_err(|source| TransportError::SpawnFailed {
            program: format!("ssh {}", self.dest()),
            source,
        })?;
        Ok(ProcessHandle::new(child))
    }

    async fn exec_capture(&self, command: &str) -> TransportResult<String> {
        let mut cmd = self.ssh_command();
        cmd.arg(command);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(TransportError::ExecFailed(format!(
                "{command:?} on {} exited with {}: {}",
                self.target.host,
                output.status,
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .next()
                    .unwrap_or_default()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn get_file(&self, src: &Path, dest: &Path) -> TransportResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = tokio::process::Command::new("scp");
        // -p preserves modes and times; scp copies symlink targets, so the
        // preserve-symlinks policy rides on the remote side emitting real
        // files for anything it needs intact.
        cmd.arg("-r");
        cmd.arg("-p");
        cmd.arg("-q");
        for opt in &self.ssh_opts {
            cmd.arg(opt);
        }
        cmd.arg("-P");
        cmd.arg(self.target.port.to_string());
        cmd.arg(format!("{}:{}", self.dest(), src.display()));
        cmd.arg(dest);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(TransportError::CopyFailed(format!(
                "scp from {}:{} failed: {}",
                self.target.host,
                src.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> TransportResult<()> {
        let path = path.display().to_string();
        let command = shell_words::join(["rm", "-rf", "--", path.as_str()]);
        self.exec_capture(&command).await.map(|_| ())
    }

    async fn ping(&self, timeout: Duration) -> TransportResult<()> {
        let mut cmd = self.ssh_command();
        cmd.arg("true");
        cmd.stdin(Stdio::null());
        let result = tokio::time::timeout(timeout, cmd.output()).await;
        match result {
            Err(_) => Err(TransportError::PingFailed(format!(
                "no response from {} within {timeout:?}",
                self.target.host
            ))),
            Ok(Err(e)) => Err(TransportError::PingFailed(e.to_string())),
            Ok(Ok(output)) if !output.status.success() => {
                Err(TransportError::PingFailed(format!(
                    "{}: {}",
                    self.target.host,
                    String::from_utf8_lossy(&output.stderr)
                        .lines()
                        .next()
                        .unwrap_or("ssh exited non-zero")
                )))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.target.host, self.target.port)
    }
}

/// Dials DUTs over SSH and captures the boot identifier for diagnosis.
#[derive(Debug, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &SshTarget) -> TransportResult<DutConnection> {
        let transport = SshTransport::new(target.clone());
        transport
            .ping(Duration::from_secs(10))
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {e}", target.host)))?;
        let boot_id = match transport.exec_capture(&format!("cat {BOOT_ID_PATH}")).await {
            Ok(id) if !id.is_empty() => Some(id),
            Ok(_) => None,
            Err(e) => {
                warn!(host = %target.host, "could not read boot id: {e}");
                None
            }
        };
        Ok(DutConnection {
            transport: Arc::new(transport),
            boot_id,
        })
    }
}

/// Reads the DUT's current boot identifier through an existing transport.
pub async fn read_boot_id(transport: &dyn Transport) -> TransportResult<String> {
    transport.exec_capture(&format!("cat {BOOT_ID_PATH}")).await
}
