//! Transports for executing bundle processes on the controller or a DUT.
//!
//! A [`Transport`] spawns a program on its execution host with stdio piped,
//! copies file trees back to the controller, and answers liveness probes.
//! Two implementations share the interface:
//!
//! - [`local::LocalTransport`] spawns a child process directly.
//! - [`ssh::SshTransport`] execs the program through the system `ssh`
//!   client with a fixed `env [VAR=VAL ...] <path>` command layout.
//!
//! Both return a [`ProcessHandle`], so everything above the spawn call is
//! transport-agnostic. Stderr is drained into a one-line diagnostic buffer
//! as the process runs; the first line is appended to errors so the root
//! cause survives the child's death.

pub mod local;
pub mod ssh;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdout};
use tracing::debug;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by transports and process handles.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to connect to {0}")]
    ConnectFailed(String),

    #[error("command failed: {0}")]
    ExecFailed(String),

    #[error("file copy failed: {0}")]
    CopyFailed(String),

    #[error("liveness probe failed: {0}")]
    PingFailed(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("process exited with {status}{diagnostic}")]
    ExitedNonZero {
        status: ExitStatus,
        diagnostic: String,
    },

    #[error("malformed response: {0}")]
    BadResponse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Executes programs on one host, local or remote.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Spawns the program at `path` with the given extra environment, stdio
    /// piped. The request is written by the caller via the returned handle.
    async fn spawn(&self, path: &str, env: &[(String, String)]) -> TransportResult<ProcessHandle>;

    /// Runs a short shell command and returns its trimmed stdout.
    async fn exec_capture(&self, command: &str) -> TransportResult<String>;

    /// Copies a file tree from the execution host into `dest` on the
    /// controller, preserving symlinks. Idempotent at the destination.
    async fn get_file(&self, src: &Path, dest: &Path) -> TransportResult<()>;

    /// Removes a path tree on the execution host.
    async fn remove_all(&self, path: &Path) -> TransportResult<()>;

    /// Cheap liveness probe with a bounded timeout.
    async fn ping(&self, timeout: Duration) -> TransportResult<()>;

    /// Human-readable host description for logs and diagnostics.
    fn describe(&self) -> String;
}

/// A spawned bundle process with piped stdio.
///
/// Stderr is drained by a background task from the moment of creation so
/// the child can never block on a full pipe; only the first line is kept.
pub struct ProcessHandle {
    child: Child,
    stdin: Option<tokio::process::ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_first_line: Arc<Mutex<Option<String>>>,
    stderr_drain: Option<tokio::task::JoinHandle<()>>,
}

impl ProcessHandle {
    /// Wraps a freshly spawned child. The child must have been created with
    /// stdin, stdout, and stderr piped.
    pub fn new(mut child: Child) -> Self {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_first_line = Arc::new(Mutex::new(None));
        let stderr_drain = child.stderr.take().map(|stderr| {
            let buffer = Arc::clone(&stderr_first_line);
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut guard = buffer.lock().expect("stderr buffer poisoned");
                    if guard.is_none() && !line.trim().is_empty() {
                        *guard = Some(line);
                    }
                }
            })
        });
        Self {
            child,
            stdin,
            stdout,
            stderr_first_line,
            stderr_drain,
        }
    }

    /// Serializes the request onto stdin and closes it, signalling the
    /// bundle that no further input follows.
    pub async fn send_request<T: Serialize>(&mut self, request: &T) -> TransportResult<()> {
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| TransportError::ExecFailed("stdin already consumed".into()))?;
        let mut body = serde_json::to_vec(request)?;
        body.push(b'\n');
        stdin.write_all(&body).await?;
        stdin.shutdown().await?;
        Ok(())
    }

    /// Takes ownership of the stdout pipe, for streaming modes.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Takes ownership of the stdin pipe for callers that keep the request
    /// channel open, such as the long-lived fixture service.
    pub fn take_stdin(&mut self) -> Option<tokio::process::ChildStdin> {
        self.stdin.take()
    }

    /// Reads stdout to completion and decodes a single JSON object, the
    /// request/response idiom used by the non-streaming modes.
    pub async fn read_response<T: DeserializeOwned>(&mut self) -> TransportResult<T> {
        use tokio::io::AsyncReadExt;
        let mut stdout = self
            .stdout
            .take()
            .ok_or_else(|| TransportError::ExecFailed("stdout already consumed".into()))?;
        let mut raw = Vec::new();
        stdout.read_to_end(&mut raw).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Waits for the child to exit, killing it when the grace period runs
    /// out. A non-zero exit carries the first stderr line as a diagnostic.
    pub async fn wait(&mut self, grace: Duration) -> TransportResult<ExitStatus> {
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                debug!("process did not exit within {grace:?}, killing");
                self.kill().await;
                return Err(TransportError::Timeout(grace));
            }
        };
        // Let the drain task reach pipe EOF so the diagnostic is complete.
        if let Some(drain) = self.stderr_drain.take() {
            let _ = drain.await;
        }
        if status.success() {
            Ok(status)
        } else {
            Err(TransportError::ExitedNonZero {
                status,
                diagnostic: self
                    .stderr_first_line()
                    .map(|line| format!(": {line}"))
                    .unwrap_or_default(),
            })
        }
    }

    /// Terminates the child, ignoring errors from an already-dead process.
    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// First non-empty line the child wrote to stderr, if any.
    pub fn stderr_first_line(&self) -> Option<String> {
        self.stderr_first_line
            .lock()
            .expect("stderr buffer poisoned")
            .clone()
    }
}

/// Address and credentials of one SSH-reachable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    /// Environment variables forwarded to remote commands, typically the
    /// proxy settings of the controller.
    pub forward_env: Vec<(String, String)>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: "root".to_string(),
            port: 22,
            key_path: None,
            forward_env: Vec::new(),
        }
    }
}

/// Opens connections to DUTs. The cache calls through this so tests can
/// substitute fakes for real SSH.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> TransportResult<DutConnection>;
}

/// A live connection to one DUT plus the identity captured at connect time.
#[derive(Clone)]
pub struct DutConnection {
    pub transport: Arc<dyn Transport>,
    /// Kernel boot identifier read right after connecting. Diagnosis
    /// compares it later to tell a reboot from a network drop.
    pub boot_id: Option<String>,
}

/// Role name of the primary DUT in the connection cache.
pub const PRIMARY_ROLE: &str = "";

/// Owns every DUT connection for a run, keyed by role.
///
/// The primary DUT uses [`PRIMARY_ROLE`]; companions use their configured
/// role names. Reconnection after a drop serializes through the cache so
/// concurrent borrowers never race to redial the same device.
pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    targets: HashMap<String, SshTarget>,
    connections: tokio::sync::Mutex<HashMap<String, DutConnection>>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>, targets: HashMap<String, SshTarget>) -> Self {
        Self {
            connector,
            targets,
            connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Roles known to the cache, primary first.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.targets.keys().cloned().collect();
        roles.sort();
        roles
    }

    /// Returns the connection for a role, dialing it on first use.
    pub async fn get(&self, role: &str) -> TransportResult<DutConnection> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(role) {
            return Ok(conn.clone());
        }
        let target = self
            .targets
            .get(role)
            .ok_or_else(|| TransportError::ConnectFailed(format!("unknown role {role:?}")))?;
        let conn = self.connector.connect(target).await?;
        connections.insert(role.to_string(), conn.clone());
        Ok(conn)
    }

    /// Convenience accessor for the primary DUT.
    pub async fn primary(&self) -> TransportResult<DutConnection> {
        self.get(PRIMARY_ROLE).await
    }

    /// Drops the cached connection for a role and dials a fresh one.
    pub async fn reconnect(&self, role: &str) -> TransportResult<DutConnection> {
        let mut connections = self.connections.lock().await;
        connections.remove(role);
        let target = self
            .targets
            .get(role)
            .ok_or_else(|| TransportError::ConnectFailed(format!("unknown role {role:?}")))?;
        let conn = self.connector.connect(target).await?;
        connections.insert(role.to_string(), conn.clone());
        Ok(conn)
    }
}
