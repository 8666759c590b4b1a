//! Transport that runs bundles as local child processes.
//!
//! Used for controller-side (remote) bundles and for driving everything
//! in-process during development. File "copies" are real copies rather than
//! renames so the semantics match the SSH transport: the source stays
//! intact until the caller removes it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use super::{ProcessHandle, Transport, TransportError, TransportResult};

/// Spawns bundle processes on the controller itself.
#[derive(Debug, Default)]
pub struct LocalTransport {
    working_dir: Option<PathBuf>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn spawn(&self, path: &str, env: &[(String, String)]) -> TransportResult<ProcessHandle> {
        let mut cmd = tokio::process::Command::new(path);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        let child = cmd.spawn().map_err(|source| TransportError::SpawnFailed {
            program: path.to_string(),
            source,
        })?;
        Ok(ProcessHandle::new(child))
    }

    async fn exec_capture(&self, command: &str) -> TransportResult<String> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", command]);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(TransportError::ExecFailed(format!(
                "{command:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn get_file(&self, src: &Path, dest: &Path) -> TransportResult<()> {
        copy_tree(src.to_path_buf(), dest.to_path_buf()).await
    }

    async fn remove_all(&self, path: &Path) -> TransportResult<()> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            // Nothing to remove.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn ping(&self, _timeout: Duration) -> TransportResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }
}

/// Recursively copies a tree, preserving symlinks as symlinks and
/// overwriting existing files so repeated copies converge.
fn copy_tree(
    src: PathBuf,
    dest: PathBuf,
) -> futures::future::BoxFuture<'static, TransportResult<()>> {
    use futures::FutureExt;
    async move {
        let meta = tokio::fs::symlink_metadata(&src)
            .await
            .map_err(|e| TransportError::CopyFailed(format!("{}: {e}", src.display())))?;
        if meta.file_type().is_symlink() {
            let link = tokio::fs::read_link(&src).await?;
            if tokio::fs::symlink_metadata(&dest).await.is_ok() {
                tokio::fs::remove_file(&dest).await?;
            }
            tokio::fs::symlink(link, &dest).await?;
        } else if meta.is_dir() {
            tokio::fs::create_dir_all(&dest).await?;
            let mut entries = tokio::fs::read_dir(&src).await?;
            while let Some(entry) = entries.next_entry().await? {
                copy_tree(entry.path(), dest.join(entry.file_name())).await?;
            }
        } else {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&src, &dest)
                .await
                .map_err(|e| TransportError::CopyFailed(format!("{}: {e}", src.display())))?;
        }
        Ok(())
    }
    .boxed()
}
