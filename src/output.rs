//! Output collection: merging per-entity files into the result tree and
//! emitting the two result surfaces.
//!
//! Layout under the run's result directory:
//!
//! ```text
//! results.json                  final array, clean run end only
//! streamed_results.jsonl        append-only, one record per finalized entity
//! dut-info.txt                  text rendering of the probed DUT info
//! run.log                       run-scoped log lines from bundles
//! tests/<entity>/log.txt        per-entity log
//! tests/<entity>/<file>         artifacts emitted by the entity
//! fixtures/<fixture>/log.txt    remote-fixture log
//! system_logs/, crashes/        sysinfo delta, see [`crate::dut`]
//! ```
//!
//! Collision rules: an artifact named like the per-entity log file is kept
//! under a fixed suffix instead of clobbering the log, and an entity name
//! that reappears within a run gets `.1`, `.2`, ... directory suffixes.
//! Copies are idempotent at the destination so a resumed run never
//! destroys what an earlier attempt already fetched.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::exec::{EntityResult, RunObserver};
use crate::registry::EntityKind;
use crate::transport::Transport;

/// Name of the controller-written per-entity log file.
pub const ENTITY_LOG_NAME: &str = "log.txt";

/// Suffix appended to an emitted artifact colliding with the log file.
pub const EMITTED_LOG_SUFFIX: &str = ".emitted";

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("result write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("result serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Paths of the persisted state under one result directory.
#[derive(Debug, Clone)]
pub struct ResultLayout {
    root: PathBuf,
}

impl ResultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results_json(&self) -> PathBuf {
        self.root.join("results.json")
    }

    pub fn streamed_results(&self) -> PathBuf {
        self.root.join("streamed_results.jsonl")
    }

    pub fn dut_info(&self) -> PathBuf {
        self.root.join("dut-info.txt")
    }

    pub fn run_log(&self) -> PathBuf {
        self.root.join("run.log")
    }

    fn entity_base(&self, kind: EntityKind) -> PathBuf {
        match kind {
            EntityKind::Test => self.root.join("tests"),
            EntityKind::Fixture => self.root.join("fixtures"),
        }
    }
}

/// Record appended to `streamed_results.jsonl` per finalized entity.
#[derive(Serialize)]
struct StreamedRecord<'a> {
    #[serde(flatten)]
    result: &'a EntityResult,
    /// Wall-clock duration in seconds, absent for incomplete entities.
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
}

/// Collects run output into the result tree as the stream is consumed.
///
/// Implements [`RunObserver`]; the execution loop feeds it events and it
/// takes care of directories, logs, artifact fetches, and the streamed
/// result file. The transport of the currently executing batch must be set
/// before the batch starts so artifact fetches go to the right host.
pub struct OutputCollector {
    layout: ResultLayout,
    batch_transport: Option<Arc<dyn Transport>>,
    /// How many times each entity name was seen, for `.N` dir suffixes.
    seen_counts: HashMap<String, usize>,
    /// Controller-side directories of currently open entities.
    open_dirs: HashMap<String, PathBuf>,
}

impl OutputCollector {
    pub fn new(layout: ResultLayout) -> Self {
        Self {
            layout,
            batch_transport: None,
            seen_counts: HashMap::new(),
            open_dirs: HashMap::new(),
        }
    }

    pub fn layout(&self) -> &ResultLayout {
        &self.layout
    }

    /// Sets the execution host artifacts are fetched from for the next
    /// batch. `None` disables fetching (used by list-only flows).
    pub fn set_batch_transport(&mut self, transport: Option<Arc<dyn Transport>>) {
        self.batch_transport = transport;
    }

    /// Writes the final result array. Called only at clean run end.
    pub fn write_results_json(&self, results: &[EntityResult]) -> Result<(), OutputError> {
        std::fs::create_dir_all(self.layout.root())?;
        let file = std::fs::File::create(self.layout.results_json())?;
        serde_json::to_writer_pretty(file, results)?;
        Ok(())
    }

    /// Persists the DUT info text rendering.
    pub fn write_dut_info(&self, rendered: &str) -> Result<(), OutputError> {
        std::fs::create_dir_all(self.layout.root())?;
        std::fs::write(self.layout.dut_info(), rendered)?;
        Ok(())
    }

    fn allocate_dir(&mut self, name: &str, kind: EntityKind) -> PathBuf {
        let count = self.seen_counts.entry(name.to_string()).or_insert(0);
        let dir_name = if *count == 0 {
            name.to_string()
        } else {
            format!("{name}.{count}")
        };
        *count += 1;
        self.layout.entity_base(kind).join(dir_name)
    }

    fn append_line(path: &Path, text: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{text}")
    }

    fn append_streamed(&self, result: &EntityResult) -> Result<(), OutputError> {
        let duration_secs = match (result.start, result.end) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };
        let record = StreamedRecord {
            result,
            duration_secs,
        };
        let line = serde_json::to_string(&record)?;
        Self::append_line(&self.layout.streamed_results(), &line)?;
        Ok(())
    }

    /// Fetches the entity's remote output directory and merges it into its
    /// controller-side directory, then removes the remote copy.
    async fn fetch_artifacts(&self, remote_dir: &str, dest: &Path) {
        let Some(transport) = &self.batch_transport else {
            return;
        };
        let remote = Path::new(remote_dir);
        let staging = match tempfile::tempdir() {
            Ok(staging) => staging,
            Err(e) => {
                warn!("could not stage artifact fetch: {e}");
                return;
            }
        };
        let staged = staging.path().join("out");
        if let Err(e) = transport.get_file(remote, &staged).await {
            // Artifacts are best effort; the result record stands without
            // them.
            warn!("artifact fetch from {remote_dir} failed: {e}");
            return;
        }
        if let Err(e) = merge_dir(&staged, dest) {
            warn!("artifact merge into {} failed: {e}", dest.display());
            return;
        }
        if let Err(e) = transport.remove_all(remote).await {
            debug!("could not remove {remote_dir} on execution host: {e}");
        }
    }
}

#[async_trait]
impl RunObserver for OutputCollector {
    async fn run_log(&mut self, text: &str) {
        if let Err(e) = Self::append_line(&self.layout.run_log(), text) {
            warn!("run log write failed: {e}");
        }
    }

    async fn entity_started(&mut self, name: &str, kind: EntityKind) {
        let dir = self.allocate_dir(name, kind);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("could not create {}: {e}", dir.display());
        }
        self.open_dirs.insert(name.to_string(), dir);
    }

    async fn entity_log(&mut self, name: &str, text: &str) {
        let Some(dir) = self.open_dirs.get(name) else {
            return;
        };
        if let Err(e) = Self::append_line(&dir.join(ENTITY_LOG_NAME), text) {
            warn!("entity log write failed: {e}");
        }
    }

    async fn entity_finished(&mut self, result: &EntityResult) {
        if let Err(e) = self.append_streamed(result) {
            warn!("streamed result write failed: {e}");
        }
        let Some(dir) = self.open_dirs.remove(&result.name) else {
            return;
        };
        if let Some(remote_dir) = &result.out_dir {
            self.fetch_artifacts(remote_dir, &dir).await;
        }
    }
}

/// Merges `src` into `dest`. A top-level file named [`ENTITY_LOG_NAME`]
/// that would collide with an existing log is kept under
/// [`EMITTED_LOG_SUFFIX`] so both survive.
fn merge_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let mut target = dest.join(&name);
        if entry.file_type()?.is_dir() {
            merge_dir(&entry.path(), &target)?;
            continue;
        }
        if name == ENTITY_LOG_NAME && target.exists() {
            target = dest.join(format!("{ENTITY_LOG_NAME}{EMITTED_LOG_SUFFIX}"));
        }
        std::fs::copy(entry.path(), target)?;
    }
    Ok(())
}
