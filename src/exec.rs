//! Driver of a single `RunTests` bundle invocation.
//!
//! The loop starts the runner, consumes its control stream to completion,
//! and turns what it saw into per-entity results plus the list of expected
//! tests that never started. It is deliberately pessimistic: a runner that
//! dies mid-test, stops heartbeating, or reports a fatal run error still
//! produces a result record for every test that started, synthesized with
//! an incompleteness marker so downstream consumers never see a test vanish.
//!
//! # Failure classification
//!
//! | Observation                           | [`RunFailure`] kind |
//! |---------------------------------------|---------------------|
//! | Bundle reported a fatal error         | `RunError`          |
//! | Child died or stream closed early     | `RunnerExit`        |
//! | Watchdog fired between events         | `MsgTimeout`        |
//! | Stream violated the ordering contract | `Protocol`          |
//! | Context cancelled                     | `Cancelled`         |
//! | `max_test_failures` reached           | `Terminated`        |
//!
//! `Protocol`, `Cancelled`, and `Terminated` are terminal: the retry
//! coordinator never retries them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bundle::{DownloadMode, RunTestsArgs};
use crate::diagnose::Diagnoser;
use crate::protocol::{ErrorReport, Event, EventReader, ProtocolError, StreamError};
use crate::registry::EntityKind;
use crate::runner::{RunnerClient, RunnerError};

/// Error message attached to every synthesized record of a test that
/// started but never ended.
pub const INCOMPLETE_TEST_MSG: &str = "test did not finish";

/// Prefix of the error carrying the run-wide cause into a synthetic record.
pub const GLOBAL_ERROR_PREFIX: &str = "Got global error";

/// Cause string used when the stream closed without a RunEnd or RunError.
pub const NO_RUN_END_MSG: &str = "no RunEnd message";

/// Formats a fixture SetUp failure inherited by a descendant test.
pub fn fixture_failure_error(fixture: &str, reason: &str) -> String {
    format!("[Fixture failure] {fixture}: {reason}")
}

/// Result of one entity that was started (or skipped) during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResult {
    pub name: String,
    pub kind: EntityKind,

    /// When the entity began. Absent for entities skipped before execution.
    pub start: Option<DateTime<Utc>>,

    /// When the entity finished. Absent means the entity never ended; in
    /// that case `errors` is non-empty and carries [`INCOMPLETE_TEST_MSG`].
    pub end: Option<DateTime<Utc>>,

    pub errors: Vec<ErrorReport>,

    /// Deterministic non-execution reason. Exclusive with errors from an
    /// actual run.
    pub skip_reason: Option<String>,

    /// Output directory on the execution host announced at entity start.
    pub out_dir: Option<String>,
}

impl EntityResult {
    /// A record for a test that was never sent to a runner.
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntityKind::Test,
            start: None,
            end: None,
            errors: Vec::new(),
            skip_reason: Some(reason.into()),
            out_dir: None,
        }
    }

    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Fatal, run-scoped failures. Entity errors and skips never appear here;
/// they stay attached to individual results.
#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error("run aborted by bundle: {0}")]
    RunError(String),

    #[error("test runner error: {0}")]
    RunnerExit(String),

    #[error("no control message received within {0:?}")]
    MsgTimeout(Duration),

    #[error("control stream protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("run cancelled")]
    Cancelled,

    #[error("maximum test failure count reached")]
    Terminated,

    #[error("failed to start test runner: {0}")]
    StartFailed(String),
}

impl RunFailure {
    /// Whether the retry coordinator must give up regardless of progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunFailure::Cancelled | RunFailure::Terminated | RunFailure::Protocol(_)
        )
    }

    /// The cause string written into synthetic records.
    pub fn cause(&self) -> String {
        match self {
            RunFailure::RunError(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Outcome of one `RunTests` invocation, handed to the retry coordinator.
#[derive(Debug, Default)]
pub struct Attempt {
    pub results: Vec<EntityResult>,

    /// Expected tests that never started, in announcement order. `None`
    /// when the runner died before reporting anything.
    pub unstarted: Option<Vec<String>>,

    pub failure: Option<RunFailure>,
}

/// Receives run progress as the stream is consumed. Implemented by the
/// output collector; tests use [`NullObserver`].
#[async_trait]
pub trait RunObserver: Send {
    async fn run_log(&mut self, _text: &str) {}
    async fn entity_started(&mut self, _name: &str, _kind: EntityKind) {}
    async fn entity_log(&mut self, _name: &str, _text: &str) {}
    /// Called once per finalized entity, synthetic records included.
    async fn entity_finished(&mut self, _result: &EntityResult) {}
}

/// Observer that discards everything.
pub struct NullObserver;

#[async_trait]
impl RunObserver for NullObserver {}

/// Static parameters of a `RunTests` invocation, shared across retries.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub data_dir: String,
    pub out_dir: String,
    pub tmp_dir: String,
    pub test_vars: HashMap<String, String>,
    pub devservers: Vec<String>,
    pub tlw_server: Option<String>,
    pub build_artifacts_url: Option<String>,
    pub download_mode: DownloadMode,

    /// Inter-event liveness watchdog.
    pub msg_timeout: Duration,

    /// Grace period for the child to exit after its stream closes.
    pub runner_wait_timeout: Duration,

    /// Stop the run once this many tests have failed. Zero means unlimited.
    pub max_test_failures: usize,

    pub heartbeat_interval_secs: u64,

    /// Ancestor fixture already set up by the controller, with the errors
    /// its SetUp raised. Inherited by every test in the batch.
    pub start_fixture_name: String,
    pub setup_errors: Vec<ErrorReport>,

    /// Per-test diagnostics injected before the test's own errors, used for
    /// dependency-check failures.
    pub pre_test_errors: HashMap<String, Vec<String>>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            out_dir: String::new(),
            tmp_dir: String::new(),
            test_vars: HashMap::new(),
            devservers: Vec::new(),
            tlw_server: None,
            build_artifacts_url: None,
            download_mode: DownloadMode::Batch,
            msg_timeout: Duration::from_secs(60),
            runner_wait_timeout: Duration::from_secs(10),
            max_test_failures: 0,
            heartbeat_interval_secs: 30,
            start_fixture_name: String::new(),
            setup_errors: Vec::new(),
            pre_test_errors: HashMap::new(),
        }
    }
}

/// Drives one bundle invocation and classifies its outcome.
pub struct TestExecutor<'a> {
    client: &'a RunnerClient,
    config: ExecConfig,
    diagnoser: Option<&'a dyn Diagnoser>,
}

impl<'a> TestExecutor<'a> {
    pub fn new(client: &'a RunnerClient, config: ExecConfig) -> Self {
        Self {
            client,
            config,
            diagnoser: None,
        }
    }

    /// Attaches a diagnoser consulted when the run fails globally.
    pub fn with_diagnoser(mut self, diagnoser: &'a dyn Diagnoser) -> Self {
        self.diagnoser = Some(diagnoser);
        self
    }

    fn build_args(&self, patterns: &[String]) -> RunTestsArgs {
        RunTestsArgs {
            patterns: patterns.to_vec(),
            data_dir: self.config.data_dir.clone(),
            out_dir: self.config.out_dir.clone(),
            tmp_dir: self.config.tmp_dir.clone(),
            test_vars: self.config.test_vars.clone(),
            devservers: self.config.devservers.clone(),
            tlw_server: self.config.tlw_server.clone(),
            build_artifacts_url: self.config.build_artifacts_url.clone(),
            download_mode: self.config.download_mode,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
            start_fixture_name: self.config.start_fixture_name.clone(),
            start_fixture_errors: self.config.setup_errors.clone(),
        }
    }

    /// Errors prepended to a test's own, in inheritance order.
    fn inherited_errors(&self, name: &str) -> Vec<ErrorReport> {
        let mut inherited = Vec::new();
        for setup_error in &self.config.setup_errors {
            inherited.push(ErrorReport::new(fixture_failure_error(
                &self.config.start_fixture_name,
                &setup_error.reason,
            )));
        }
        if let Some(check_errors) = self.config.pre_test_errors.get(name) {
            inherited.extend(check_errors.iter().map(ErrorReport::new));
        }
        inherited
    }

    /// Runs the given tests once and collects everything the stream said.
    pub async fn run(
        &self,
        patterns: &[String],
        cancel: &CancellationToken,
        observer: &mut dyn RunObserver,
    ) -> Attempt {
        let mut run = match self.client.start_run(self.build_args(patterns)).await {
            Ok(run) => run,
            Err(e) => {
                error!("runner failed to start: {e}");
                return Attempt {
                    results: Vec::new(),
                    unstarted: None,
                    failure: Some(RunFailure::StartFailed(e.to_string())),
                };
            }
        };

        let mut reader = EventReader::new(run.stdout, self.config.msg_timeout);
        // Open entities in start order. Fixtures bracket tests, so this is
        // FIFO for synthesis and matches the stream's nesting.
        let mut open: Vec<EntityResult> = Vec::new();
        let mut results: Vec<EntityResult> = Vec::new();
        let mut counted = 0usize;
        let mut test_failures = 0usize;
        let mut failure: Option<RunFailure> = None;

        loop {
            match reader.next_event(cancel).await {
                Ok(Some(event)) => {
                    self.apply_event(event, &mut open, &mut results, observer)
                        .await;
                    for finished in &results[counted..] {
                        if finished.kind == EntityKind::Test && finished.failed() {
                            test_failures += 1;
                        }
                    }
                    counted = results.len();
                    if self.config.max_test_failures > 0
                        && test_failures >= self.config.max_test_failures
                    {
                        // Stop immediately: buffered events past this point
                        // belong to tests the cap was meant to prevent.
                        warn!("reached {test_failures} test failures, terminating run");
                        failure = Some(RunFailure::Terminated);
                        run.process.kill().await;
                        break;
                    }
                }
                Ok(None) => break,
                Err(StreamError::Cancelled) => {
                    info!("run cancelled, terminating runner");
                    failure = Some(RunFailure::Cancelled);
                    run.process.kill().await;
                    // Buffered events may still name entities we care about.
                    self.drain_remaining(&mut reader, &mut open, &mut results, observer)
                        .await;
                    break;
                }
                Err(StreamError::MsgTimeout(t)) => {
                    error!("no control message within {t:?}, killing runner");
                    failure = Some(RunFailure::MsgTimeout(t));
                    run.process.kill().await;
                    break;
                }
                Err(StreamError::Protocol(e)) => {
                    error!("control stream protocol violation: {e}");
                    failure = Some(RunFailure::Protocol(e));
                    run.process.kill().await;
                    break;
                }
                Err(StreamError::Io(e)) => {
                    error!("control stream read failed: {e}");
                    failure = Some(RunFailure::RunnerExit(e.to_string()));
                    break;
                }
            }
        }

        let summary = reader.into_summary();

        // Collect exit status; a dirty exit becomes the failure if the
        // stream itself looked clean.
        match run.process.wait(self.config.runner_wait_timeout).await {
            Ok(_) => {}
            Err(wait_err) => {
                if failure.is_none() && summary.run_error.is_none() {
                    failure = Some(RunFailure::RunnerExit(wait_err.to_string()));
                }
            }
        }

        if failure.is_none() {
            if let Some(run_error) = &summary.run_error {
                failure = Some(RunFailure::RunError(run_error.reason.clone()));
            } else if !summary.run_ended {
                failure = Some(RunFailure::RunnerExit(NO_RUN_END_MSG.to_string()));
            }
        }

        // Synthesize completion for everything still open.
        if !open.is_empty() {
            let cause = failure
                .as_ref()
                .map(|f| f.cause())
                .unwrap_or_else(|| NO_RUN_END_MSG.to_string());
            let diagnosis = match (&failure, self.diagnoser) {
                (Some(_), Some(diagnoser)) => {
                    diagnoser.diagnose(&self.config.out_dir).await
                }
                _ => String::new(),
            };
            let global_error = if diagnosis.is_empty() {
                format!("{GLOBAL_ERROR_PREFIX}: {cause}")
            } else {
                diagnosis
            };
            for mut pending in open.drain(..) {
                // Keep one original error at most, then the global cause,
                // then the incompleteness marker.
                if pending.errors.len() > 1 {
                    pending.errors = vec![pending.errors.pop().expect("len checked")];
                }
                pending.errors.push(ErrorReport::new(global_error.clone()));
                pending.errors.push(ErrorReport::new(INCOMPLETE_TEST_MSG));
                pending.end = None;
                observer.entity_finished(&pending).await;
                results.push(pending);
            }
        }

        if let Some(f) = &failure {
            error!("run failed: {f}");
        }

        Attempt {
            results,
            unstarted: summary.unstarted(),
            failure,
        }
    }

    async fn apply_event(
        &self,
        event: Event,
        open: &mut Vec<EntityResult>,
        results: &mut Vec<EntityResult>,
        observer: &mut dyn RunObserver,
    ) {
        match event {
            Event::RunStart { names, .. } => {
                info!("runner announced {} tests", names.len());
            }
            Event::RunLog { text, .. } => observer.run_log(&text).await,
            Event::EntityStart {
                time,
                entity,
                out_dir,
            } => {
                observer.entity_started(&entity.name, entity.kind).await;
                open.push(EntityResult {
                    name: entity.name.clone(),
                    kind: entity.kind,
                    start: Some(time),
                    end: None,
                    errors: if entity.kind == EntityKind::Test {
                        self.inherited_errors(&entity.name)
                    } else {
                        Vec::new()
                    },
                    skip_reason: None,
                    out_dir: if out_dir.is_empty() {
                        None
                    } else {
                        Some(out_dir)
                    },
                });
            }
            Event::EntityLog { name, text, .. } => observer.entity_log(&name, &text).await,
            Event::EntityError { name, error, .. } => {
                if let Some(pending) = open.iter_mut().find(|e| e.name == name) {
                    pending.errors.push(error);
                }
            }
            Event::EntityEnd {
                time,
                name,
                skip_reasons,
                ..
            } => {
                let Some(pos) = open.iter().position(|e| e.name == name) else {
                    return;
                };
                let mut finished = open.remove(pos);
                finished.end = Some(time);
                if !skip_reasons.is_empty() {
                    finished.skip_reason = Some(skip_reasons.join("; "));
                }
                observer.entity_finished(&finished).await;
                results.push(finished);
            }
            Event::RunError { error, .. } => {
                error!("bundle reported fatal error: {}", error.reason);
            }
            Event::RunEnd { .. } | Event::Heartbeat { .. } => {}
        }
    }

    /// Pulls whatever the killed child already buffered, bounded so a
    /// broken pipe cannot stall shutdown.
    async fn drain_remaining(
        &self,
        reader: &mut EventReader<tokio::process::ChildStdout>,
        open: &mut Vec<EntityResult>,
        results: &mut Vec<EntityResult>,
        observer: &mut dyn RunObserver,
    ) {
        let drain_cancel = CancellationToken::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let next = tokio::time::timeout_at(deadline, reader.next_event(&drain_cancel)).await;
            match next {
                Ok(Ok(Some(event))) => {
                    self.apply_event(event, open, results, observer).await;
                }
                _ => break,
            }
        }
    }
}

/// Maps a runner-client error into the run failure taxonomy.
impl From<RunnerError> for RunFailure {
    fn from(e: RunnerError) -> Self {
        RunFailure::StartFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EntityInfo, encode_event};
    use crate::transport::local::LocalTransport;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_info(name: &str) -> EntityInfo {
        EntityInfo {
            name: name.to_string(),
            kind: EntityKind::Test,
        }
    }

    fn run_start(names: &[&str]) -> Event {
        Event::RunStart {
            time: now(),
            names: names.iter().map(|n| n.to_string()).collect(),
            count: names.len(),
        }
    }

    fn start(name: &str) -> Event {
        Event::EntityStart {
            time: now(),
            entity: test_info(name),
            out_dir: String::new(),
        }
    }

    fn end(name: &str) -> Event {
        Event::EntityEnd {
            time: now(),
            name: name.to_string(),
            skip_reasons: vec![],
            timing: None,
        }
    }

    fn entity_error(name: &str, reason: &str) -> Event {
        Event::EntityError {
            time: now(),
            name: name.to_string(),
            error: ErrorReport::new(reason),
        }
    }

    fn run_end() -> Event {
        Event::RunEnd {
            time: now(),
            out_dir: String::new(),
        }
    }

    /// Writes a fake bundle that drains stdin and replays a canned stream.
    fn fake_bundle(dir: &std::path::Path, events: Vec<Event>, trailer: &str) -> String {
        let stream: Vec<u8> = events.into_iter().flat_map(encode_event).collect();
        let stream_path = dir.join("stream.bin");
        std::fs::write(&stream_path, stream).unwrap();
        let script = dir.join("bundle");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat >/dev/null\ncat '{}'\n{trailer}",
                stream_path.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_str().unwrap().to_string()
    }

    fn client_for(path: String) -> RunnerClient {
        RunnerClient::new(Arc::new(LocalTransport::new()), path)
    }

    async fn run_with_config(
        path: String,
        patterns: &[&str],
        config: ExecConfig,
    ) -> Attempt {
        let client = client_for(path);
        let executor = TestExecutor::new(&client, config);
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        executor
            .run(&patterns, &CancellationToken::new(), &mut NullObserver)
            .await
    }

    #[tokio::test]
    async fn happy_path_two_tests() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(
            dir.path(),
            vec![
                run_start(&["t1", "t2"]),
                start("t1"),
                end("t1"),
                start("t2"),
                entity_error("t2", "boom"),
                end("t2"),
                run_end(),
            ],
            "",
        );
        let attempt = run_with_config(path, &["t1", "t2"], ExecConfig::default()).await;

        assert!(attempt.failure.is_none(), "failure: {:?}", attempt.failure);
        assert_eq!(attempt.unstarted, Some(vec![]));
        assert_eq!(attempt.results.len(), 2);
        let t1 = &attempt.results[0];
        assert!(t1.errors.is_empty());
        assert!(t1.end.is_some());
        let t2 = &attempt.results[1];
        assert_eq!(t2.errors.len(), 1);
        assert_eq!(t2.errors[0].reason, "boom");
        assert!(t2.end.is_some());
    }

    #[tokio::test]
    async fn stream_closing_early_synthesizes_incomplete_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(
            dir.path(),
            vec![
                run_start(&["t1", "t2", "t3"]),
                start("t1"),
                end("t1"),
                start("t2"),
                entity_error("t2", "x"),
            ],
            "",
        );
        let attempt = run_with_config(path, &["t1", "t2", "t3"], ExecConfig::default()).await;

        assert!(matches!(attempt.failure, Some(RunFailure::RunnerExit(_))));
        assert_eq!(attempt.unstarted, Some(vec!["t3".to_string()]));
        assert_eq!(attempt.results.len(), 2);

        let t1 = &attempt.results[0];
        assert!(t1.end.is_some());
        assert!(t1.errors.is_empty());

        let t2 = &attempt.results[1];
        assert!(t2.end.is_none());
        assert_eq!(t2.errors.len(), 3);
        assert_eq!(t2.errors[0].reason, "x");
        assert!(t2.errors[1].reason.starts_with(GLOBAL_ERROR_PREFIX));
        assert!(t2.errors[1].reason.contains(NO_RUN_END_MSG));
        assert_eq!(t2.errors[2].reason, INCOMPLETE_TEST_MSG);
    }

    #[tokio::test]
    async fn run_error_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(
            dir.path(),
            vec![
                run_start(&["t1"]),
                start("t1"),
                Event::RunError {
                    time: now(),
                    error: ErrorReport::new("data server unreachable"),
                },
            ],
            "",
        );
        let attempt = run_with_config(path, &["t1"], ExecConfig::default()).await;

        assert!(
            matches!(&attempt.failure, Some(RunFailure::RunError(reason)) if reason == "data server unreachable")
        );
        let t1 = &attempt.results[0];
        assert!(t1.end.is_none());
        assert!(
            t1.errors[0]
                .reason
                .contains("data server unreachable")
        );
        assert_eq!(t1.errors.last().unwrap().reason, INCOMPLETE_TEST_MSG);
    }

    #[tokio::test]
    async fn max_test_failures_terminates_run() {
        // Four tests, three failing; the cap of two fires after t3 ends.
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(
            dir.path(),
            vec![
                run_start(&["t1", "t2", "t3", "t4"]),
                start("t1"),
                end("t1"),
                start("t2"),
                entity_error("t2", "fail2"),
                end("t2"),
                start("t3"),
                entity_error("t3", "fail3"),
                end("t3"),
                start("t4"),
                entity_error("t4", "fail4"),
                end("t4"),
                run_end(),
            ],
            "",
        );
        let config = ExecConfig {
            max_test_failures: 2,
            ..Default::default()
        };
        let attempt = run_with_config(path, &["t1", "t2", "t3", "t4"], config).await;

        assert!(matches!(attempt.failure, Some(RunFailure::Terminated)));
        assert!(attempt.failure.as_ref().unwrap().is_terminal());
        assert_eq!(attempt.results.len(), 3);
        assert_eq!(attempt.unstarted, Some(vec!["t4".to_string()]));
    }

    #[tokio::test]
    async fn msg_timeout_kills_quiet_runner() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(dir.path(), vec![run_start(&["t1"])], "sleep 60\n");
        let config = ExecConfig {
            msg_timeout: Duration::from_millis(300),
            runner_wait_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let attempt = run_with_config(path, &["t1"], config).await;
        assert!(matches!(attempt.failure, Some(RunFailure::MsgTimeout(_))));
        assert!(
            started.elapsed() < Duration::from_secs(30),
            "watchdog did not bound the wait"
        );
        assert_eq!(attempt.unstarted, Some(vec!["t1".to_string()]));
    }

    #[tokio::test]
    async fn cancellation_terminates_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(dir.path(), vec![run_start(&["t1"])], "sleep 60\n");
        let client = client_for(path);
        let config = ExecConfig {
            runner_wait_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let executor = TestExecutor::new(&client, config);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let attempt = executor
            .run(&["t1".to_string()], &cancel, &mut NullObserver)
            .await;
        assert!(matches!(attempt.failure, Some(RunFailure::Cancelled)));
        assert!(attempt.failure.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn fixture_setup_errors_are_inherited() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(
            dir.path(),
            vec![
                run_start(&["t1"]),
                start("t1"),
                entity_error("t1", "own failure"),
                end("t1"),
                run_end(),
            ],
            "",
        );
        let config = ExecConfig {
            start_fixture_name: "lab.Network".to_string(),
            setup_errors: vec![ErrorReport::new("vpn unreachable")],
            ..Default::default()
        };
        let attempt = run_with_config(path, &["t1"], config).await;

        let t1 = &attempt.results[0];
        assert_eq!(t1.errors.len(), 2);
        assert_eq!(
            t1.errors[0].reason,
            "[Fixture failure] lab.Network: vpn unreachable"
        );
        assert_eq!(t1.errors[1].reason, "own failure");
    }

    #[tokio::test]
    async fn dep_check_errors_attach_to_named_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(
            dir.path(),
            vec![
                run_start(&["t1", "t2"]),
                start("t1"),
                end("t1"),
                start("t2"),
                end("t2"),
                run_end(),
            ],
            "",
        );
        let mut pre_test_errors = HashMap::new();
        pre_test_errors.insert(
            "t2".to_string(),
            vec!["dependency references unknown feature \"wfii\"".to_string()],
        );
        let config = ExecConfig {
            pre_test_errors,
            ..Default::default()
        };
        let attempt = run_with_config(path, &["t1", "t2"], config).await;

        assert!(attempt.results[0].errors.is_empty());
        let t2 = &attempt.results[1];
        assert_eq!(t2.errors.len(), 1);
        assert!(t2.errors[0].reason.contains("wfii"));
    }

    #[tokio::test]
    async fn runner_that_never_speaks_reports_no_unstarted() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bundle(dir.path(), vec![], "exit 2\n");
        let attempt = run_with_config(path, &["t1"], ExecConfig::default()).await;
        assert!(attempt.unstarted.is_none());
        assert!(matches!(attempt.failure, Some(RunFailure::RunnerExit(_))));
    }
}
