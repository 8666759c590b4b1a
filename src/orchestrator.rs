//! Full-run orchestration.
//!
//! The orchestrator owns the single foreground task that drives a run end
//! to end:
//!
//! 1. Connect the primary DUT and every companion.
//! 2. Discover bundles, populate the registry from their listings.
//! 3. Probe DUT info (once), capture initial sysinfo.
//! 4. Match, resolve, and shard the test set.
//! 5. Group tests into batches by (remote fixture, bundle) and drive each
//!    batch through the execution loop under the retry coordinator,
//!    pushing and popping remote fixtures around it.
//! 6. Collect sysinfo, emit result files, report the summary.
//!
//! Everything stateful hangs off explicit values threaded through here:
//! the registry, the connection cache, the output collector. Batches run
//! sequentially; the concurrency lives inside one invocation (stream
//! reader, process wait, artifact fetches).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bundle::{DownloadPrivateBundlesArgs, GetDutInfoArgs};
use crate::config::Config;
use crate::diagnose::DutDiagnoser;
use crate::dut::{self, DutProbe};
use crate::exec::{
    EntityResult, ExecConfig, RunFailure, RunObserver, TestExecutor, fixture_failure_error,
};
use crate::fixture::{Batch, FixtureStack, RemoteFixtureHost, plan_batches};
use crate::output::OutputCollector;
use crate::registry::{BundleHost, EntityKind, Registry, ResolvedEntity};
use crate::report::{Reporter, RunSummary};
use crate::retry::run_with_retries;
use crate::runner::RunnerClient;
use crate::shard::{ShardDescriptor, apply_shard};
use crate::transport::{ConnectionCache, PRIMARY_ROLE, Transport, local::LocalTransport};

/// Everything a finished run hands back to the caller.
#[derive(Debug)]
pub struct RunOutcome {
    pub results: Vec<EntityResult>,
    pub summary: RunSummary,
    pub failure: Option<RunFailure>,
}

/// One discovered bundle: where it runs and how to invoke it.
struct DiscoveredBundle {
    host: BundleHost,
    path: String,
    transport: Arc<dyn Transport>,
}

/// Forwards stream progress to both the output collector and the reporter.
struct RunProgress<'a> {
    collector: &'a mut OutputCollector,
    reporter: &'a dyn Reporter,
}

#[async_trait]
impl RunObserver for RunProgress<'_> {
    async fn run_log(&mut self, text: &str) {
        self.collector.run_log(text).await;
    }

    async fn entity_started(&mut self, name: &str, kind: EntityKind) {
        self.collector.entity_started(name, kind).await;
    }

    async fn entity_log(&mut self, name: &str, text: &str) {
        self.collector.entity_log(name, text).await;
    }

    async fn entity_finished(&mut self, result: &EntityResult) {
        self.collector.entity_finished(result).await;
        self.reporter.on_entity_finished(result).await;
    }
}

/// Drives a whole run against one primary DUT.
pub struct Orchestrator {
    config: Config,
    cache: Arc<ConnectionCache>,
    reporter: Arc<dyn Reporter>,
}

impl Orchestrator {
    pub fn new(config: Config, cache: Arc<ConnectionCache>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            config,
            cache,
            reporter,
        }
    }

    /// Lists the tests the current config would run, after dependency
    /// resolution, without executing anything.
    pub async fn list_tests(&self) -> anyhow::Result<Vec<ResolvedEntity>> {
        let bundles = self.discover_bundles().await?;
        let registry = self.build_registry(&bundles).await?;
        let matched = registry.match_patterns(&self.config.run.patterns)?;

        let probe = DutProbe::new();
        let features = if self.config.run.check_test_deps {
            let client = self.local_bundle_client(&bundles)?;
            dut::feature_set(&probe.probe(&client, GetDutInfoArgs::default()).await?)
        } else {
            Default::default()
        };
        let resolved = registry.resolve(&matched, &features, self.config.run.check_test_deps)?;
        Ok(resolved)
    }

    /// Runs the configured test set to completion.
    pub async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<RunOutcome> {
        let started = std::time::Instant::now();
        let run_id = Uuid::new_v4();
        let mut collector =
            OutputCollector::new(crate::output::ResultLayout::new(&self.config.report.result_dir));
        std::fs::create_dir_all(&self.config.report.result_dir)?;

        // Connect every configured DUT up front; a dead companion should
        // fail the run before any test output exists.
        for role in self.cache.roles() {
            self.cache.get(&role).await?;
        }
        let primary = self.cache.primary().await?;

        let bundles = self.discover_bundles().await?;
        let registry = self.build_registry(&bundles).await?;
        let probe_client = self.local_bundle_client(&bundles)?;

        // One-shot DUT probe; the result is immutable for the whole run.
        let probe = DutProbe::new();
        let dut_info = probe
            .probe(&probe_client, GetDutInfoArgs::default())
            .await?;
        collector.write_dut_info(&dut::render_dut_info(&dut_info))?;

        if !self.config.run.devservers.is_empty() || self.config.run.build_artifacts_url.is_some()
        {
            probe_client
                .download_private_bundles(DownloadPrivateBundlesArgs {
                    devservers: self.config.run.devservers.clone(),
                    tlw_server: self.config.run.tlw_server.clone(),
                    build_artifacts_url: self.config.run.build_artifacts_url.clone(),
                })
                .await?;
        }

        let initial_sysinfo = dut::get_initial_sysinfo(&probe_client).await?;

        // Selection: match, resolve deps, shard.
        let matched = registry.match_patterns(&self.config.run.patterns)?;
        let features = dut::feature_set(&dut_info);
        let resolved =
            registry.resolve(&matched, &features, self.config.run.check_test_deps)?;

        let (dep_skipped, runnable): (Vec<_>, Vec<_>) =
            resolved.into_iter().partition(|r| !r.runnable());
        let shard = ShardDescriptor::new(
            self.config.run.total_shards,
            self.config.run.shard_index,
        )?;
        let (to_run, shard_skipped) = apply_shard(runnable, shard);

        let mut results: Vec<EntityResult> = Vec::new();
        for skipped in dep_skipped.iter().chain(shard_skipped.iter()) {
            let record = EntityResult::skipped(
                skipped.entity.name.clone(),
                skipped.skip_reason.clone().unwrap_or_default(),
            );
            collector.entity_finished(&record).await;
            self.reporter.on_entity_finished(&record).await;
            results.push(record);
        }

        self.reporter.on_run_start(to_run.len() + results.len()).await;
        info!(
            "running {} tests ({} skipped before execution)",
            to_run.len(),
            results.len()
        );

        let batches = plan_batches(to_run);
        let mut run_failure: Option<RunFailure> = None;

        for batch in batches {
            if cancel.is_cancelled() {
                run_failure.get_or_insert(RunFailure::Cancelled);
                break;
            }
            let (batch_results, failure) = self
                .run_batch(&bundles, &registry, &batch, cancel, &mut collector)
                .await;
            results.extend(batch_results);
            if let Some(failure) = failure {
                let terminal = failure.is_terminal();
                run_failure.get_or_insert(failure);
                if terminal {
                    break;
                }
            }
        }

        // Post-run system state, best effort once the run already failed.
        if let Err(e) = dut::collect_sysinfo(
            &probe_client,
            primary.transport.as_ref(),
            initial_sysinfo,
            collector.layout().root(),
        )
        .await
        {
            warn!("sysinfo collection failed: {e}");
        }

        if run_failure.is_none() {
            collector.write_results_json(&results)?;
        }

        let summary = RunSummary::from_results(&results, started.elapsed());
        self.reporter
            .on_run_complete(&summary, run_failure.as_ref())
            .await;
        info!(run_id = %run_id, "run finished");

        Ok(RunOutcome {
            results,
            summary,
            failure: run_failure,
        })
    }

    /// Runs one batch: remote fixture up, execution loop under the retry
    /// coordinator, remote fixture down.
    async fn run_batch(
        &self,
        bundles: &HashMap<String, DiscoveredBundle>,
        registry: &Registry,
        batch: &Batch,
        cancel: &CancellationToken,
        collector: &mut OutputCollector,
    ) -> (Vec<EntityResult>, Option<RunFailure>) {
        let Some(bundle) = bundles.get(&batch.bundle) else {
            return (
                Vec::new(),
                Some(RunFailure::StartFailed(format!(
                    "bundle {:?} disappeared after discovery",
                    batch.bundle
                ))),
            );
        };
        let mut stack = FixtureStack::new(Vec::new());

        // Bring up the remote fixture scope when the batch needs one.
        let fixture_host = if batch.start_fixture.is_empty() {
            None
        } else {
            match self
                .start_fixture(bundles, registry, &batch.start_fixture)
                .await
            {
                Ok((host, setup_errors)) => {
                    stack.push(&batch.start_fixture, setup_errors);
                    Some(host)
                }
                Err(failure) => return (Vec::new(), Some(failure)),
            }
        };

        let client = RunnerClient::new(Arc::clone(&bundle.transport), bundle.path.clone())
            .with_mode_timeout(self.config.run.runner_wait_timeout());
        let diagnoser = DutDiagnoser::new(Arc::clone(&self.cache), PRIMARY_ROLE);

        let mut pre_test_errors = HashMap::new();
        for test in &batch.tests {
            if !test.check_errors.is_empty() {
                pre_test_errors.insert(test.entity.name.clone(), test.check_errors.clone());
            }
        }
        let invocation = Uuid::new_v4();
        let exec_config = ExecConfig {
            data_dir: self.config.bundles.data_dir.clone(),
            out_dir: format!("{}/{invocation}/out", self.config.bundles.dut_out_dir),
            tmp_dir: format!("{}/{invocation}/tmp", self.config.bundles.dut_out_dir),
            test_vars: self.config.run.test_vars.clone(),
            devservers: self.config.run.devservers.clone(),
            tlw_server: self.config.run.tlw_server.clone(),
            build_artifacts_url: self.config.run.build_artifacts_url.clone(),
            download_mode: self.config.run.download_mode,
            msg_timeout: self.config.run.msg_timeout(),
            runner_wait_timeout: self.config.run.runner_wait_timeout(),
            max_test_failures: self.config.run.max_test_failures,
            heartbeat_interval_secs: 5,
            start_fixture_name: batch.start_fixture.clone(),
            setup_errors: stack.setup_errors(),
            pre_test_errors,
        };
        let executor = TestExecutor::new(&client, exec_config).with_diagnoser(&diagnoser);

        collector.set_batch_transport(Some(Arc::clone(&bundle.transport)));
        let patterns: Vec<String> = batch
            .tests
            .iter()
            .map(|t| t.entity.name.clone())
            .collect();

        // Attempts run strictly one after another; the RefCell hands the
        // observer to whichever attempt is current.
        let progress = std::cell::RefCell::new(RunProgress {
            collector: &mut *collector,
            reporter: self.reporter.as_ref(),
        });
        let (batch_results, mut failure) = run_with_retries(
            patterns,
            self.config.run.continue_after_failure,
            |attempt_patterns| {
                let executor = &executor;
                let progress = &progress;
                async move {
                    let mut observer = progress.borrow_mut();
                    executor
                        .run(&attempt_patterns, cancel, &mut *observer)
                        .await
                }
            },
            || self.ensure_primary_connected(),
        )
        .await;
        drop(progress);
        collector.set_batch_transport(None);

        // Tear the fixture scope down even on the error path. A dropped DUT
        // connection is re-established first; failing that is fatal.
        if let Some(host) = fixture_host {
            if !self.ensure_primary_connected().await {
                failure.get_or_insert(RunFailure::RunnerExit(
                    "could not reconnect DUT before fixture teardown".to_string(),
                ));
            }
            match host.pop(&batch.start_fixture).await {
                Ok(teardown_errors) => {
                    for error in &teardown_errors {
                        warn!(
                            fixture = %batch.start_fixture,
                            "teardown error: {}",
                            error.reason
                        );
                    }
                }
                Err(e) => {
                    failure.get_or_insert(RunFailure::RunnerExit(format!(
                        "fixture teardown failed: {e}"
                    )));
                }
            }
            let _ = stack.pop(&batch.start_fixture);
            host.shutdown().await;
        }

        (batch_results, failure)
    }

    /// Starts the fixture service owning the named remote fixture and runs
    /// its SetUp.
    async fn start_fixture(
        &self,
        bundles: &HashMap<String, DiscoveredBundle>,
        registry: &Registry,
        fixture_name: &str,
    ) -> Result<(RemoteFixtureHost, Vec<crate::protocol::ErrorReport>), RunFailure> {
        let Some(entity) = registry.get(fixture_name) else {
            return Err(RunFailure::StartFailed(format!(
                "remote fixture {fixture_name:?} is not registered"
            )));
        };
        let Some(bundle) = bundles.get(&entity.bundle) else {
            return Err(RunFailure::StartFailed(format!(
                "bundle {:?} for fixture {fixture_name:?} not found",
                entity.bundle
            )));
        };
        let host = RemoteFixtureHost::start(Arc::clone(&bundle.transport), &bundle.path, None)
            .await
            .map_err(|e| RunFailure::StartFailed(e.to_string()))?;
        let setup_errors = match host.push(fixture_name).await {
            Ok(errors) => errors,
            Err(e) => {
                host.shutdown().await;
                return Err(RunFailure::StartFailed(format!(
                    "fixture {fixture_name:?} SetUp did not complete: {e}"
                )));
            }
        };
        for error in &setup_errors {
            warn!(
                "{}",
                fixture_failure_error(fixture_name, &error.reason)
            );
        }
        Ok((host, setup_errors))
    }

    /// Pre-retry hook: make sure the primary DUT is reachable, redialing
    /// once when it is not.
    async fn ensure_primary_connected(&self) -> bool {
        match self.cache.primary().await {
            Ok(conn) => {
                if conn.transport.ping(Duration::from_secs(10)).await.is_ok() {
                    return true;
                }
            }
            Err(_) => {}
        }
        info!("primary DUT unreachable, reconnecting");
        self.cache.reconnect(PRIMARY_ROLE).await.is_ok()
    }

    /// Expands the configured bundle globs on their respective hosts.
    async fn discover_bundles(&self) -> anyhow::Result<HashMap<String, DiscoveredBundle>> {
        let primary = self.cache.primary().await?;
        let controller: Arc<dyn Transport> = Arc::new(LocalTransport::new());

        let mut bundles = HashMap::new();
        for (host, glob, transport) in [
            (
                BundleHost::Dut,
                &self.config.bundles.local_bundle_glob,
                Arc::clone(&primary.transport),
            ),
            (
                BundleHost::Controller,
                &self.config.bundles.remote_bundle_glob,
                controller,
            ),
        ] {
            for path in expand_glob(transport.as_ref(), glob).await? {
                // Bundle names are their file names; listings confirm them.
                let name = path.rsplit('/').next().unwrap_or(&path).to_string();
                bundles.insert(
                    name,
                    DiscoveredBundle {
                        host,
                        path,
                        transport: Arc::clone(&transport),
                    },
                );
            }
        }
        if bundles.is_empty() {
            anyhow::bail!("no bundles matched the configured globs");
        }
        info!("discovered {} bundles", bundles.len());
        Ok(bundles)
    }

    /// Populates the registry from every discovered bundle's listings.
    async fn build_registry(
        &self,
        bundles: &HashMap<String, DiscoveredBundle>,
    ) -> anyhow::Result<Registry> {
        let mut registry = Registry::new();
        for bundle in bundles.values() {
            let client = RunnerClient::new(Arc::clone(&bundle.transport), bundle.path.clone());
            let mut entities = client.list_tests(vec![]).await?;
            entities.extend(client.list_fixtures(vec![]).await?);
            registry.register_bundle(bundle.host, entities)?;
        }
        Ok(registry)
    }

    /// Picks the DUT-side bundle used for probe modes. Probes must run on
    /// the device, so controller-side bundles do not qualify.
    fn local_bundle_client(
        &self,
        bundles: &HashMap<String, DiscoveredBundle>,
    ) -> anyhow::Result<RunnerClient> {
        let bundle = bundles
            .values()
            .filter(|b| b.host == BundleHost::Dut)
            .min_by(|a, b| a.path.cmp(&b.path))
            .ok_or_else(|| anyhow::anyhow!("no DUT-side bundles discovered"))?;
        Ok(RunnerClient::new(
            Arc::clone(&bundle.transport),
            bundle.path.clone(),
        ))
    }
}

/// Expands a shell glob on the given host, returning matching paths.
async fn expand_glob(transport: &dyn Transport, glob: &str) -> anyhow::Result<Vec<String>> {
    let output = transport
        .exec_capture(&format!("ls -1 -- {glob} 2>/dev/null || true"))
        .await?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use crate::protocol::{EntityInfo, ErrorReport, Event, encode_event};
    use crate::report::NullReporter;
    use crate::transport::{Connector, DutConnection, SshTarget, TransportResult};
    use chrono::Utc;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Connector that "dials" the fake DUT by handing out a local transport.
    struct LoopbackConnector;

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self, _target: &SshTarget) -> TransportResult<DutConnection> {
            Ok(DutConnection {
                transport: Arc::new(LocalTransport::new()),
                boot_id: Some("boot-1".to_string()),
            })
        }
    }

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn encode_stream(events: Vec<Event>) -> Vec<u8> {
        events.into_iter().flat_map(encode_event).collect()
    }

    const DUT_INFO_JSON: &str = r#"{"available_features":["display"],"unavailable_features":[],"hardware_features":null,"os_version":"R1","default_build_artifacts_url":""}"#;

    /// Lays out a fake DUT-side bundle answering every probe mode and
    /// replaying a canned RunTests stream.
    fn write_local_bundle(root: &Path, name: &str, tests_json: &str, stream: Vec<u8>) {
        let local_dir = root.join("local");
        std::fs::create_dir_all(&local_dir).unwrap();
        let stream_path = root.join(format!("{name}-stream.bin"));
        std::fs::write(&stream_path, stream).unwrap();
        write_script(
            &local_dir.join(name),
            &format!(
                r#"read line
case "$line" in
  *'"ListTests"'*) echo '{{"entities":{tests_json}}}' ;;
  *'"ListFixtures"'*) echo '{{"entities":[]}}' ;;
  *'"GetDUTInfo"'*) echo '{dut_info}' ;;
  *'"GetSysInfoState"'*) echo '{{"log_inode_sizes":{{}},"minidump_paths":[]}}' ;;
  *'"CollectSysInfo"'*) echo '{{"log_dir":"","crash_dir":""}}' ;;
  *'"RunTests"'*) cat '{stream}' ;;
esac
"#,
                dut_info = DUT_INFO_JSON,
                stream = stream_path.display(),
            ),
        );
    }

    fn test_config(root: &Path, extra_run: &str) -> Config {
        load_config_str(&format!(
            r#"
            [run]
            {extra_run}

            [target]
            host = "fake-dut"

            [bundles]
            local_bundle_glob = "{root}/local/*"
            remote_bundle_glob = "{root}/remote/*"
            data_dir = "{root}/data"
            dut_out_dir = "{root}/dut-out"

            [report]
            result_dir = "{root}/results"
            "#,
            root = root.display(),
        ))
        .unwrap()
    }

    fn orchestrator_for(config: Config) -> Orchestrator {
        let targets = config.target.ssh_targets(config.run.proxy);
        let cache = Arc::new(ConnectionCache::new(Arc::new(LoopbackConnector), targets));
        Orchestrator::new(config, cache, Arc::new(NullReporter))
    }

    fn entity_json(name: &str, bundle: &str, fixture: Option<&str>) -> String {
        let fixture = match fixture {
            Some(f) => format!("\"{f}\""),
            None => "null".to_string(),
        };
        format!(
            r#"{{"name":"{name}","kind":"test","bundle":"{bundle}","fixture":{fixture}}}"#
        )
    }

    #[tokio::test]
    async fn end_to_end_run_produces_result_tree() {
        let root = tempfile::tempdir().unwrap();
        let stream = encode_stream(vec![
            Event::RunStart {
                time: Utc::now(),
                names: vec!["t1".into(), "t2".into()],
                count: 2,
            },
            Event::EntityStart {
                time: Utc::now(),
                entity: EntityInfo {
                    name: "t1".into(),
                    kind: EntityKind::Test,
                },
                out_dir: String::new(),
            },
            Event::EntityEnd {
                time: Utc::now(),
                name: "t1".into(),
                skip_reasons: vec![],
                timing: None,
            },
            Event::EntityStart {
                time: Utc::now(),
                entity: EntityInfo {
                    name: "t2".into(),
                    kind: EntityKind::Test,
                },
                out_dir: String::new(),
            },
            Event::EntityError {
                time: Utc::now(),
                name: "t2".into(),
                error: ErrorReport::new("boom"),
            },
            Event::EntityEnd {
                time: Utc::now(),
                name: "t2".into(),
                skip_reasons: vec![],
                timing: None,
            },
            Event::RunEnd {
                time: Utc::now(),
                out_dir: String::new(),
            },
        ]);
        let tests = format!(
            "[{},{}]",
            entity_json("t1", "cros", None),
            entity_json("t2", "cros", None)
        );
        write_local_bundle(root.path(), "cros", &tests, stream);

        let orchestrator = orchestrator_for(test_config(root.path(), ""));
        let outcome = orchestrator.run(&CancellationToken::new()).await.unwrap();

        assert!(outcome.failure.is_none(), "failure: {:?}", outcome.failure);
        assert_eq!(outcome.summary.total, 2);
        assert_eq!(outcome.summary.passed, 1);
        assert_eq!(outcome.summary.failed, 1);

        let results_dir = root.path().join("results");
        assert!(results_dir.join("results.json").exists());
        assert!(results_dir.join("dut-info.txt").exists());
        let streamed =
            std::fs::read_to_string(results_dir.join("streamed_results.jsonl")).unwrap();
        assert_eq!(streamed.lines().count(), 2);
    }

    #[tokio::test]
    async fn shard_selection_skips_out_of_shard_tests() {
        let root = tempfile::tempdir().unwrap();
        let stream = encode_stream(vec![
            Event::RunStart {
                time: Utc::now(),
                names: vec!["t1".into()],
                count: 1,
            },
            Event::EntityStart {
                time: Utc::now(),
                entity: EntityInfo {
                    name: "t1".into(),
                    kind: EntityKind::Test,
                },
                out_dir: String::new(),
            },
            Event::EntityEnd {
                time: Utc::now(),
                name: "t1".into(),
                skip_reasons: vec![],
                timing: None,
            },
            Event::RunEnd {
                time: Utc::now(),
                out_dir: String::new(),
            },
        ]);
        let tests = format!(
            "[{},{}]",
            entity_json("t1", "cros", None),
            entity_json("t2", "cros", None)
        );
        write_local_bundle(root.path(), "cros", &tests, stream);

        let orchestrator = orchestrator_for(test_config(
            root.path(),
            "total_shards = 2\nshard_index = 0\n",
        ));
        let outcome = orchestrator.run(&CancellationToken::new()).await.unwrap();

        assert!(outcome.failure.is_none(), "failure: {:?}", outcome.failure);
        assert_eq!(outcome.summary.total, 2);
        assert_eq!(outcome.summary.passed, 1);
        assert_eq!(outcome.summary.skipped, 1);
        let skipped = outcome
            .results
            .iter()
            .find(|r| r.name == "t2")
            .expect("t2 must have a record");
        assert_eq!(
            skipped.skip_reason.as_deref(),
            Some(crate::shard::NOT_IN_SHARD_REASON)
        );
    }

    #[tokio::test]
    async fn remote_fixture_setup_error_reaches_test_results() {
        let root = tempfile::tempdir().unwrap();
        let stream = encode_stream(vec![
            Event::RunStart {
                time: Utc::now(),
                names: vec!["t1".into()],
                count: 1,
            },
            Event::EntityStart {
                time: Utc::now(),
                entity: EntityInfo {
                    name: "t1".into(),
                    kind: EntityKind::Test,
                },
                out_dir: String::new(),
            },
            Event::EntityEnd {
                time: Utc::now(),
                name: "t1".into(),
                skip_reasons: vec![],
                timing: None,
            },
            Event::RunEnd {
                time: Utc::now(),
                out_dir: String::new(),
            },
        ]);
        let tests = format!("[{}]", entity_json("t1", "cros", Some("lab.Net")));
        write_local_bundle(root.path(), "cros", &tests, stream);

        // Controller-side bundle owning the remote fixture. Push replies
        // with one error; pop succeeds.
        let remote_dir = root.path().join("remote");
        std::fs::create_dir_all(&remote_dir).unwrap();
        write_script(
            &remote_dir.join("lab"),
            r#"read line
case "$line" in
  *'"ListTests"'*) echo '{"entities":[]}' ; exit 0 ;;
  *'"ListFixtures"'*) echo '{"entities":[{"name":"lab.Net","kind":"fixture","bundle":"lab"}]}' ; exit 0 ;;
  *'"RunFixtureService"'*)
    while read req; do
      case "$req" in
        *push*) printf '%s\n' '{"kind":"error","error":{"reason":"flaky lab"}}' '{"kind":"request_done"}' ;;
        *pop*) printf '%s\n' '{"kind":"request_done"}' ;;
      esac
    done
    ;;
esac
"#,
        );

        let orchestrator = orchestrator_for(test_config(root.path(), ""));
        let outcome = orchestrator.run(&CancellationToken::new()).await.unwrap();

        assert!(outcome.failure.is_none(), "failure: {:?}", outcome.failure);
        let t1 = outcome
            .results
            .iter()
            .find(|r| r.name == "t1")
            .expect("t1 must have a record");
        assert_eq!(t1.errors.len(), 1);
        assert_eq!(t1.errors[0].reason, "[Fixture failure] lab.Net: flaky lab");
        // The test still ran to completion under the broken fixture.
        assert!(t1.end.is_some());
    }
}

