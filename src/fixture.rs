//! Fixture scopes: ordered setup and teardown around batches of tests.
//!
//! A fixture brackets one or more tests with SetUp and TearDown. The stack
//! on the controller tracks which scopes are live; its invariants hold even
//! under partial failure:
//!
//! - Every successful push is matched by exactly one pop, in reverse order.
//! - A push whose SetUp raised errors stays on the stack; its errors are
//!   inherited by every descendant test, and the pop still runs so
//!   teardown can clean up whatever SetUp managed to do.
//!
//! Controller-side (remote) fixtures execute in one long-lived child
//! process driven over a line-delimited JSON RPC. The process is owned by a
//! dedicated task; push and pop requests pass through a channel and each is
//! answered by a sequence of `log`/`error` replies terminated by
//! `request_done`. That keeps the connection state in exactly one place
//! while the rest of the controller works with plain async calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bundle::BundleRequest;
use crate::protocol::ErrorReport;
use crate::registry::ResolvedEntity;
use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("pop on empty fixture stack")]
    PopOnEmpty,

    #[error("pop out of order: expected {expected:?}, got {got:?}")]
    PopOutOfOrder { expected: String, got: String },

    #[error("fixture service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("fixture service protocol error: {0}")]
    Protocol(String),

    #[error("fixture service timed out after {0:?}")]
    Timeout(Duration),
}

/// One live fixture scope.
#[derive(Debug, Clone)]
pub struct FixtureFrame {
    pub name: String,
    /// Errors raised by this fixture's SetUp. Non-empty does not remove the
    /// frame; descendants inherit these and teardown still runs.
    pub setup_errors: Vec<ErrorReport>,
}

/// Ordered list of pushed fixtures plus errors inherited from ancestors.
#[derive(Debug, Default)]
pub struct FixtureStack {
    inherited: Vec<ErrorReport>,
    frames: Vec<FixtureFrame>,
}

impl FixtureStack {
    pub fn new(inherited: Vec<ErrorReport>) -> Self {
        Self {
            inherited,
            frames: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, setup_errors: Vec<ErrorReport>) {
        let name = name.into();
        if !setup_errors.is_empty() {
            warn!(fixture = %name, "fixture SetUp reported {} errors", setup_errors.len());
        }
        self.frames.push(FixtureFrame { name, setup_errors });
    }

    /// Pops the named frame, which must be the most recent push.
    pub fn pop(&mut self, name: &str) -> Result<FixtureFrame, FixtureError> {
        let top = self.frames.last().ok_or(FixtureError::PopOnEmpty)?;
        if top.name != name {
            return Err(FixtureError::PopOutOfOrder {
                expected: top.name.clone(),
                got: name.to_string(),
            });
        }
        Ok(self.frames.pop().expect("checked non-empty"))
    }

    /// All setup errors visible to a test pushed now: inherited ones first,
    /// then each live frame's, outermost first.
    pub fn setup_errors(&self) -> Vec<ErrorReport> {
        let mut errors = self.inherited.clone();
        for frame in &self.frames {
            errors.extend(frame.setup_errors.iter().cloned());
        }
        errors
    }

    /// Names of live frames in teardown (reverse push) order.
    pub fn teardown_order(&self) -> Vec<String> {
        self.frames.iter().rev().map(|f| f.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A request line sent to the fixture service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
enum ServiceRequest {
    Push { name: String },
    Pop { name: String },
}

/// A reply line from the fixture service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ServiceReply {
    Log { text: String },
    Error { error: ErrorReport },
    RequestDone,
}

enum HostCommand {
    Request {
        request: ServiceRequest,
        reply: oneshot::Sender<Result<Vec<ErrorReport>, FixtureError>>,
    },
    Shutdown,
}

/// Sink for fixture-scoped log lines, implemented by the output collector.
pub type FixtureLogSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Client handle to the long-lived remote fixture service.
///
/// Dropping the host without [`shutdown`](Self::shutdown) kills the child
/// through its owning task.
pub struct RemoteFixtureHost {
    commands: mpsc::Sender<HostCommand>,
    task: tokio::task::JoinHandle<()>,
}

impl RemoteFixtureHost {
    /// Spawns the fixture service bundle and the task that owns it.
    pub async fn start(
        transport: Arc<dyn Transport>,
        bundle_path: &str,
        log_sink: Option<FixtureLogSink>,
    ) -> Result<Self, FixtureError> {
        let mut process = transport
            .spawn(bundle_path, &[])
            .await
            .map_err(|e| FixtureError::ServiceUnavailable(e.to_string()))?;
        let mut stdin = process
            .take_stdin()
            .ok_or_else(|| FixtureError::ServiceUnavailable("stdin unavailable".into()))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| FixtureError::ServiceUnavailable("stdout unavailable".into()))?;

        // Announce the mode, then keep stdin open for request lines.
        let mut mode_line = serde_json::to_vec(&BundleRequest::RunFixtureService)
            .expect("mode request serialization cannot fail");
        mode_line.push(b'\n');
        stdin
            .write_all(&mode_line)
            .await
            .map_err(|e| FixtureError::ServiceUnavailable(e.to_string()))?;

        let (commands, mut command_rx) = mpsc::channel::<HostCommand>(4);
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(command) = command_rx.recv().await {
                match command {
                    HostCommand::Shutdown => break,
                    HostCommand::Request { request, reply } => {
                        let name = match &request {
                            ServiceRequest::Push { name } | ServiceRequest::Pop { name } => {
                                name.clone()
                            }
                        };
                        let result = async {
                            let mut line = serde_json::to_vec(&request)
                                .map_err(|e| FixtureError::Protocol(e.to_string()))?;
                            line.push(b'\n');
                            stdin
                                .write_all(&line)
                                .await
                                .map_err(|e| FixtureError::ServiceUnavailable(e.to_string()))?;
                            let mut errors = Vec::new();
                            loop {
                                let Some(raw) = lines
                                    .next_line()
                                    .await
                                    .map_err(|e| FixtureError::ServiceUnavailable(e.to_string()))?
                                else {
                                    return Err(FixtureError::ServiceUnavailable(
                                        "service closed its stream mid-request".into(),
                                    ));
                                };
                                if raw.trim().is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<ServiceReply>(&raw)
                                    .map_err(|e| FixtureError::Protocol(e.to_string()))?
                                {
                                    ServiceReply::Log { text } => {
                                        debug!(fixture = %name, "{text}");
                                        if let Some(sink) = &log_sink {
                                            sink(&name, &text);
                                        }
                                    }
                                    ServiceReply::Error { error } => errors.push(error),
                                    ServiceReply::RequestDone => return Ok(errors),
                                }
                            }
                        }
                        .await;
                        let _ = reply.send(result);
                    }
                }
            }
            process.kill().await;
        });

        Ok(Self { commands, task })
    }

    /// Runs the fixture's SetUp; returned errors leave the scope on the
    /// stack but are inherited by every test under it.
    pub async fn push(&self, name: &str) -> Result<Vec<ErrorReport>, FixtureError> {
        self.request(ServiceRequest::Push {
            name: name.to_string(),
        })
        .await
    }

    /// Runs the fixture's TearDown. Always called, even after SetUp errors.
    pub async fn pop(&self, name: &str) -> Result<Vec<ErrorReport>, FixtureError> {
        self.request(ServiceRequest::Pop {
            name: name.to_string(),
        })
        .await
    }

    /// Stops the service process and waits for its owning task.
    pub async fn shutdown(self) {
        let _ = self.commands.send(HostCommand::Shutdown).await;
        let _ = self.task.await;
    }

    async fn request(&self, request: ServiceRequest) -> Result<Vec<ErrorReport>, FixtureError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HostCommand::Request { request, reply })
            .await
            .map_err(|_| FixtureError::ServiceUnavailable("service task gone".into()))?;
        response
            .await
            .map_err(|_| FixtureError::ServiceUnavailable("service task dropped reply".into()))?
    }
}

/// One `RunTests` invocation's worth of tests: same bundle, same remote
/// ancestor fixture.
#[derive(Debug)]
pub struct Batch {
    pub bundle: String,
    /// Remote fixture the batch runs under, empty for fixture-free tests.
    pub start_fixture: String,
    pub tests: Vec<ResolvedEntity>,
}

/// Groups runnable tests into batches and orders them: tests depending on
/// no remote fixture first, then each remote fixture in lexical order.
/// Order of tests inside a batch is preserved; the bundle's own planner
/// decides the final intra-batch ordering.
pub fn plan_batches(runnable: Vec<ResolvedEntity>) -> Vec<Batch> {
    let mut groups: BTreeMap<(String, String), Vec<ResolvedEntity>> = BTreeMap::new();
    for entity in runnable {
        let key = (
            entity.start_fixture_name.clone(),
            entity.entity.bundle.clone(),
        );
        groups.entry(key).or_default().push(entity);
    }
    // BTreeMap ordering puts the empty fixture name first, then lexical
    // fixture order, with bundle name as the tiebreaker.
    let batches: Vec<Batch> = groups
        .into_iter()
        .map(|((start_fixture, bundle), tests)| Batch {
            bundle,
            start_fixture,
            tests,
        })
        .collect();
    info!("planned {} batches", batches.len());
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Entity, EntityKind};
    use crate::transport::local::LocalTransport;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn stack_pops_in_reverse_order() {
        let mut stack = FixtureStack::new(vec![]);
        stack.push("outer", vec![]);
        stack.push("inner", vec![]);
        assert_eq!(stack.teardown_order(), ["inner", "outer"]);
        assert!(matches!(
            stack.pop("outer"),
            Err(FixtureError::PopOutOfOrder { .. })
        ));
        stack.pop("inner").unwrap();
        stack.pop("outer").unwrap();
        assert!(stack.is_empty());
        assert!(matches!(stack.pop("outer"), Err(FixtureError::PopOnEmpty)));
    }

    #[test]
    fn failed_setup_stays_on_stack_and_propagates() {
        let mut stack = FixtureStack::new(vec![ErrorReport::new("ancestor broke")]);
        stack.push("net", vec![ErrorReport::new("vpn down")]);
        // Further pushes are still permitted after a failed SetUp.
        stack.push("child", vec![]);

        let errors = stack.setup_errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].reason, "ancestor broke");
        assert_eq!(errors[1].reason, "vpn down");

        // Pop still runs for the failed frame.
        stack.pop("child").unwrap();
        let frame = stack.pop("net").unwrap();
        assert_eq!(frame.setup_errors.len(), 1);
    }

    #[test]
    fn batches_order_fixture_free_first_then_lexical() {
        let resolved = |name: &str, bundle: &str, fixture: &str| ResolvedEntity {
            entity: Entity::new(name, EntityKind::Test, bundle),
            hops: 1,
            skip_reason: None,
            check_errors: Vec::new(),
            start_fixture_name: fixture.to_string(),
        };
        let batches = plan_batches(vec![
            resolved("t_z", "cros", "zeta.Fixture"),
            resolved("t_a", "cros", "alpha.Fixture"),
            resolved("t_plain", "cros", ""),
            resolved("t_a2", "cros", "alpha.Fixture"),
        ]);
        let keys: Vec<(String, String)> = batches
            .iter()
            .map(|b| (b.start_fixture.clone(), b.bundle.clone()))
            .collect();
        assert_eq!(
            keys,
            [
                ("".into(), "cros".into()),
                ("alpha.Fixture".into(), "cros".into()),
                ("zeta.Fixture".into(), "cros".into()),
            ]
        );
        // Intra-batch order is preserved as given.
        assert_eq!(batches[1].tests[0].entity.name, "t_a");
        assert_eq!(batches[1].tests[1].entity.name, "t_a2");
    }

    fn fake_service(dir: &std::path::Path) -> String {
        let path = dir.join("fixture-service");
        std::fs::write(
            &path,
            r#"#!/bin/sh
read mode_line
while read line; do
  case "$line" in
    *push*) printf '%s\n' '{"kind":"log","text":"setting up"}' '{"kind":"error","error":{"reason":"flaky lab"}}' '{"kind":"request_done"}' ;;
    *pop*) printf '%s\n' '{"kind":"log","text":"tearing down"}' '{"kind":"request_done"}' ;;
  esac
done
"#,
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn remote_host_push_collects_errors_then_pop_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_service(dir.path());
        let host = RemoteFixtureHost::start(Arc::new(LocalTransport::new()), &path, None)
            .await
            .unwrap();

        let setup_errors = host.push("lab.Network").await.unwrap();
        assert_eq!(setup_errors.len(), 1);
        assert_eq!(setup_errors[0].reason, "flaky lab");

        // SetUp failed, yet the scope is torn down normally.
        let teardown_errors = host.pop("lab.Network").await.unwrap();
        assert!(teardown_errors.is_empty());

        host.shutdown().await;
    }

    #[tokio::test]
    async fn dead_service_surfaces_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exits-immediately");
        std::fs::write(&path, "#!/bin/sh\nread mode_line\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let host = RemoteFixtureHost::start(
            Arc::new(LocalTransport::new()),
            path.to_str().unwrap(),
            None,
        )
        .await
        .unwrap();
        let result = host.push("lab.Network").await;
        assert!(matches!(result, Err(FixtureError::ServiceUnavailable(_))));
        host.shutdown().await;
    }
}
