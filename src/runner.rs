//! Client for invoking test bundles in their various modes.
//!
//! A bundle is a single executable. The client writes one typed request on
//! the bundle's stdin and then follows one of two idioms:
//!
//! - **Request/response** (list and probe modes): wait for the process to
//!   exit and decode a single JSON object from its stdout. The first line
//!   of stderr is appended to any error so the root cause is not lost when
//!   the child dies before producing output.
//! - **Streaming** (`RunTests`): hand the stdout pipe to the caller, which
//!   reads control messages until the stream closes. Driving that stream is
//!   the execution loop's job, see [`crate::exec`].
//!
//! The client is transport-agnostic: the same code drives a bundle on the
//! DUT over SSH and a controller-side bundle as a local child.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::process::ChildStdout;
use tracing::debug;

use crate::bundle::{
    BundleRequest, CollectSysInfoArgs, CollectSysInfoResponse, DownloadPrivateBundlesArgs,
    DutInfo, EmptyResponse, GetDutInfoArgs, ListArgs, ListResponse, RunTestsArgs, SysInfoState,
};
use crate::registry::Entity;
use crate::transport::{ProcessHandle, Transport, TransportError};

/// Default grace period for a non-streaming bundle invocation.
const DEFAULT_MODE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("bundle {bundle} mode {mode} failed: {message}")]
    ModeFailed {
        bundle: String,
        mode: &'static str,
        message: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Invokes one bundle executable through a transport.
pub struct RunnerClient {
    transport: Arc<dyn Transport>,
    bundle_path: String,
    env: Vec<(String, String)>,
    mode_timeout: Duration,
}

/// A started `RunTests` invocation: the child process plus its event pipe.
pub struct RunHandle {
    pub process: ProcessHandle,
    pub stdout: ChildStdout,
}

impl RunnerClient {
    pub fn new(transport: Arc<dyn Transport>, bundle_path: impl Into<String>) -> Self {
        Self {
            transport,
            bundle_path: bundle_path.into(),
            env: Vec::new(),
            mode_timeout: DEFAULT_MODE_TIMEOUT,
        }
    }

    /// Adds an environment variable for every invocation of this bundle.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Overrides the grace period for non-streaming modes.
    pub fn with_mode_timeout(mut self, timeout: Duration) -> Self {
        self.mode_timeout = timeout;
        self
    }

    pub fn bundle_path(&self) -> &str {
        &self.bundle_path
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn list_tests(&self, patterns: Vec<String>) -> Result<Vec<Entity>, RunnerError> {
        let response: ListResponse = self
            .round_trip("ListTests", &BundleRequest::ListTests(ListArgs { patterns }))
            .await?;
        Ok(response.entities)
    }

    pub async fn list_fixtures(&self, patterns: Vec<String>) -> Result<Vec<Entity>, RunnerError> {
        let response: ListResponse = self
            .round_trip(
                "ListFixtures",
                &BundleRequest::ListFixtures(ListArgs { patterns }),
            )
            .await?;
        Ok(response.entities)
    }

    pub async fn get_dut_info(&self, args: GetDutInfoArgs) -> Result<DutInfo, RunnerError> {
        self.round_trip("GetDUTInfo", &BundleRequest::GetDutInfo(args))
            .await
    }

    pub async fn get_sysinfo_state(&self) -> Result<SysInfoState, RunnerError> {
        self.round_trip("GetSysInfoState", &BundleRequest::GetSysInfoState)
            .await
    }

    pub async fn collect_sysinfo(
        &self,
        initial_state: SysInfoState,
    ) -> Result<CollectSysInfoResponse, RunnerError> {
        self.round_trip(
            "CollectSysInfo",
            &BundleRequest::CollectSysInfo(CollectSysInfoArgs { initial_state }),
        )
        .await
    }

    pub async fn download_private_bundles(
        &self,
        args: DownloadPrivateBundlesArgs,
    ) -> Result<(), RunnerError> {
        let _: EmptyResponse = self
            .round_trip(
                "DownloadPrivateBundles",
                &BundleRequest::DownloadPrivateBundles(args),
            )
            .await?;
        Ok(())
    }

    /// Starts a streaming `RunTests` invocation and returns the handle; the
    /// caller owns stream consumption and process shutdown.
    pub async fn start_run(&self, args: RunTestsArgs) -> Result<RunHandle, RunnerError> {
        debug!(
            bundle = %self.bundle_path,
            tests = args.patterns.len(),
            "starting RunTests invocation"
        );
        let mut process = self.transport.spawn(&self.bundle_path, &self.env).await?;
        let request = BundleRequest::RunTests(args);
        if let Err(e) = process.send_request(&request).await {
            process.kill().await;
            return Err(self.mode_error("RunTests", e.to_string(), &process));
        }
        let Some(stdout) = process.take_stdout() else {
            process.kill().await;
            return Err(self.mode_error(
                "RunTests",
                "stdout pipe unavailable".to_string(),
                &process,
            ));
        };
        Ok(RunHandle { process, stdout })
    }

    async fn round_trip<T: DeserializeOwned>(
        &self,
        mode: &'static str,
        request: &BundleRequest,
    ) -> Result<T, RunnerError> {
        let mut process = self.transport.spawn(&self.bundle_path, &self.env).await?;
        if let Err(e) = process.send_request(request).await {
            process.kill().await;
            return Err(self.mode_error(mode, e.to_string(), &process));
        }
        let response = process.read_response::<T>().await;
        let waited = process.wait(self.mode_timeout).await;
        match (response, waited) {
            (Ok(response), Ok(_)) => Ok(response),
            // A decode failure on a dead process usually means the child
            // crashed before writing; prefer the exit diagnostic.
            (Err(_), Err(wait_err)) => {
                Err(self.mode_error(mode, wait_err.to_string(), &process))
            }
            (Err(decode_err), Ok(_)) => {
                Err(self.mode_error(mode, decode_err.to_string(), &process))
            }
            (Ok(_), Err(wait_err)) => Err(self.mode_error(mode, wait_err.to_string(), &process)),
        }
    }

    fn mode_error(
        &self,
        mode: &'static str,
        message: String,
        process: &ProcessHandle,
    ) -> RunnerError {
        // Attach the first stderr line unless the message already carries it.
        let message = match process.stderr_first_line() {
            Some(line) if !message.contains(&line) => format!("{message} (stderr: {line})"),
            _ => message,
        };
        RunnerError::ModeFailed {
            bundle: self.bundle_path.clone(),
            mode,
            message,
        }
    }
}
