//! Configuration schema definitions.
//!
//! All types here deserialize from TOML. The recognized run options and
//! their meanings are a compatibility surface: they decide sharding, retry,
//! dependency checking, and watchdog behavior, so renaming a key is a
//! behavior change for every caller's config file.
//!
//! ```text
//! Config (root)
//! ├── RunConfig      - selection, sharding, retry, timeouts, proxy
//! ├── TargetConfig   - primary DUT address plus companion DUTs by role
//! ├── BundleConfig   - bundle locations on DUT and controller
//! └── ReportConfig   - result directory
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bundle::DownloadMode;
use crate::transport::SshTarget;

/// Root configuration loaded from a TOML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub run: RunConfig,

    pub target: TargetConfig,

    #[serde(default)]
    pub bundles: BundleConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core run settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// When false, dependency resolution is skipped entirely and every
    /// matched test runs.
    #[serde(default = "default_true")]
    pub check_test_deps: bool,

    /// Name to value map surfaced to tests.
    #[serde(default)]
    pub test_vars: HashMap<String, String>,

    /// Test-name glob list; empty selects all tests.
    #[serde(default)]
    pub patterns: Vec<String>,

    #[serde(default = "default_total_shards")]
    pub total_shards: usize,

    #[serde(default)]
    pub shard_index: usize,

    /// Enables the retry loop after a runner failure.
    #[serde(default)]
    pub continue_after_failure: bool,

    /// Global failure cap; zero means unlimited.
    #[serde(default)]
    pub max_test_failures: usize,

    #[serde(default)]
    pub download_mode: DownloadMode,

    /// Ordered list of artifact servers.
    #[serde(default)]
    pub devservers: Vec<String>,

    /// Per-run override of the build artifacts location.
    #[serde(default)]
    pub build_artifacts_url: Option<String>,

    /// Grace period for the runner to exit after its stream closes.
    #[serde(default = "default_runner_wait_secs")]
    pub local_runner_wait_timeout_secs: u64,

    /// Inter-event liveness watchdog.
    #[serde(default = "default_msg_timeout_secs")]
    pub msg_timeout_secs: u64,

    #[serde(default)]
    pub proxy: ProxyMode,

    #[serde(default)]
    pub tlw_server: Option<String>,
}

impl RunConfig {
    pub fn msg_timeout(&self) -> Duration {
        Duration::from_secs(self.msg_timeout_secs)
    }

    pub fn runner_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.local_runner_wait_timeout_secs)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        // Matches an empty [run] table.
        toml::from_str("").expect("empty RunConfig must deserialize")
    }
}

/// Whether proxy-related host environment is forwarded to DUT commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// No environment is forwarded.
    #[default]
    None,
    /// `http_proxy`, `https_proxy`, and `no_proxy` are forwarded from the
    /// controller's environment.
    Env,
}

/// Environment variables forwarded under [`ProxyMode::Env`].
pub const PROXY_ENV_VARS: [&str; 3] = ["http_proxy", "https_proxy", "no_proxy"];

/// The DUT(s) the run drives.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Primary DUT as `host` or `host:port`.
    pub host: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Companion DUTs by role, each as `host` or `host:port`. Every
    /// companion is connected alongside the primary.
    #[serde(default)]
    pub companion_duts: HashMap<String, String>,
}

impl TargetConfig {
    /// SSH targets by role; the primary uses the empty role name.
    pub fn ssh_targets(&self, proxy: ProxyMode) -> HashMap<String, SshTarget> {
        let forward_env = match proxy {
            ProxyMode::None => Vec::new(),
            ProxyMode::Env => PROXY_ENV_VARS
                .iter()
                .filter_map(|var| std::env::var(var).ok().map(|value| (var.to_string(), value)))
                .collect(),
        };
        let mut targets = HashMap::new();
        targets.insert(
            crate::transport::PRIMARY_ROLE.to_string(),
            self.parse_target(&self.host, &forward_env),
        );
        for (role, address) in &self.companion_duts {
            targets.insert(role.clone(), self.parse_target(address, &forward_env));
        }
        targets
    }

    fn parse_target(&self, address: &str, forward_env: &[(String, String)]) -> SshTarget {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (address.to_string(), 22),
            },
            None => (address.to_string(), 22),
        };
        let mut target = SshTarget::new(host);
        target.user = self.user.clone();
        target.port = port;
        target.key_path = self.key_path.clone();
        target.forward_env = forward_env.to_vec();
        target
    }
}

/// Where bundles and their data live.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BundleConfig {
    /// Glob matching local bundle executables on the DUT.
    #[serde(default = "default_local_bundle_glob")]
    pub local_bundle_glob: String,

    /// Glob matching remote bundle executables on the controller.
    #[serde(default = "default_remote_bundle_glob")]
    pub remote_bundle_glob: String,

    /// External data directory on the DUT.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Scratch directory on the DUT for run output before collection.
    #[serde(default = "default_dut_out_dir")]
    pub dut_out_dir: String,
}

impl Default for BundleConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty BundleConfig must deserialize")
    }
}

/// Result output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty ReportConfig must deserialize")
    }
}

fn default_true() -> bool {
    true
}

fn default_total_shards() -> usize {
    1
}

fn default_runner_wait_secs() -> u64 {
    10
}

fn default_msg_timeout_secs() -> u64 {
    60
}

fn default_user() -> String {
    "root".to_string()
}

fn default_local_bundle_glob() -> String {
    "/usr/local/libexec/bundles/local/*".to_string()
}

fn default_remote_bundle_glob() -> String {
    "/usr/libexec/bundles/remote/*".to_string()
}

fn default_data_dir() -> String {
    "/usr/local/share/test-data".to_string()
}

fn default_dut_out_dir() -> String {
    "/usr/local/tmp/run_output".to_string()
}

fn default_result_dir() -> PathBuf {
    PathBuf::from("results")
}
