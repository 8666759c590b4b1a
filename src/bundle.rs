//! Wire records of the bundle invocation interface.
//!
//! A bundle is executed with one serialized request object on stdin. Every
//! request carries a `mode` tag selecting the operation; each mode has a
//! strictly typed request record and either a single JSON response object
//! (the list and probe modes) or a control-message stream (`RunTests`, see
//! [`crate::protocol`]).
//!
//! These records are a stable contract with existing bundles. Field names
//! are part of the wire format; change them and deployed bundles stop
//! understanding the controller.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::protocol::ErrorReport;
use crate::registry::Entity;

/// How external test data is fetched by the bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Prefetch everything before the first test runs.
    #[default]
    Batch,
    /// Fetch files as individual tests request them.
    Lazy,
}

/// A request sent to a bundle process, tagged by mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum BundleRequest {
    RunTests(RunTestsArgs),
    ListTests(ListArgs),
    ListFixtures(ListArgs),
    #[serde(rename = "GetDUTInfo")]
    GetDutInfo(GetDutInfoArgs),
    GetSysInfoState,
    CollectSysInfo(CollectSysInfoArgs),
    DownloadPrivateBundles(DownloadPrivateBundlesArgs),
    /// Long-lived mode serving fixture push/pop requests over stdin, used
    /// by [`crate::fixture::RemoteFixtureHost`].
    RunFixtureService,
}

/// Arguments for a `RunTests` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTestsArgs {
    /// Exact names of the tests to run, in planner-independent order.
    pub patterns: Vec<String>,

    /// Directory holding external data files on the execution host.
    pub data_dir: String,

    /// Directory the bundle writes per-entity output under.
    pub out_dir: String,

    /// Scratch directory for the invocation.
    pub tmp_dir: String,

    /// Name to value map surfaced to tests.
    #[serde(default)]
    pub test_vars: HashMap<String, String>,

    /// Ordered list of artifact servers.
    #[serde(default)]
    pub devservers: Vec<String>,

    /// TLW server address, when the lab environment provides one.
    #[serde(default)]
    pub tlw_server: Option<String>,

    /// Per-run override of the build artifacts location.
    #[serde(default)]
    pub build_artifacts_url: Option<String>,

    #[serde(default)]
    pub download_mode: DownloadMode,

    /// Interval between heartbeat events, in seconds. Zero disables them.
    #[serde(default)]
    pub heartbeat_interval_secs: u64,

    /// Name of the ancestor fixture already set up by the controller, empty
    /// when the batch depends on no remote fixture.
    #[serde(default)]
    pub start_fixture_name: String,

    /// Errors raised by the start fixture's SetUp, to be inherited by every
    /// test in the batch.
    #[serde(default)]
    pub start_fixture_errors: Vec<ErrorReport>,
}

/// Arguments shared by `ListTests` and `ListFixtures`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListArgs {
    /// Glob patterns to filter by; empty lists everything.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Response to `ListTests` and `ListFixtures`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResponse {
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetDutInfoArgs {
    /// Features the run cares about; the bundle may use this to prune
    /// expensive probes.
    #[serde(default)]
    pub extra_use_flags: Vec<String>,
}

/// Capabilities reported by the DUT, immutable once probed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DutInfo {
    /// Software features known to be present.
    pub available_features: Vec<String>,

    /// Software features known to be absent.
    pub unavailable_features: Vec<String>,

    /// Opaque hardware feature record; optional, absence is logged but not
    /// fatal.
    #[serde(default)]
    pub hardware_features: Option<serde_json::Value>,

    #[serde(default)]
    pub os_version: String,

    /// Where build artifacts for this image are published by default.
    #[serde(default)]
    pub default_build_artifacts_url: String,
}

/// Bounded snapshot of DUT system state taken before the run.
///
/// Holds just enough to diff after the run: sizes of known log files keyed
/// by inode, and the set of minidumps already present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysInfoState {
    pub log_inode_sizes: HashMap<u64, u64>,
    pub minidump_paths: HashSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectSysInfoArgs {
    /// The pre-run snapshot used as the delta reference.
    pub initial_state: SysInfoState,
}

/// Response to `CollectSysInfo`: directories on the DUT ready to be copied
/// to the controller result tree and then deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectSysInfoResponse {
    pub log_dir: String,
    pub crash_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadPrivateBundlesArgs {
    #[serde(default)]
    pub devservers: Vec<String>,

    #[serde(default)]
    pub tlw_server: Option<String>,

    #[serde(default)]
    pub build_artifacts_url: Option<String>,
}

/// Empty acknowledgement for modes without a payload to return.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_tags_are_stable() {
        let req = BundleRequest::GetDutInfo(GetDutInfoArgs::default());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["mode"], "GetDUTInfo");

        let req = BundleRequest::RunTests(RunTestsArgs::default());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["mode"], "RunTests");

        let req = BundleRequest::GetSysInfoState;
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["mode"], "GetSysInfoState");
    }

    #[test]
    fn run_tests_args_round_trip() {
        let mut args = RunTestsArgs {
            patterns: vec!["ui.Login".into()],
            start_fixture_name: "lab.Network".into(),
            ..Default::default()
        };
        args.test_vars.insert("user".into(), "testuser".into());
        let req = BundleRequest::RunTests(args);
        let json = serde_json::to_string(&req).unwrap();
        let back: BundleRequest = serde_json::from_str(&json).unwrap();
        match back {
            BundleRequest::RunTests(args) => {
                assert_eq!(args.patterns, ["ui.Login"]);
                assert_eq!(args.start_fixture_name, "lab.Network");
                assert_eq!(args.test_vars["user"], "testuser");
            }
            other => panic!("wrong mode: {other:?}"),
        }
    }

    #[test]
    fn sysinfo_state_round_trip() {
        let mut state = SysInfoState::default();
        state.log_inode_sizes.insert(42, 1024);
        state.minidump_paths.insert("/var/spool/crash/a.dmp".into());
        let json = serde_json::to_string(&state).unwrap();
        let back: SysInfoState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
