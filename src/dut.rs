//! DUT capability probe and system-state collection.
//!
//! Both operations execute a bundle in a dedicated mode:
//!
//! - **GetDUTInfo** runs once per run and its result is immutable. Probing
//!   twice is an error by construction; re-deriving the feature set mid-run
//!   would silently re-key dependency resolution.
//! - **GetSysInfoState / CollectSysInfo** bracket the run. The initial
//!   snapshot is small (log sizes by inode and the set of existing
//!   minidumps) and held in memory; collection diffs against it, fetches
//!   the delta to the controller result tree, and cleans up the DUT.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::bundle::{DutInfo, GetDutInfoArgs, SysInfoState};
use crate::registry::FeatureSet;
use crate::runner::{RunnerClient, RunnerError};
use crate::transport::{Transport, TransportError};

/// Result-tree directory receiving the system log delta.
pub const SYSTEM_LOGS_DIR: &str = "system_logs";

/// Result-tree directory receiving minidumps copied from the DUT.
pub const CRASHES_DIR: &str = "crashes";

#[derive(Debug, thiserror::Error)]
pub enum DutError {
    #[error("DUT info was already probed in this run")]
    AlreadyProbed,

    #[error("can't check test deps; no software features reported by DUT")]
    NoSoftwareFeatures,

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Single-shot guard around the DUT capability probe.
#[derive(Debug, Default)]
pub struct DutProbe {
    probed: AtomicBool,
}

impl DutProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes the DUT once. A second call in the same run fails.
    pub async fn probe(
        &self,
        client: &RunnerClient,
        args: GetDutInfoArgs,
    ) -> Result<DutInfo, DutError> {
        if self.probed.swap(true, Ordering::SeqCst) {
            return Err(DutError::AlreadyProbed);
        }
        let dut_info = client.get_dut_info(args).await?;
        if dut_info.available_features.is_empty() {
            return Err(DutError::NoSoftwareFeatures);
        }
        if dut_info.hardware_features.is_none() {
            // Optional; tests depending on hardware data just won't match.
            warn!("DUT reported no hardware feature data");
        }
        info!(
            os_version = %dut_info.os_version,
            features = dut_info.available_features.len(),
            "probed DUT info"
        );
        Ok(dut_info)
    }
}

/// Converts probed DUT info into the registry's dependency universe.
pub fn feature_set(dut_info: &DutInfo) -> FeatureSet {
    FeatureSet::new(
        dut_info.available_features.iter().cloned(),
        dut_info.unavailable_features.iter().cloned(),
    )
}

/// Renders DUT info in the text form persisted as `dut-info.txt`.
pub fn render_dut_info(dut_info: &DutInfo) -> String {
    let mut out = String::new();
    out.push_str(&format!("os_version: {}\n", dut_info.os_version));
    out.push_str(&format!(
        "default_build_artifacts_url: {}\n",
        dut_info.default_build_artifacts_url
    ));
    for feature in &dut_info.available_features {
        out.push_str(&format!("available_feature: {feature}\n"));
    }
    for feature in &dut_info.unavailable_features {
        out.push_str(&format!("unavailable_feature: {feature}\n"));
    }
    if let Some(hardware) = &dut_info.hardware_features {
        out.push_str(&format!("hardware_features: {hardware}\n"));
    }
    out
}

/// Captures the pre-run system state snapshot.
pub async fn get_initial_sysinfo(client: &RunnerClient) -> Result<SysInfoState, DutError> {
    let state = client.get_sysinfo_state().await?;
    info!(
        logs = state.log_inode_sizes.len(),
        minidumps = state.minidump_paths.len(),
        "captured initial sysinfo"
    );
    Ok(state)
}

/// Collects the post-run delta, copies it into the result tree, and removes
/// the staged directories from the DUT.
pub async fn collect_sysinfo(
    client: &RunnerClient,
    transport: &dyn Transport,
    initial_state: SysInfoState,
    result_dir: &Path,
) -> Result<(), DutError> {
    let response = client.collect_sysinfo(initial_state).await?;
    for (src, dest_name) in [
        (&response.log_dir, SYSTEM_LOGS_DIR),
        (&response.crash_dir, CRASHES_DIR),
    ] {
        if src.is_empty() {
            continue;
        }
        let src = Path::new(src);
        let dest = result_dir.join(dest_name);
        transport.get_file(src, &dest).await?;
        // Staged copies are per-run scratch on the DUT.
        transport.remove_all(src).await?;
    }
    info!("collected sysinfo into {}", result_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn fake_bundle(dir: &Path, script_body: &str) -> RunnerClient {
        let path = dir.join("bundle");
        std::fs::write(&path, format!("#!/bin/sh\n{script_body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        RunnerClient::new(
            Arc::new(LocalTransport::new()),
            path.to_str().unwrap().to_string(),
        )
    }

    const DUT_INFO_SCRIPT: &str = r#"cat >/dev/null
echo '{"available_features":["display","wifi"],"unavailable_features":["cellular"],"hardware_features":null,"os_version":"R120-1.0","default_build_artifacts_url":"gs://images/r120"}'
"#;

    #[tokio::test]
    async fn probe_succeeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_bundle(dir.path(), DUT_INFO_SCRIPT);
        let probe = DutProbe::new();

        let dut_info = probe
            .probe(&client, GetDutInfoArgs::default())
            .await
            .unwrap();
        assert_eq!(dut_info.os_version, "R120-1.0");

        let features = feature_set(&dut_info);
        assert!(features.available.contains("wifi"));
        assert!(features.unavailable.contains("cellular"));
    }

    #[tokio::test]
    async fn second_probe_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_bundle(dir.path(), DUT_INFO_SCRIPT);
        let probe = DutProbe::new();

        probe
            .probe(&client, GetDutInfoArgs::default())
            .await
            .unwrap();
        let second = probe.probe(&client, GetDutInfoArgs::default()).await;
        assert!(matches!(second, Err(DutError::AlreadyProbed)));
    }

    #[tokio::test]
    async fn missing_software_features_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_bundle(
            dir.path(),
            r#"cat >/dev/null
echo '{"available_features":[],"unavailable_features":[],"os_version":"","default_build_artifacts_url":""}'
"#,
        );
        let probe = DutProbe::new();
        let result = probe.probe(&client, GetDutInfoArgs::default()).await;
        assert!(matches!(result, Err(DutError::NoSoftwareFeatures)));
    }

    #[tokio::test]
    async fn collect_sysinfo_fetches_and_cleans_up() {
        let staging = tempfile::tempdir().unwrap();
        let log_dir = staging.path().join("logs-delta");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("messages"), "kernel: hello\n").unwrap();

        let result_dir = tempfile::tempdir().unwrap();
        let bundle_dir = tempfile::tempdir().unwrap();
        let client = fake_bundle(
            bundle_dir.path(),
            &format!(
                "cat >/dev/null\necho '{{\"log_dir\":\"{}\",\"crash_dir\":\"\"}}'\n",
                log_dir.display()
            ),
        );

        let transport = LocalTransport::new();
        collect_sysinfo(
            &client,
            &transport,
            SysInfoState::default(),
            result_dir.path(),
        )
        .await
        .unwrap();

        let copied = result_dir.path().join(SYSTEM_LOGS_DIR).join("messages");
        assert!(copied.exists(), "log delta not copied");
        assert!(!log_dir.exists(), "staging dir not cleaned up");
    }

    #[test]
    fn render_dut_info_includes_features() {
        let dut_info = DutInfo {
            available_features: vec!["wifi".into()],
            unavailable_features: vec!["cellular".into()],
            hardware_features: None,
            os_version: "R120".into(),
            default_build_artifacts_url: "gs://x".into(),
        };
        let text = render_dut_info(&dut_info);
        assert!(text.contains("os_version: R120"));
        assert!(text.contains("available_feature: wifi"));
        assert!(text.contains("unavailable_feature: cellular"));
    }
}
