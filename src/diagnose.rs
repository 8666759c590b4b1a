//! Diagnosis of fatal run errors.
//!
//! When a run dies globally the raw error is often useless ("stream closed").
//! The diagnoser probes the DUT to produce a cause a human can act on: the
//! SSH connection is gone, or the device rebooted mid-run. An empty string
//! means nothing conclusive was found and the raw error stands.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::transport::{ConnectionCache, ssh::read_boot_id};

/// Produces a human-readable cause for a fatal run error.
#[async_trait]
pub trait Diagnoser: Send + Sync {
    /// Probes for a cause. `out_dir` is the invocation's output directory,
    /// available for log inspection. Empty result means no diagnosis.
    async fn diagnose(&self, out_dir: &str) -> String;
}

/// Diagnoser that pings the DUT and compares boot identifiers.
pub struct DutDiagnoser {
    cache: Arc<ConnectionCache>,
    role: String,
    /// Bound on the SSH liveness probe.
    ping_timeout: Duration,
    /// Bound on the whole diagnosis so a hung probe cannot stall shutdown.
    overall_timeout: Duration,
}

impl DutDiagnoser {
    pub fn new(cache: Arc<ConnectionCache>, role: impl Into<String>) -> Self {
        Self {
            cache,
            role: role.into(),
            ping_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    async fn probe(&self) -> String {
        let conn = match self.cache.get(&self.role).await {
            Ok(conn) => conn,
            Err(e) => return format!("Lost SSH connection: {e}"),
        };
        if let Err(e) = conn.transport.ping(self.ping_timeout).await {
            return format!("Lost SSH connection: {e}");
        }
        // Reachable. A changed boot id means the device rebooted under us.
        if let Some(recorded) = &conn.boot_id {
            match read_boot_id(conn.transport.as_ref()).await {
                Ok(current) if &current != recorded => {
                    return format!(
                        "DUT rebooted during the run (boot id {recorded} -> {current})"
                    );
                }
                Ok(_) => debug!("boot id unchanged"),
                Err(e) => debug!("could not re-read boot id: {e}"),
            }
        }
        String::new()
    }
}

#[async_trait]
impl Diagnoser for DutDiagnoser {
    async fn diagnose(&self, out_dir: &str) -> String {
        debug!(out_dir, "diagnosing run error");
        match tokio::time::timeout(self.overall_timeout, self.probe()).await {
            Ok(cause) => {
                if !cause.is_empty() {
                    info!("diagnosis: {cause}");
                }
                cause
            }
            Err(_) => String::new(),
        }
    }
}
