//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Service crash fault: terminate processes backing a service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde_json::json;
use tracing::{debug, warn};

use crate::error::Result;
use crate::injector::{FaultInjector, InjectionScope};
use crate::process::TerminationSignal;
use crate::types::{ArtifactType, FaultArtifact, FaultConfiguration};

/// Processes to terminate: `ceil(found * intensity)`, ignoring float noise.
pub fn kill_count(found: usize, intensity: f64) -> usize {
    let raw = (found as f64 * intensity - 1e-9).ceil().max(0.0) as usize;
    raw.min(found)
}

impl FaultInjector {
    pub(crate) async fn inject_service_crash(
        &self,
        config: &FaultConfiguration,
        scope: &InjectionScope<'_>,
    ) -> Result<()> {
        let name = config.require_str("processName")?;
        let signal = TerminationSignal::for_graceful(config.param_bool("graceful")?.unwrap_or(false));
        if config.gradual_ramp_up {
            debug!(target: "faultline::injector::process", "ramp-up not supported for service_crash");
        }

        let pids = self.inner.processes.find_pids(name).await?;
        let count = kill_count(pids.len(), config.intensity);
        let mut killed = Vec::with_capacity(count);
        for pid in pids.iter().copied().take(count) {
            match self.inner.processes.signal(pid, signal).await {
                Ok(()) => killed.push(pid),
                Err(err) => warn!(
                    target: "faultline::injector::process",
                    fault_id = %scope.fault_id(),
                    pid,
                    signal = signal.as_str(),
                    error = %err,
                    "failed to terminate process, continuing"
                ),
            }
        }

        scope.record_metric("processes_found", pids.len() as f64);
        scope.record_metric("processes_killed", killed.len() as f64);
        scope
            .record_artifact(FaultArtifact::new(
                ArtifactType::Process,
                name,
                json!({
                    "pids": killed,
                    "signal": signal.as_str(),
                }),
                false,
            ))
            .await;
        debug!(
            target: "faultline::injector::process",
            fault_id = %scope.fault_id(),
            process = name,
            found = pids.len(),
            killed = killed.len(),
            "service crash applied"
        );
        Ok(())
    }
}
