//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Resource exhaustion fault: hold memory or spin CPU workers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tracing::debug;

use super::scaled_floor;
use crate::error::{FaultError, Result};
use crate::injector::{FaultInjector, InjectionScope};
use crate::pressure::{CpuPressure, MemoryPressure};
use crate::types::FaultConfiguration;

impl FaultInjector {
    pub(crate) async fn inject_resource_exhaustion(
        &self,
        config: &FaultConfiguration,
        scope: &InjectionScope<'_>,
    ) -> Result<()> {
        if config.gradual_ramp_up {
            debug!(target: "faultline::injector::resource", "ramp-up not supported for resource_exhaustion");
        }
        match config.require_str("resourceType")? {
            "memory" => {
                let max_mb = config
                    .param_u64("maxMB")?
                    .unwrap_or(self.inner.defaults.max_memory_mb);
                self.hold_memory(scope, scaled_floor(config.intensity, max_mb))
                    .await
            }
            "cpu" => {
                let defaults = &self.inner.defaults;
                let workers =
                    scaled_floor(config.intensity, u64::from(defaults.cpu_max_workers)) as u32;
                let pressure = CpuPressure::spawn(workers, defaults.cpu_busy(), defaults.cpu_tick());
                scope.record_metric("cpu_threads_created", pressure.worker_count() as f64);
                scope
                    .register_cleanup("stop_cpu_pressure", move || {
                        let mut pressure = pressure;
                        pressure.stop();
                    })
                    .await;
                Ok(())
            }
            other => Err(FaultError::invalid(format!(
                "unknown resourceType {other}, expected memory or cpu"
            ))),
        }
    }

    /// Allocate `megabytes` off the async runtime and keep them until the fault's cleanup runs.
    pub(crate) async fn hold_memory(&self, scope: &InjectionScope<'_>, megabytes: u64) -> Result<()> {
        let pressure = tokio::task::spawn_blocking(move || MemoryPressure::allocate(megabytes))
            .await
            .map_err(|err| FaultError::Resource(format!("memory allocation task failed: {err}")))??;
        scope.record_metric("memory_allocated_mb", pressure.allocated_mb() as f64);
        let fault_id = scope.fault_id();
        scope
            .register_cleanup("release_memory", move || {
                let mut pressure = pressure;
                let released = pressure.release();
                debug!(target: "faultline::injector::resource", fault_id = %fault_id, released_mb = released, "memory released");
            })
            .await;
        Ok(())
    }
}
