//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Prometheus counters and gauges for injected and removed faults."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use faultline_common::SharedRegistry;
use prometheus::{IntCounterVec, IntGauge, Opts};

use crate::error::Result;
use crate::types::FaultType;

/// Metrics published by the fault injector.
#[derive(Clone)]
pub struct InjectorMetrics {
    registry: SharedRegistry,
    injected_total: IntCounterVec,
    injection_failures_total: IntCounterVec,
    removed_total: IntCounterVec,
    artifact_cleanup_failures_total: IntCounterVec,
    cascade_steps_total: IntCounterVec,
    active_faults: IntGauge,
}

impl InjectorMetrics {
    /// Register the injector metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let injected_total = IntCounterVec::new(
            Opts::new(
                "faultline_faults_injected_total",
                "Faults applied successfully, by fault type",
            ),
            &["fault_type"],
        )?;
        registry.register(Box::new(injected_total.clone()))?;

        let injection_failures_total = IntCounterVec::new(
            Opts::new(
                "faultline_fault_injection_failures_total",
                "Injections that failed and were rolled back, by fault type",
            ),
            &["fault_type"],
        )?;
        registry.register(Box::new(injection_failures_total.clone()))?;

        let removed_total = IntCounterVec::new(
            Opts::new(
                "faultline_faults_removed_total",
                "Faults rolled back and removed from the active table",
            ),
            &["fault_type"],
        )?;
        registry.register(Box::new(removed_total.clone()))?;

        let artifact_cleanup_failures_total = IntCounterVec::new(
            Opts::new(
                "faultline_artifact_cleanup_failures_total",
                "Artifact reversals that failed during rollback",
            ),
            &["artifact"],
        )?;
        registry.register(Box::new(artifact_cleanup_failures_total.clone()))?;

        let cascade_steps_total = IntCounterVec::new(
            Opts::new(
                "faultline_cascade_steps_total",
                "Cascading failure steps by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(cascade_steps_total.clone()))?;

        let active_faults = IntGauge::with_opts(Opts::new(
            "faultline_active_faults",
            "Faults currently present in the active table",
        ))?;
        registry.register(Box::new(active_faults.clone()))?;

        Ok(Self {
            registry,
            injected_total,
            injection_failures_total,
            removed_total,
            artifact_cleanup_failures_total,
            cascade_steps_total,
            active_faults,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_injected(&self, fault_type: FaultType) {
        self.injected_total
            .with_label_values(&[fault_type.as_str()])
            .inc();
    }

    pub fn record_injection_failure(&self, fault_type: FaultType) {
        self.injection_failures_total
            .with_label_values(&[fault_type.as_str()])
            .inc();
    }

    pub fn record_removed(&self, fault_type: FaultType) {
        self.removed_total
            .with_label_values(&[fault_type.as_str()])
            .inc();
    }

    pub fn record_artifact_cleanup_failure(&self, artifact: &str) {
        self.artifact_cleanup_failures_total
            .with_label_values(&[artifact])
            .inc();
    }

    pub fn record_cascade_step(&self, outcome: &str) {
        self.cascade_steps_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_active(&self, count: usize) {
        self.active_faults.set(count as i64);
    }
}

impl std::fmt::Debug for InjectorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectorMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_common::new_registry;

    #[test]
    fn metric_families_are_registered() {
        let registry = new_registry();
        let metrics = InjectorMetrics::new(registry.clone()).unwrap();
        metrics.record_injected(FaultType::HighLatency);
        metrics.record_removed(FaultType::HighLatency);
        metrics.record_artifact_cleanup_failure("proxy");
        metrics.set_active(2);
        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"faultline_faults_injected_total".to_string()));
        assert!(names.contains(&"faultline_artifact_cleanup_failures_total".to_string()));
        assert!(names.contains(&"faultline_active_faults".to_string()));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = new_registry();
        InjectorMetrics::new(registry.clone()).unwrap();
        assert!(InjectorMetrics::new(registry).is_err());
    }
}
