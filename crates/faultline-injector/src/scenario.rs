//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Scenario driver: hold one fault for a fixed window, then remove it."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;
use crate::events::FaultEvent;
use crate::injector::FaultInjector;
use crate::types::{FaultConfiguration, FaultId, FaultInjectionResult, FaultType};

/// What the system under test is expected to do once the fault is lifted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecoveryExpectation {
    /// Seconds the target may take to become healthy again.
    #[serde(default)]
    pub max_recovery_secs: Option<u64>,
    /// The service must be restarted by the harness; injector cleanup cannot revive it.
    #[serde(default)]
    pub restart_required: bool,
}

/// Declarative experiment loaded from TOML: one fault held for `duration`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChaosScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// How long the fault stays active (seconds).
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration: Duration,
    #[serde(default)]
    pub recovery: Option<RecoveryExpectation>,
    pub fault: FaultConfiguration,
}

impl ChaosScenario {
    /// Load a scenario from disk.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("unable to read scenario {}", path.as_ref().display()))?;
        contents.parse::<Self>()
    }

    /// Whether recovery needs an external restart, either declared or implied by the fault type.
    pub fn restart_required(&self) -> bool {
        self.recovery
            .as_ref()
            .map(|recovery| recovery.restart_required)
            .unwrap_or(false)
            || self.fault.fault_type == FaultType::ServiceCrash
    }
}

impl std::str::FromStr for ChaosScenario {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let scenario = toml::from_str::<Self>(input).map_err(anyhow::Error::new)?;
        scenario
            .fault
            .validate()
            .with_context(|| format!("scenario {} has an invalid fault", scenario.name))?;
        Ok(scenario)
    }
}

/// Record of one scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub scenario: String,
    pub fault_id: FaultId,
    /// Result as returned by the injection.
    pub injected: FaultInjectionResult,
    /// Result after rollback, when the removal event was observed.
    pub rolled_back: Option<FaultInjectionResult>,
    /// False if the fault was already gone when the window closed.
    pub removed: bool,
    pub restart_required: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Runs scenarios against one injector, one at a time.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    injector: FaultInjector,
}

impl ScenarioRunner {
    pub fn new(injector: FaultInjector) -> Self {
        Self { injector }
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    /// Inject the scenario's fault, hold it for the scenario duration, then remove it.
    ///
    /// Injection errors propagate. A fault that is already gone at the end of
    /// the window is reported through `removed = false`.
    pub async fn run(&self, scenario: &ChaosScenario) -> Result<ScenarioOutcome> {
        let mut events = self.injector.subscribe();
        let started_at = Utc::now();
        let injected = self.injector.inject_fault(scenario.fault.clone()).await?;
        let fault_id = injected.fault_id;
        info!(
            target: "faultline::scenario",
            scenario = %scenario.name,
            fault_id = %fault_id,
            duration_secs = scenario.duration.as_secs(),
            "scenario fault active"
        );

        if !scenario.duration.is_zero() {
            sleep(scenario.duration).await;
        }

        let removed = self.injector.remove_fault(fault_id).await;
        if !removed {
            warn!(
                target: "faultline::scenario",
                scenario = %scenario.name,
                fault_id = %fault_id,
                "fault was no longer active at the end of the scenario"
            );
        }

        let mut rolled_back = None;
        loop {
            match events.try_recv() {
                Ok(FaultEvent::Removed { fault_id: id, result }) if id == fault_id => {
                    rolled_back = Some(result);
                }
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        let finished_at = Utc::now();
        info!(
            target: "faultline::scenario",
            scenario = %scenario.name,
            fault_id = %fault_id,
            removed,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "scenario complete"
        );
        Ok(ScenarioOutcome {
            scenario: scenario.name.clone(),
            fault_id,
            injected,
            rolled_back,
            removed,
            restart_required: scenario.restart_required(),
            started_at,
            finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARTITION: &str = r#"
        name = "bridge-partition"
        description = "Cut the bridge off from its upstream"
        duration = 30

        [recovery]
        max_recovery_secs = 60

        [fault]
        type = "network_partition"
        intensity = 1.0
        target = "bridge"

        [fault.parameters]
        port = 8080
    "#;

    #[test]
    fn scenario_parses_from_toml() {
        let scenario: ChaosScenario = PARTITION.parse().unwrap();
        assert_eq!(scenario.name, "bridge-partition");
        assert_eq!(scenario.duration, Duration::from_secs(30));
        assert_eq!(scenario.fault.fault_type, FaultType::NetworkPartition);
        assert_eq!(scenario.fault.param_u64("port").unwrap(), Some(8080));
        assert_eq!(
            scenario.recovery.as_ref().and_then(|r| r.max_recovery_secs),
            Some(60)
        );
        assert!(!scenario.restart_required());
    }

    #[test]
    fn crash_scenarios_always_require_restart() {
        let scenario: ChaosScenario = r#"
            name = "kill-workers"
            duration = 5

            [fault]
            type = "service_crash"
            intensity = 0.5
            target = "workers"
            parameters = { processName = "worker" }
        "#
        .parse()
        .unwrap();
        assert!(scenario.restart_required());
    }

    #[test]
    fn out_of_range_intensity_is_rejected_at_load() {
        let input = PARTITION.replace("intensity = 1.0", "intensity = 2.0");
        assert!(input.parse::<ChaosScenario>().is_err());
    }

    #[test]
    fn scenario_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partition.toml");
        std::fs::write(&path, PARTITION).unwrap();
        let scenario = ChaosScenario::from_file(&path).unwrap();
        assert_eq!(scenario.fault.target, "bridge");
    }
}
