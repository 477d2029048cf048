//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Cascading failure sequencer: time-shifted sub-fault scheduling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! A cascading failure schedules each entry of its `failureSequence` as an
//! independent spawned task that sleeps for the step delay and then injects a
//! derived sub-fault. The parent reports success once every step is
//! scheduled; step outcomes are only visible through events, logs, and
//! [`FaultInjector::cascade_status`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use crate::error::{FaultError, Result};
use crate::injector::{FaultInjector, InjectionScope};
use crate::types::{ArtifactType, CascadeStep, FaultArtifact, FaultConfiguration, FaultId};

/// Parameter carrying the step list.
pub const FAILURE_SEQUENCE: &str = "failureSequence";

/// Where one scheduled step currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStepState {
    /// Waiting for its delay to elapse.
    Pending,
    /// Delay elapsed, sub-fault injection in progress.
    Running,
    /// Sub-fault injected and active under the given id.
    Injected(FaultId),
    Failed,
    /// Cancelled before it fired.
    Cancelled,
}

/// Snapshot of one scheduled step.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeStepStatus {
    pub index: usize,
    pub target: String,
    pub state: CascadeStepState,
}

pub(crate) struct CascadeHandle {
    index: usize,
    target: String,
    state: Arc<Mutex<CascadeStepState>>,
    abort: AbortHandle,
}

impl CascadeHandle {
    /// Abort the step if it has not started injecting. Returns true if it was cancelled.
    fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state != CascadeStepState::Pending {
            return false;
        }
        *state = CascadeStepState::Cancelled;
        self.abort.abort();
        true
    }

    fn is_settled(&self) -> bool {
        !matches!(
            *self.state.lock(),
            CascadeStepState::Pending | CascadeStepState::Running
        )
    }
}

/// Sub-configuration for step `index`: suffixed target, parent parameters
/// overlaid with the step's own, and the step intensity falling back to the parent's.
pub fn derive_step_config(
    parent: &FaultConfiguration,
    index: usize,
    step: &CascadeStep,
) -> FaultConfiguration {
    let mut parameters = parent.parameters.clone();
    parameters.remove(FAILURE_SEQUENCE);
    for (key, value) in &step.parameters {
        parameters.insert(key.clone(), value.clone());
    }
    FaultConfiguration {
        fault_type: step.fault_type,
        intensity: step.intensity.unwrap_or(parent.intensity),
        target: format!("{}-cascade-{index}", parent.target),
        parameters,
        gradual_ramp_up: false,
        ramp_up_duration: None,
    }
}

impl FaultInjector {
    pub(crate) async fn inject_cascading_failure(
        &self,
        config: &FaultConfiguration,
        scope: &InjectionScope<'_>,
    ) -> Result<()> {
        let raw = config.param(FAILURE_SEQUENCE).ok_or_else(|| {
            FaultError::invalid(format!(
                "cascading_failure requires parameter {FAILURE_SEQUENCE}"
            ))
        })?;
        let steps: Vec<CascadeStep> = serde_json::from_value(raw.clone()).map_err(|err| {
            FaultError::invalid(format!("malformed {FAILURE_SEQUENCE}: {err}"))
        })?;

        let planned = steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let sub = derive_step_config(config, index, step);
                sub.validate()?;
                Ok((index, step.delay(), sub))
            })
            .collect::<Result<Vec<_>>>()?;

        let parent = scope.fault_id();
        for (index, delay, sub) in planned {
            let artifact = FaultArtifact::new(
                ArtifactType::CascadeStep,
                format!("{parent}#{index}"),
                json!({
                    "type": sub.fault_type,
                    "target": sub.target,
                    "delay_ms": delay.as_millis() as u64,
                    "intensity": sub.intensity,
                }),
                false,
            );
            self.schedule_cascade_step(parent, index, delay, sub);
            scope.record_artifact(artifact).await;
        }
        scope.record_metric("cascade_steps_scheduled", steps.len() as f64);
        debug!(
            target: "faultline::injector::cascade",
            fault_id = %parent,
            steps = steps.len(),
            "cascade scheduled"
        );
        Ok(())
    }

    fn schedule_cascade_step(
        &self,
        parent: FaultId,
        index: usize,
        delay: std::time::Duration,
        sub: FaultConfiguration,
    ) {
        let state = Arc::new(Mutex::new(CascadeStepState::Pending));
        let target = sub.target.clone();
        let injector = self.clone();
        let step_state = state.clone();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let mut state = step_state.lock();
                if *state != CascadeStepState::Pending {
                    return;
                }
                *state = CascadeStepState::Running;
            }
            let fault_type = sub.fault_type;
            let outcome = injector.inject_boxed(sub).await;
            match outcome {
                Ok(result) => {
                    *step_state.lock() = CascadeStepState::Injected(result.fault_id);
                    if let Some(metrics) = &injector.inner.metrics {
                        metrics.record_cascade_step("injected");
                    }
                    info!(
                        target: "faultline::injector::cascade",
                        parent = %parent,
                        step = index,
                        child = %result.fault_id,
                        fault_type = %fault_type,
                        "cascade step injected"
                    );
                }
                Err(err) => {
                    *step_state.lock() = CascadeStepState::Failed;
                    if let Some(metrics) = &injector.inner.metrics {
                        metrics.record_cascade_step("failed");
                    }
                    error!(
                        target: "faultline::injector::cascade",
                        parent = %parent,
                        step = index,
                        fault_type = %fault_type,
                        error = %err,
                        "cascade step failed"
                    );
                }
            }
            injector.prune_cascade(parent);
        });
        self.inner
            .cascades
            .lock()
            .entry(parent)
            .or_default()
            .push(CascadeHandle {
                index,
                target,
                state,
                abort: task.abort_handle(),
            });
    }

    /// Ids of sub-faults a cascade has injected so far, in step order.
    pub fn cascade_children(&self, parent: FaultId) -> Vec<FaultId> {
        self.cascade_status(parent)
            .into_iter()
            .filter_map(|status| match status.state {
                CascadeStepState::Injected(child) => Some(child),
                _ => None,
            })
            .collect()
    }

    /// Per-step state of a cascade; empty for unknown parents.
    pub fn cascade_status(&self, parent: FaultId) -> Vec<CascadeStepStatus> {
        let cascades = self.inner.cascades.lock();
        let mut statuses: Vec<CascadeStepStatus> = cascades
            .get(&parent)
            .map(|handles| {
                handles
                    .iter()
                    .map(|handle| CascadeStepStatus {
                        index: handle.index,
                        target: handle.target.clone(),
                        state: *handle.state.lock(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        statuses.sort_by_key(|status| status.index);
        statuses
    }

    /// Cancel steps of `parent` that have not fired yet. Injected children stay active.
    pub fn cancel_cascade(&self, parent: FaultId) -> usize {
        let cancelled = self
            .inner
            .cascades
            .lock()
            .get(&parent)
            .map(|handles| handles.iter().filter(|handle| handle.cancel()).count())
            .unwrap_or_default();
        if cancelled > 0 {
            info!(
                target: "faultline::injector::cascade",
                fault_id = %parent,
                cancelled,
                "cascade steps cancelled"
            );
        }
        self.prune_cascade(parent);
        cancelled
    }

    /// Forget `parent`'s steps once it is no longer active and none of them can still fire.
    pub(crate) fn prune_cascade(&self, parent: FaultId) {
        if self.inner.registry.lock().get(parent).is_some() {
            return;
        }
        let mut cascades = self.inner.cascades.lock();
        let settled = cascades
            .get(&parent)
            .is_some_and(|handles| handles.iter().all(CascadeHandle::is_settled));
        if settled {
            cascades.remove(&parent);
            debug!(
                target: "faultline::injector::cascade",
                fault_id = %parent,
                "cascade bookkeeping released"
            );
        }
    }

    /// Cancel every unfired step and forget all cascade bookkeeping.
    pub(crate) fn cancel_all_cascades(&self) -> usize {
        let cascades = std::mem::take(&mut *self.inner.cascades.lock());
        cascades
            .values()
            .flatten()
            .filter(|handle| handle.cancel())
            .count()
    }
}
