//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fault lifecycle notifications for external observers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::Serialize;

use crate::types::{FaultConfiguration, FaultId, FaultInjectionResult};

/// Lifecycle event published by the injector.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FaultEvent {
    /// A fault was applied successfully.
    Injected {
        fault_id: FaultId,
        config: FaultConfiguration,
        result: FaultInjectionResult,
    },
    /// A fault was rolled back and left the active table.
    Removed {
        fault_id: FaultId,
        result: FaultInjectionResult,
    },
}

impl FaultEvent {
    pub fn fault_id(&self) -> FaultId {
        match self {
            FaultEvent::Injected { fault_id, .. } | FaultEvent::Removed { fault_id, .. } => {
                *fault_id
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FaultEvent::Injected { .. } => "fault_injected",
            FaultEvent::Removed { .. } => "fault_removed",
        }
    }
}

/// Typed callbacks for components that correlate fault windows with their own timeline.
///
/// Callbacks run synchronously on the injecting task, before the event is
/// broadcast to channel subscribers.
pub trait FaultObserver: Send + Sync {
    fn on_fault_injected(
        &self,
        _fault_id: FaultId,
        _config: &FaultConfiguration,
        _result: &FaultInjectionResult,
    ) {
    }

    fn on_fault_removed(&self, _fault_id: FaultId, _result: &FaultInjectionResult) {}
}
