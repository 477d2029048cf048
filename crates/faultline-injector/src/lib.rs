//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Crate root and public surface of the fault injection engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Deliberately breaks network paths, processes, and local resources of a
//! system under test, records every side effect as an artifact, and reverses
//! them on removal or at teardown.

pub mod cascade;
pub mod error;
pub mod events;
pub mod injector;
pub mod interceptor;
pub mod metrics;
pub mod pressure;
pub mod process;
pub mod proxy;
mod registry;
pub mod scenario;
pub mod strategies;
pub mod types;

pub use cascade::{derive_step_config, CascadeStepState, CascadeStepStatus};
pub use error::{FaultError, Result};
pub use events::{FaultEvent, FaultObserver};
pub use injector::{CleanupReport, FaultInjector, FaultInjectorBuilder};
pub use interceptor::{HookHandle, InterceptError, Interceptor, RequestHook};
pub use metrics::InjectorMetrics;
pub use process::{
    ProcessInspector, StaticProcessInspector, SystemProcessInspector, TerminationSignal,
};
pub use proxy::{InMemoryProxyBackend, Proxy, ProxyBackend, Toxic, ToxicStream, ToxiproxyClient};
pub use scenario::{ChaosScenario, RecoveryExpectation, ScenarioOutcome, ScenarioRunner};
pub use types::{
    ArtifactType, CascadeStep, FaultArtifact, FaultConfiguration, FaultId, FaultInjectionResult,
    FaultType,
};

/// Crate prelude collecting the types needed to drive an experiment.
pub mod prelude {
    pub use super::error::{FaultError, Result};
    pub use super::events::{FaultEvent, FaultObserver};
    pub use super::injector::{CleanupReport, FaultInjector};
    pub use super::interceptor::Interceptor;
    pub use super::scenario::{ChaosScenario, ScenarioRunner};
    pub use super::types::{FaultConfiguration, FaultId, FaultInjectionResult, FaultType};
}
