//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-fault-type injection strategies."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Each strategy is an `impl FaultInjector` block that applies one family of
//! faults and records its side effects through an `InjectionScope`.

pub mod crash;
pub mod interception;
pub mod network;
pub mod resource;

/// Scale `max` by `intensity`, rounding down but tolerating float noise such as `0.3 * 10`.
pub(crate) fn scaled_floor(intensity: f64, max: u64) -> u64 {
    (intensity * max as f64 + 1e-9).floor().max(0.0) as u64
}
