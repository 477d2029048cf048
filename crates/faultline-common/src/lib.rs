//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Crate root for configuration, tracing, and metrics shared across faultline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the faultline workspace: configuration loading,
//! tracing initialisation, and the metrics registry handed to the injector.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{FaultDefaults, InjectorConfig, LoggingConfig, MetricsConfig, ProxyConfig};
pub use logging::{init_test_tracing, init_tracing, LogFormat};
pub use metrics::{new_registry, render_text, SharedRegistry};
