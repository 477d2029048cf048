//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy for injection, rollback, and backend failures."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

use crate::types::FaultId;

/// Result alias used throughout the injector crate.
pub type Result<T> = std::result::Result<T, FaultError>;

/// Error type for fault injection and removal.
#[derive(Debug, Error)]
pub enum FaultError {
    /// The fault configuration is missing a required key or carries an invalid value.
    #[error("invalid fault configuration: {0}")]
    InvalidConfiguration(String),
    /// The proxy backend could not be reached.
    #[error("proxy backend unavailable: {0}")]
    ProxyUnavailable(String),
    /// The proxy backend answered with an error.
    #[error("proxy request failed: {0}")]
    ProxyRequest(String),
    /// Process discovery failed.
    #[error("process lookup failed for {name}: {reason}")]
    ProcessLookup {
        /// Process name that was searched for.
        name: String,
        /// Underlying failure description.
        reason: String,
    },
    /// Delivering a signal to a process failed.
    #[error("failed to signal pid {pid}: {reason}")]
    Signal {
        /// Target process id.
        pid: i32,
        /// Underlying failure description.
        reason: String,
    },
    /// Memory or CPU pressure could not be applied.
    #[error("resource pressure failed: {0}")]
    Resource(String),
    /// The fault id does not refer to an active fault.
    #[error("unknown fault {0}")]
    UnknownFault(FaultId),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FaultError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        FaultError::InvalidConfiguration(message.into())
    }
}
