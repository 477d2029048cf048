//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fault taxonomy, configurations, ids, artifacts, and results."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fault taxonomy, configuration, and the records kept for every injection.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DeserializeFromStr, DurationMilliSeconds, SerializeDisplay};

use crate::error::{FaultError, Result};

/// Fixed enumeration of supported fault types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    /// Block traffic through a proxy in front of the target.
    NetworkPartition,
    /// Delay traffic through a proxy in front of the target.
    HighLatency,
    /// Cap throughput through a proxy in front of the target.
    BandwidthLimit,
    /// Terminate processes backing the target service.
    ServiceCrash,
    /// Hold memory or spin CPU inside the local process.
    ResourceExhaustion,
    /// Corrupt payloads returned through the interception layer.
    DataCorruption,
    /// Schedule a sequence of sub-faults over time.
    CascadingFailure,
    /// Emulate serverless runtime failures through the interception layer.
    LambdaChaos,
}

impl FaultType {
    /// All supported fault types, in declaration order.
    pub const ALL: [FaultType; 8] = [
        FaultType::NetworkPartition,
        FaultType::HighLatency,
        FaultType::BandwidthLimit,
        FaultType::ServiceCrash,
        FaultType::ResourceExhaustion,
        FaultType::DataCorruption,
        FaultType::CascadingFailure,
        FaultType::LambdaChaos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultType::NetworkPartition => "network_partition",
            FaultType::HighLatency => "high_latency",
            FaultType::BandwidthLimit => "bandwidth_limit",
            FaultType::ServiceCrash => "service_crash",
            FaultType::ResourceExhaustion => "resource_exhaustion",
            FaultType::DataCorruption => "data_corruption",
            FaultType::CascadingFailure => "cascading_failure",
            FaultType::LambdaChaos => "lambda_chaos",
        }
    }

    /// Human-readable name of the strategy used for this fault type.
    pub fn injection_method(&self) -> &'static str {
        match self {
            FaultType::NetworkPartition | FaultType::HighLatency | FaultType::BandwidthLimit => {
                "toxiproxy"
            }
            FaultType::ServiceCrash => "process_termination",
            FaultType::ResourceExhaustion => "resource_pressure",
            FaultType::DataCorruption | FaultType::LambdaChaos => "request_interception",
            FaultType::CascadingFailure => "cascade_scheduler",
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultType {
    type Err = FaultError;

    fn from_str(s: &str) -> Result<Self> {
        FaultType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| FaultError::invalid(format!("unknown fault type: {s}")))
    }
}

/// Input to an injection.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultConfiguration {
    #[serde(rename = "type")]
    pub fault_type: FaultType,
    /// Dial in [0.0, 1.0]; its meaning depends on the fault type.
    pub intensity: f64,
    /// Opaque identifier of the faulted component.
    pub target: String,
    /// Type-specific settings.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub gradual_ramp_up: bool,
    #[serde(rename = "ramp_up_duration_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub ramp_up_duration: Option<Duration>,
}

impl FaultConfiguration {
    pub fn new(fault_type: FaultType, target: impl Into<String>, intensity: f64) -> Self {
        Self {
            fault_type,
            intensity,
            target: target.into(),
            parameters: Map::new(),
            gradual_ramp_up: false,
            ramp_up_duration: None,
        }
    }

    /// Attach a parameter, replacing any previous value for the key.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Ease the fault in over `duration` instead of applying it at once.
    pub fn with_ramp_up(mut self, duration: Duration) -> Self {
        self.gradual_ramp_up = true;
        self.ramp_up_duration = Some(duration);
        self
    }

    /// Reject intensities outside [0, 1] and empty targets.
    pub fn validate(&self) -> Result<()> {
        if !self.intensity.is_finite() || !(0.0..=1.0).contains(&self.intensity) {
            return Err(FaultError::invalid(format!(
                "intensity {} outside [0, 1]",
                self.intensity
            )));
        }
        if self.target.trim().is_empty() {
            return Err(FaultError::invalid("target must not be empty"));
        }
        Ok(())
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key).filter(|value| !value.is_null())
    }

    pub fn param_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.param(key) {
            None => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                FaultError::invalid(format!("parameter {key} must be numeric, got {value}"))
            }),
        }
    }

    pub fn param_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.param_f64(key)? {
            None => Ok(None),
            Some(number) if number >= 0.0 && number.is_finite() => Ok(Some(number as u64)),
            Some(number) => Err(FaultError::invalid(format!(
                "parameter {key} must be a non-negative number, got {number}"
            ))),
        }
    }

    pub fn param_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.param(key) {
            None => Ok(None),
            Some(value) => value.as_bool().map(Some).ok_or_else(|| {
                FaultError::invalid(format!("parameter {key} must be a boolean, got {value}"))
            }),
        }
    }

    pub fn param_str(&self, key: &str) -> Result<Option<&str>> {
        match self.param(key) {
            None => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or_else(|| {
                FaultError::invalid(format!("parameter {key} must be a string, got {value}"))
            }),
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.param_str(key)?.ok_or_else(|| {
            FaultError::invalid(format!(
                "{} fault requires parameter {key}",
                self.fault_type
            ))
        })
    }
}

/// Handle of an entry in the injector's active-fault arena.
///
/// `generation` is never reused, so a stale id cannot resolve to a newer fault
/// that happens to occupy the same slot. `instance` is drawn at random when the
/// injector is built, which keeps ids and proxy names from two injectors apart
/// when they share a proxy controller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr,
)]
pub struct FaultId {
    pub(crate) slot: u32,
    pub(crate) generation: u64,
    pub(crate) instance: u32,
}

impl FaultId {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Nonce of the injector that issued this id.
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Suffix used for external resources named after this fault.
    pub fn resource_suffix(&self) -> String {
        format!("{:08x}_{}", self.instance, self.generation)
    }
}

impl fmt::Display for FaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fault-{:08x}-{}-{}",
            self.instance, self.generation, self.slot
        )
    }
}

impl FromStr for FaultId {
    type Err = FaultError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || FaultError::invalid(format!("malformed fault id: {s}"));
        let rest = s.strip_prefix("fault-").ok_or_else(malformed)?;
        let mut parts = rest.splitn(3, '-');
        let (Some(instance), Some(generation), Some(slot)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        Ok(FaultId {
            slot: slot.parse().map_err(|_| malformed())?,
            generation: generation.parse().map_err(|_| malformed())?,
            instance: u32::from_str_radix(instance, 16).map_err(|_| malformed())?,
        })
    }
}

/// Kind of side effect recorded by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Proxy,
    Process,
    Container,
    File,
    NetworkRule,
    /// A scheduled step of a cascading failure.
    CascadeStep,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Proxy => "proxy",
            ArtifactType::Process => "process",
            ArtifactType::Container => "container",
            ArtifactType::File => "file",
            ArtifactType::NetworkRule => "network_rule",
            ArtifactType::CascadeStep => "cascade_step",
        }
    }
}

/// One reversible (or irreversible) side effect of a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultArtifact {
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Handle needed to reverse the effect.
    pub identifier: String,
    /// Parameters needed to reconstruct or reverse the effect.
    pub configuration: Value,
    pub cleanup_required: bool,
}

impl FaultArtifact {
    pub fn new(
        artifact_type: ArtifactType,
        identifier: impl Into<String>,
        configuration: Value,
        cleanup_required: bool,
    ) -> Self {
        Self {
            artifact_type,
            identifier: identifier.into(),
            configuration,
            cleanup_required,
        }
    }
}

/// Record of one injection, owned by the injector while the fault is active.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultInjectionResult {
    pub fault_id: FaultId,
    #[serde(rename = "type")]
    pub fault_type: FaultType,
    pub target: String,
    pub intensity: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub duration: Option<Duration>,
    pub success: bool,
    pub injection_method: String,
    pub rollback_executed: bool,
    pub artifacts: Vec<FaultArtifact>,
    pub metrics: IndexMap<String, f64>,
}

impl FaultInjectionResult {
    pub(crate) fn pending(fault_id: FaultId, config: &FaultConfiguration) -> Self {
        Self {
            fault_id,
            fault_type: config.fault_type,
            target: config.target.clone(),
            intensity: config.intensity,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            success: false,
            injection_method: config.fault_type.injection_method().to_owned(),
            rollback_executed: false,
            artifacts: Vec::new(),
            metrics: IndexMap::new(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub(crate) fn record_metric(&mut self, name: &str, value: f64) {
        self.metrics.insert(name.to_owned(), value);
    }

    /// Stamp the rollback fields; `end_time` and `duration` only exist once rolled back.
    pub(crate) fn mark_rolled_back(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now);
        self.duration = Some((now - self.start_time).to_std().unwrap_or_default());
        self.rollback_executed = true;
    }
}

/// One entry of a cascading failure's `failureSequence` parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStep {
    #[serde(rename = "type")]
    pub fault_type: FaultType,
    /// Milliseconds after the parent injection at which the step fires.
    #[serde(default)]
    pub delay: u64,
    /// Overrides the parent intensity when present.
    #[serde(default)]
    pub intensity: Option<f64>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl CascadeStep {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fault_type_round_trips_through_names() {
        for ty in FaultType::ALL {
            assert_eq!(ty.as_str().parse::<FaultType>().unwrap(), ty);
        }
        assert!("disk_full".parse::<FaultType>().is_err());
    }

    #[test]
    fn fault_id_display_and_parse() {
        let id = FaultId {
            slot: 3,
            generation: 17,
            instance: 0xbeef,
        };
        assert_eq!(id.to_string(), "fault-0000beef-17-3");
        assert_eq!("fault-0000beef-17-3".parse::<FaultId>().unwrap(), id);
        assert_eq!(id.resource_suffix(), "0000beef_17");
        assert!("fault-x".parse::<FaultId>().is_err());
        assert!("fault-17-3".parse::<FaultId>().is_err());
    }

    #[test]
    fn intensity_outside_unit_interval_is_rejected() {
        let config = FaultConfiguration::new(FaultType::HighLatency, "bridge", 1.2);
        assert!(config.validate().is_err());
        let config = FaultConfiguration::new(FaultType::HighLatency, "bridge", f64::NAN);
        assert!(config.validate().is_err());
        let config = FaultConfiguration::new(FaultType::HighLatency, " ", 0.5);
        assert!(config.validate().is_err());
        let config = FaultConfiguration::new(FaultType::HighLatency, "bridge", 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn typed_parameter_accessors() {
        let config = FaultConfiguration::new(FaultType::ServiceCrash, "bridge", 0.5)
            .with_param("processName", "bridge-worker")
            .with_param("graceful", true)
            .with_param("maxMB", 64)
            .with_param("broken", "yes");
        assert_eq!(config.require_str("processName").unwrap(), "bridge-worker");
        assert_eq!(config.param_bool("graceful").unwrap(), Some(true));
        assert_eq!(config.param_u64("maxMB").unwrap(), Some(64));
        assert_eq!(config.param_u64("missing").unwrap(), None);
        assert!(config.param_f64("broken").is_err());
        assert!(config.require_str("upstream").is_err());
    }

    #[test]
    fn configuration_deserializes_from_catalog_json() {
        let config: FaultConfiguration = serde_json::from_value(json!({
            "type": "bandwidth_limit",
            "intensity": 0.25,
            "target": "bridge",
            "parameters": {"port": 8080, "maxBandwidth": 512},
            "gradual_ramp_up": true,
            "ramp_up_duration_ms": 1500
        }))
        .unwrap();
        assert_eq!(config.fault_type, FaultType::BandwidthLimit);
        assert_eq!(config.ramp_up_duration, Some(Duration::from_millis(1500)));
        assert_eq!(config.param_u64("maxBandwidth").unwrap(), Some(512));
    }

    #[test]
    fn rollback_stamps_end_time_and_duration_together() {
        let config = FaultConfiguration::new(FaultType::DataCorruption, "bridge", 0.1);
        let mut result = FaultInjectionResult::pending(
            FaultId {
                slot: 0,
                generation: 1,
                instance: 0,
            },
            &config,
        );
        assert!(result.end_time.is_none() && result.duration.is_none());
        let later = result.start_time + chrono::Duration::milliseconds(250);
        result.mark_rolled_back(later);
        assert!(result.rollback_executed);
        assert_eq!(result.end_time, Some(later));
        assert_eq!(result.duration, Some(Duration::from_millis(250)));
    }
}
