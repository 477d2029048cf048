//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Proxy-backed network partition, latency, and bandwidth faults."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use faultline_common::FaultDefaults;
use tracing::{debug, warn};

use crate::error::{FaultError, Result};
use crate::injector::{FaultInjector, InjectionScope};
use crate::proxy::{Proxy, ProxyBackend, Toxic};
use crate::types::{ArtifactType, FaultArtifact, FaultConfiguration, FaultType};

/// Ramp-up window used when a configuration asks for one without a duration.
pub const DEFAULT_RAMP_UP: Duration = Duration::from_secs(30);

/// Injected latency and jitter in milliseconds for `intensity`.
pub fn latency_for(intensity: f64, max_latency_ms: u64) -> (u64, u64) {
    let latency = (intensity * max_latency_ms as f64).round() as u64;
    let jitter = (latency as f64 * 0.1).round() as u64;
    (latency, jitter)
}

/// Remaining throughput in KB/s once `intensity` of `max_kbps` is taken away.
pub fn bandwidth_rate(intensity: f64, max_kbps: u64) -> u64 {
    ((1.0 - intensity) * max_kbps as f64).round().max(0.0) as u64
}

/// Partition throughput; zero for a full partition, or for any non-zero intensity when toggled.
pub fn partition_rate(intensity: f64, max_kbps: u64, toggle: bool) -> u64 {
    if intensity >= 1.0 || (toggle && intensity > 0.0) {
        0
    } else {
        bandwidth_rate(intensity, max_kbps)
    }
}

/// Toxic parameters for one of the three proxy-backed fault types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetworkShape {
    Partition { max_kbps: u64, toggle: bool },
    Latency { max_latency_ms: u64 },
    Bandwidth { max_kbps: u64 },
}

impl NetworkShape {
    pub fn from_config(config: &FaultConfiguration, defaults: &FaultDefaults) -> Result<Self> {
        let max_kbps = config
            .param_u64("maxBandwidth")?
            .unwrap_or(defaults.max_bandwidth_kbps);
        match config.fault_type {
            FaultType::NetworkPartition => Ok(NetworkShape::Partition {
                max_kbps,
                toggle: config.param_bool("toggle")?.unwrap_or(false),
            }),
            FaultType::HighLatency => Ok(NetworkShape::Latency {
                max_latency_ms: config
                    .param_u64("maxLatency")?
                    .unwrap_or(defaults.max_latency_ms),
            }),
            FaultType::BandwidthLimit => Ok(NetworkShape::Bandwidth { max_kbps }),
            other => Err(FaultError::invalid(format!(
                "{other} is not a network fault"
            ))),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            NetworkShape::Partition { .. } => "partition",
            NetworkShape::Latency { .. } => "latency",
            NetworkShape::Bandwidth { .. } => "bandwidth",
        }
    }

    /// Toxic applying this shape at `intensity`.
    pub fn toxic(&self, name: &str, intensity: f64) -> Toxic {
        match *self {
            NetworkShape::Partition { max_kbps, toggle } => Toxic::downstream(name, "bandwidth")
                .with_attribute("rate", partition_rate(intensity, max_kbps, toggle)),
            NetworkShape::Latency { max_latency_ms } => {
                let (latency, jitter) = latency_for(intensity, max_latency_ms);
                Toxic::downstream(name, "latency")
                    .with_attribute("latency", latency)
                    .with_attribute("jitter", jitter)
            }
            NetworkShape::Bandwidth { max_kbps } => Toxic::downstream(name, "bandwidth")
                .with_attribute("rate", bandwidth_rate(intensity, max_kbps)),
        }
    }

    fn record_metrics(&self, intensity: f64, scope: &InjectionScope<'_>) {
        match *self {
            NetworkShape::Partition { max_kbps, toggle } => scope.record_metric(
                "partition_rate_kbps",
                partition_rate(intensity, max_kbps, toggle) as f64,
            ),
            NetworkShape::Latency { max_latency_ms } => {
                let (latency, jitter) = latency_for(intensity, max_latency_ms);
                scope.record_metric("latency_ms", latency as f64);
                scope.record_metric("jitter_ms", jitter as f64);
            }
            NetworkShape::Bandwidth { max_kbps } => scope.record_metric(
                "bandwidth_rate_kbps",
                bandwidth_rate(intensity, max_kbps) as f64,
            ),
        }
    }
}

/// Upstream address from `upstream`, `port`, or a target that is itself an address.
pub(crate) fn resolve_upstream(config: &FaultConfiguration) -> Result<String> {
    if let Some(upstream) = config.param_str("upstream")? {
        return Ok(upstream.to_owned());
    }
    if let Some(port) = config.param_u64("port")? {
        return Ok(format!("127.0.0.1:{port}"));
    }
    if config.target.parse::<u16>().is_ok() {
        return Ok(format!("127.0.0.1:{}", config.target));
    }
    if config.target.contains(':') {
        return Ok(config.target.clone());
    }
    Err(FaultError::invalid(format!(
        "{} fault on {} requires an upstream or port parameter",
        config.fault_type, config.target
    )))
}

impl FaultInjector {
    /// Put a proxy in front of the target and attach the fault's toxic to it.
    pub(crate) async fn inject_network_fault(
        &self,
        config: &FaultConfiguration,
        scope: &InjectionScope<'_>,
    ) -> Result<()> {
        let shape = NetworkShape::from_config(config, &self.inner.defaults)?;
        let upstream = resolve_upstream(config)?;
        let listen = format!(
            "{}:{}",
            self.inner.listen_host,
            config.param_u64("listenPort")?.unwrap_or(0)
        );

        let backend = self.proxy_backend()?;
        backend.ping().await?;

        let proxy_name = format!(
            "{}_{}_{}",
            config.target,
            shape.label(),
            scope.fault_id().resource_suffix()
        );
        let proxy = Proxy::new(&proxy_name, listen, upstream);
        backend.create_proxy(&proxy).await?;
        scope
            .record_artifact(FaultArtifact::new(
                ArtifactType::Proxy,
                &proxy_name,
                serde_json::to_value(&proxy)?,
                true,
            ))
            .await;

        let toxic_name = format!("{proxy_name}_{}", shape.label());
        let initial = if config.gradual_ramp_up {
            0.0
        } else {
            config.intensity
        };
        backend
            .add_toxic(&proxy_name, &shape.toxic(&toxic_name, initial))
            .await?;
        shape.record_metrics(config.intensity, scope);

        if config.gradual_ramp_up {
            let window = config.ramp_up_duration.unwrap_or(DEFAULT_RAMP_UP);
            self.start_ramp_up(
                scope,
                backend.clone(),
                proxy_name.clone(),
                toxic_name,
                shape,
                config.intensity,
                window,
            )
            .await;
        }
        debug!(
            target: "faultline::injector::network",
            fault_id = %scope.fault_id(),
            proxy = %proxy_name,
            backend = backend.name(),
            "network fault applied"
        );
        Ok(())
    }

    /// Raise the toxic to `intensity` in equal steps across `window`.
    #[allow(clippy::too_many_arguments)]
    async fn start_ramp_up(
        &self,
        scope: &InjectionScope<'_>,
        backend: Arc<dyn ProxyBackend>,
        proxy: String,
        toxic_name: String,
        shape: NetworkShape,
        intensity: f64,
        window: Duration,
    ) {
        let steps = self.inner.defaults.ramp_steps.max(1);
        let interval = window / steps;
        let fault_id = scope.fault_id();
        let task = tokio::spawn(async move {
            for step in 1..=steps {
                tokio::time::sleep(interval).await;
                let level = intensity * f64::from(step) / f64::from(steps);
                if let Err(err) = backend
                    .update_toxic(&proxy, &shape.toxic(&toxic_name, level))
                    .await
                {
                    warn!(
                        target: "faultline::injector::network",
                        fault_id = %fault_id,
                        proxy = %proxy,
                        step,
                        error = %err,
                        "ramp-up step failed"
                    );
                }
            }
            debug!(target: "faultline::injector::network", fault_id = %fault_id, "ramp-up complete");
        });
        let ramp = task.abort_handle();
        scope
            .register_cleanup("abort_ramp_up", move || ramp.abort())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_scales_with_intensity() {
        assert_eq!(latency_for(0.5, 5000), (2500, 250));
        assert_eq!(latency_for(0.0, 5000), (0, 0));
        assert_eq!(latency_for(1.0, 1200), (1200, 120));
    }

    #[test]
    fn bandwidth_is_zero_at_full_intensity() {
        assert_eq!(bandwidth_rate(1.0, 1024), 0);
        assert_eq!(bandwidth_rate(0.0, 1024), 1024);
        assert_eq!(bandwidth_rate(0.25, 1000), 750);
    }

    #[test]
    fn partition_blocks_fully_when_toggled() {
        assert_eq!(partition_rate(0.2, 1024, true), 0);
        assert_eq!(partition_rate(1.0, 1024, false), 0);
        assert_eq!(partition_rate(0.5, 1000, false), 500);
        assert_eq!(partition_rate(0.0, 1000, true), 1000);
    }

    #[test]
    fn upstream_resolution_prefers_explicit_parameters() {
        let config = FaultConfiguration::new(FaultType::HighLatency, "bridge", 0.5)
            .with_param("upstream", "db:5432")
            .with_param("port", 9000);
        assert_eq!(resolve_upstream(&config).unwrap(), "db:5432");

        let config = FaultConfiguration::new(FaultType::HighLatency, "bridge", 0.5)
            .with_param("port", 9000);
        assert_eq!(resolve_upstream(&config).unwrap(), "127.0.0.1:9000");

        let config = FaultConfiguration::new(FaultType::HighLatency, "8080", 0.5);
        assert_eq!(resolve_upstream(&config).unwrap(), "127.0.0.1:8080");

        let config = FaultConfiguration::new(FaultType::HighLatency, "bridge", 0.5);
        assert!(matches!(
            resolve_upstream(&config),
            Err(FaultError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn ramp_start_point_leaves_traffic_untouched() {
        let shape = NetworkShape::Latency {
            max_latency_ms: 5000,
        };
        let toxic = shape.toxic("t", 0.0);
        assert_eq!(toxic.attribute_u64("latency"), Some(0));

        let shape = NetworkShape::Partition {
            max_kbps: 1024,
            toggle: true,
        };
        assert_eq!(shape.toxic("t", 0.0).attribute_u64("rate"), Some(1024));
        assert_eq!(shape.toxic("t", 0.4).attribute_u64("rate"), Some(0));
    }
}
