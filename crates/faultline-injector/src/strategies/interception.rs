//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Interception-based faults: serverless chaos and payload corruption."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

use super::scaled_floor;
use crate::error::{FaultError, Result};
use crate::injector::{FaultInjector, InjectionScope};
use crate::interceptor::{InterceptError, RequestHook};
use crate::types::{FaultConfiguration, FaultType};

/// Share of the failure probability applied to cold starts.
pub const COLD_START_FACTOR: f64 = 0.3;

/// Serverless runtime failure selected by `chaosType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaChaos {
    Exception,
    Timeout,
    ColdStart,
    MemoryLimit,
}

impl LambdaChaos {
    pub fn as_str(&self) -> &'static str {
        match self {
            LambdaChaos::Exception => "exception",
            LambdaChaos::Timeout => "timeout",
            LambdaChaos::ColdStart => "cold_start",
            LambdaChaos::MemoryLimit => "memory_limit",
        }
    }
}

impl FromStr for LambdaChaos {
    type Err = FaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exception" => Ok(LambdaChaos::Exception),
            "timeout" => Ok(LambdaChaos::Timeout),
            "cold_start" => Ok(LambdaChaos::ColdStart),
            "memory_limit" => Ok(LambdaChaos::MemoryLimit),
            other => Err(FaultError::invalid(format!("unknown chaosType {other}"))),
        }
    }
}

/// Per-call draw against `probability`, then fail, stall, or stall and fail.
pub struct ChaosHook {
    name: String,
    kind: LambdaChaos,
    probability: f64,
    delay: Duration,
    rng: Mutex<StdRng>,
}

impl ChaosHook {
    fn roll(&self) -> bool {
        self.rng.lock().gen::<f64>() < self.probability
    }
}

#[async_trait]
impl RequestHook for ChaosHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_call(&self, target: &str) -> std::result::Result<(), InterceptError> {
        if !self.roll() {
            return Ok(());
        }
        match self.kind {
            LambdaChaos::Exception => Err(InterceptError::Injected {
                target: target.to_owned(),
                message: format!("{} raised an injected exception", self.name),
            }),
            LambdaChaos::Timeout => {
                tokio::time::sleep(self.delay).await;
                Err(InterceptError::TimedOut {
                    target: target.to_owned(),
                    elapsed_ms: self.delay.as_millis() as u64,
                })
            }
            LambdaChaos::ColdStart | LambdaChaos::MemoryLimit => {
                tokio::time::sleep(self.delay).await;
                Ok(())
            }
        }
    }
}

/// Flips `bytes` bytes of the response payload with probability `probability`.
pub struct CorruptionHook {
    name: String,
    probability: f64,
    bytes: usize,
    rng: Mutex<StdRng>,
}

#[async_trait]
impl RequestHook for CorruptionHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_call(&self, _target: &str) -> std::result::Result<(), InterceptError> {
        Ok(())
    }

    fn after_call(&self, target: &str, payload: &mut Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        let mut rng = self.rng.lock();
        if rng.gen::<f64>() >= self.probability {
            return;
        }
        for _ in 0..self.bytes {
            let index = rng.gen_range(0..payload.len());
            payload[index] ^= rng.gen_range(1..=u8::MAX);
        }
        debug!(target: "faultline::injector::interception", hook = %self.name, target_id = target, bytes = self.bytes, "payload corrupted");
    }
}

impl FaultInjector {
    pub(crate) async fn inject_lambda_chaos(
        &self,
        config: &FaultConfiguration,
        scope: &InjectionScope<'_>,
    ) -> Result<()> {
        let chaos: LambdaChaos = config.require_str("chaosType")?.parse()?;
        if config.gradual_ramp_up {
            debug!(target: "faultline::injector::interception", "ramp-up not supported for lambda_chaos");
        }
        let intensity = config.intensity;
        let defaults = &self.inner.defaults;
        let (probability, delay_ms) = match chaos {
            LambdaChaos::MemoryLimit => {
                return self
                    .hold_memory(scope, scaled_floor(intensity, defaults.lambda_memory_mb))
                    .await;
            }
            LambdaChaos::Exception => (intensity, 0),
            LambdaChaos::Timeout => {
                let max = config.param_u64("maxTimeout")?.unwrap_or(defaults.max_timeout_ms);
                (intensity, (intensity * max as f64).round() as u64)
            }
            LambdaChaos::ColdStart => {
                let max = config
                    .param_u64("maxColdStart")?
                    .unwrap_or(defaults.max_cold_start_ms);
                (
                    intensity * COLD_START_FACTOR,
                    (intensity * max as f64).round() as u64,
                )
            }
        };

        scope.record_metric("failure_probability", probability);
        if chaos != LambdaChaos::Exception {
            scope.record_metric("delay_ms", delay_ms as f64);
        }
        let hook = ChaosHook {
            name: format!("lambda_{}:{}", chaos.as_str(), scope.fault_id()),
            kind: chaos,
            probability,
            delay: Duration::from_millis(delay_ms),
            rng: Mutex::new(self.rng_for(scope.fault_id())),
        };
        self.install_hook(scope, Arc::new(hook)).await;
        Ok(())
    }

    pub(crate) async fn inject_data_corruption(
        &self,
        config: &FaultConfiguration,
        scope: &InjectionScope<'_>,
    ) -> Result<()> {
        let bytes = config.param_u64("bytesPerResponse")?.unwrap_or(1).max(1) as usize;
        scope.record_metric("corruption_probability", config.intensity);
        let hook = CorruptionHook {
            name: format!("{}:{}", FaultType::DataCorruption, scope.fault_id()),
            probability: config.intensity,
            bytes,
            rng: Mutex::new(self.rng_for(scope.fault_id())),
        };
        self.install_hook(scope, Arc::new(hook)).await;
        Ok(())
    }

    /// Wrap the current hook chain and register the matching restore as cleanup.
    async fn install_hook(&self, scope: &InjectionScope<'_>, hook: Arc<dyn RequestHook>) {
        let interceptor = self.inner.interceptor.clone();
        let handle = interceptor.install(hook);
        scope
            .register_cleanup("restore_interceptor", move || {
                interceptor.restore(handle);
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn chaos_type_parses_known_names() {
        assert_eq!("cold_start".parse::<LambdaChaos>().unwrap(), LambdaChaos::ColdStart);
        assert!("throttle".parse::<LambdaChaos>().is_err());
    }

    #[test]
    fn corruption_changes_payload_when_certain() {
        let hook = CorruptionHook {
            name: "c".into(),
            probability: 1.0,
            bytes: 1,
            rng: Mutex::new(StdRng::seed_from_u64(7)),
        };
        let original = b"hello world".to_vec();
        let mut payload = original.clone();
        hook.after_call("svc", &mut payload);
        assert_eq!(payload.len(), original.len());
        assert_ne!(payload, original);
    }

    #[tokio::test]
    async fn zero_probability_exception_hook_passes_through() {
        let hook = ChaosHook {
            name: "e".into(),
            kind: LambdaChaos::Exception,
            probability: 0.0,
            delay: Duration::ZERO,
            rng: Mutex::new(StdRng::seed_from_u64(1)),
        };
        assert!(hook.before_call("svc").await.is_ok());
    }
}
