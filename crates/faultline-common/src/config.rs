//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Injector configuration: TOML loading, defaults, and validation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_proxy_api_url() -> String {
    "http://127.0.0.1:8474".to_owned()
}

fn default_proxy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_listen_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_max_latency_ms() -> u64 {
    5_000
}

fn default_max_bandwidth_kbps() -> u64 {
    1_024
}

fn default_max_timeout_ms() -> u64 {
    30_000
}

fn default_max_cold_start_ms() -> u64 {
    5_000
}

fn default_max_memory_mb() -> u64 {
    100
}

fn default_lambda_memory_mb() -> u64 {
    50
}

fn default_cpu_max_workers() -> u32 {
    4
}

fn default_cpu_busy_ms() -> u64 {
    100
}

fn default_cpu_tick_ms() -> u64 {
    200
}

fn default_ramp_steps() -> u32 {
    10
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the fault injection engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InjectorConfig {
    /// Optional seed so probabilistic interception faults replay deterministically.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub defaults: FaultDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`InjectorConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedInjectorConfig {
    pub config: InjectorConfig,
    pub source: PathBuf,
}

impl InjectorConfig {
    pub const ENV_CONFIG_PATH: &str = "FAULTLINE_CONFIG";

    /// Load configuration from disk, respecting the `FAULTLINE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedInjectorConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedInjectorConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedInjectorConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<InjectorConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;
        self.defaults.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for InjectorConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: InjectorConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Connection settings for the network proxy backend.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_api_url")]
    pub api_url: String,
    #[serde(default = "default_proxy_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Host the proxy listens on when a fault does not name a listen address.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_url: default_proxy_api_url(),
            request_timeout: default_proxy_timeout(),
            listen_host: default_listen_host(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.api_url)
            .with_context(|| format!("proxy api_url {} is not a valid url", self.api_url))?;
        if self.request_timeout.is_zero() {
            return Err(anyhow!("proxy request_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Ceilings used when a fault configuration omits its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultDefaults {
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_max_bandwidth_kbps")]
    pub max_bandwidth_kbps: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_max_cold_start_ms")]
    pub max_cold_start_ms: u64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Memory ceiling for the sandbox memory-limit emulation.
    #[serde(default = "default_lambda_memory_mb")]
    pub lambda_memory_mb: u64,
    #[serde(default = "default_cpu_max_workers")]
    pub cpu_max_workers: u32,
    #[serde(default = "default_cpu_busy_ms")]
    pub cpu_busy_ms: u64,
    #[serde(default = "default_cpu_tick_ms")]
    pub cpu_tick_ms: u64,
    #[serde(default = "default_ramp_steps")]
    pub ramp_steps: u32,
}

impl Default for FaultDefaults {
    fn default() -> Self {
        Self {
            max_latency_ms: default_max_latency_ms(),
            max_bandwidth_kbps: default_max_bandwidth_kbps(),
            max_timeout_ms: default_max_timeout_ms(),
            max_cold_start_ms: default_max_cold_start_ms(),
            max_memory_mb: default_max_memory_mb(),
            lambda_memory_mb: default_lambda_memory_mb(),
            cpu_max_workers: default_cpu_max_workers(),
            cpu_busy_ms: default_cpu_busy_ms(),
            cpu_tick_ms: default_cpu_tick_ms(),
            ramp_steps: default_ramp_steps(),
        }
    }
}

impl FaultDefaults {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_tick_ms == 0 {
            return Err(anyhow!("defaults.cpu_tick_ms must be greater than zero"));
        }
        if self.cpu_busy_ms > self.cpu_tick_ms {
            return Err(anyhow!(
                "defaults.cpu_busy_ms ({}) cannot exceed cpu_tick_ms ({})",
                self.cpu_busy_ms,
                self.cpu_tick_ms
            ));
        }
        if self.ramp_steps == 0 {
            return Err(anyhow!("defaults.ramp_steps must be greater than zero"));
        }
        Ok(())
    }

    pub fn cpu_busy(&self) -> Duration {
        Duration::from_millis(self.cpu_busy_ms)
    }

    pub fn cpu_tick(&self) -> Duration {
        Duration::from_millis(self.cpu_tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
