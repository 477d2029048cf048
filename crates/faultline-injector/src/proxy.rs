//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network proxy controller used for in-transit faults."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faultline_common::ProxyConfig;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{FaultError, Result};

/// Proxy definition accepted by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub name: String,
    pub listen: String,
    pub upstream: String,
    #[serde(default = "Proxy::default_enabled")]
    pub enabled: bool,
}

impl Proxy {
    const fn default_enabled() -> bool {
        true
    }

    pub fn new(
        name: impl Into<String>,
        listen: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            upstream: upstream.into(),
            enabled: true,
        }
    }
}

/// Direction of traffic a toxic applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToxicStream {
    Upstream,
    Downstream,
}

/// Fault behaviour attached to a proxy stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toxic {
    pub name: String,
    #[serde(rename = "type")]
    pub toxic_type: String,
    pub stream: ToxicStream,
    /// Fraction of connections the toxic applies to.
    pub toxicity: f64,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Toxic {
    /// Downstream toxic applied to every connection.
    pub fn downstream(name: impl Into<String>, toxic_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            toxic_type: toxic_type.into(),
            stream: ToxicStream::Downstream,
            toxicity: 1.0,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute_u64(&self, key: &str) -> Option<u64> {
        self.attributes.get(key).and_then(Value::as_u64)
    }
}

/// Narrow interface onto the network-proxy service.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;
    async fn create_proxy(&self, proxy: &Proxy) -> Result<()>;
    async fn add_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<()>;
    /// Replace the attributes of an existing toxic.
    async fn update_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<()>;
    async fn delete_proxy(&self, name: &str) -> Result<()>;
    async fn list_proxies(&self) -> Result<Vec<String>>;
    /// Human-readable backend name for logging.
    fn name(&self) -> &'static str;
}

/// HTTP client for the toxiproxy REST API.
#[derive(Debug, Clone)]
pub struct ToxiproxyClient {
    base_url: String,
    client: Client,
}

impl ToxiproxyClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FaultError::ProxyUnavailable(err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
        })
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        Self::new(config.api_url.clone(), config.request_timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(&self, response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(FaultError::ProxyRequest(format!(
            "{action} returned {status}: {}",
            body.trim()
        )))
    }
}

fn transport_error(err: reqwest::Error) -> FaultError {
    if err.is_connect() || err.is_timeout() {
        FaultError::ProxyUnavailable(err.to_string())
    } else {
        FaultError::ProxyRequest(err.to_string())
    }
}

#[async_trait]
impl ProxyBackend for ToxiproxyClient {
    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/version"))
            .send()
            .await
            .map_err(transport_error)?;
        self.check(response, "version probe").await?;
        Ok(())
    }

    async fn create_proxy(&self, proxy: &Proxy) -> Result<()> {
        debug!(proxy = %proxy.name, listen = %proxy.listen, upstream = %proxy.upstream, "creating proxy");
        let response = self
            .client
            .post(self.url("/proxies"))
            .json(proxy)
            .send()
            .await
            .map_err(transport_error)?;
        self.check(response, "create proxy").await?;
        Ok(())
    }

    async fn add_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<()> {
        debug!(proxy, toxic = %toxic.name, kind = %toxic.toxic_type, "adding toxic");
        let response = self
            .client
            .post(self.url(&format!("/proxies/{proxy}/toxics")))
            .json(toxic)
            .send()
            .await
            .map_err(transport_error)?;
        self.check(response, "add toxic").await?;
        Ok(())
    }

    async fn update_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/proxies/{proxy}/toxics/{}", toxic.name)))
            .json(&serde_json::json!({ "attributes": toxic.attributes }))
            .send()
            .await
            .map_err(transport_error)?;
        self.check(response, "update toxic").await?;
        Ok(())
    }

    async fn delete_proxy(&self, name: &str) -> Result<()> {
        debug!(proxy = name, "deleting proxy");
        let response = self
            .client
            .delete(self.url(&format!("/proxies/{name}")))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FaultError::ProxyRequest(format!("proxy {name} not found")));
        }
        self.check(response, "delete proxy").await?;
        Ok(())
    }

    async fn list_proxies(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("/proxies"))
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.check(response, "list proxies").await?;
        let proxies: BTreeMap<String, Value> = response
            .json()
            .await
            .map_err(|err| FaultError::ProxyRequest(err.to_string()))?;
        Ok(proxies.into_keys().collect())
    }

    fn name(&self) -> &'static str {
        "toxiproxy"
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    available: bool,
    proxies: BTreeMap<String, (Proxy, Vec<Toxic>)>,
}

/// In-memory proxy backend for tests and dry runs.
#[derive(Debug, Clone)]
pub struct InMemoryProxyBackend {
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemoryProxyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProxyBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                available: true,
                proxies: BTreeMap::new(),
            })),
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn proxy(&self, name: &str) -> Option<Proxy> {
        self.state.lock().proxies.get(name).map(|(p, _)| p.clone())
    }

    pub fn toxics(&self, proxy: &str) -> Vec<Toxic> {
        self.state
            .lock()
            .proxies
            .get(proxy)
            .map(|(_, toxics)| toxics.clone())
            .unwrap_or_default()
    }

    fn ensure_available(state: &InMemoryState) -> Result<()> {
        if state.available {
            Ok(())
        } else {
            Err(FaultError::ProxyUnavailable(
                "in-memory backend marked unavailable".into(),
            ))
        }
    }
}

#[async_trait]
impl ProxyBackend for InMemoryProxyBackend {
    async fn ping(&self) -> Result<()> {
        Self::ensure_available(&self.state.lock())
    }

    async fn create_proxy(&self, proxy: &Proxy) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_available(&state)?;
        if state.proxies.contains_key(&proxy.name) {
            return Err(FaultError::ProxyRequest(format!(
                "proxy {} already exists",
                proxy.name
            )));
        }
        state
            .proxies
            .insert(proxy.name.clone(), (proxy.clone(), Vec::new()));
        Ok(())
    }

    async fn add_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_available(&state)?;
        let (_, toxics) = state
            .proxies
            .get_mut(proxy)
            .ok_or_else(|| FaultError::ProxyRequest(format!("proxy {proxy} not found")))?;
        if toxics.iter().any(|existing| existing.name == toxic.name) {
            return Err(FaultError::ProxyRequest(format!(
                "toxic {} already exists on {proxy}",
                toxic.name
            )));
        }
        toxics.push(toxic.clone());
        Ok(())
    }

    async fn update_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_available(&state)?;
        let existing = state
            .proxies
            .get_mut(proxy)
            .and_then(|(_, toxics)| toxics.iter_mut().find(|t| t.name == toxic.name))
            .ok_or_else(|| {
                FaultError::ProxyRequest(format!("toxic {} not found on {proxy}", toxic.name))
            })?;
        existing.attributes = toxic.attributes.clone();
        Ok(())
    }

    async fn delete_proxy(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_available(&state)?;
        state
            .proxies
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FaultError::ProxyRequest(format!("proxy {name} not found")))
    }

    async fn list_proxies(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        Self::ensure_available(&state)?;
        Ok(state.proxies.keys().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
