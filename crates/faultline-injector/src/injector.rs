//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fault injector: inject, remove, and clean up with artifact rollback."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use faultline_common::{new_registry, FaultDefaults, InjectorConfig};
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cascade::CascadeHandle;
use crate::error::{FaultError, Result};
use crate::events::{FaultEvent, FaultObserver};
use crate::interceptor::Interceptor;
use crate::metrics::InjectorMetrics;
use crate::process::{ProcessInspector, SystemProcessInspector};
use crate::proxy::{ProxyBackend, ToxiproxyClient};
use crate::registry::FaultRegistry;
use crate::types::{
    ArtifactType, FaultArtifact, FaultConfiguration, FaultId, FaultInjectionResult, FaultType,
};

const EVENT_CAPACITY: usize = 256;
const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// Process-local state held by a fault, released by running the closure.
struct CleanupTask {
    owner: FaultId,
    label: &'static str,
    run: CleanupFn,
}

/// Summary of one [`FaultInjector::cleanup`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Faults rolled back and removed from the active table.
    pub removed: usize,
    /// Ad-hoc cleanup tasks left over after the removals and drained afterwards.
    pub drained_tasks: usize,
    /// Cascade steps that had not fired yet and were cancelled.
    pub cancelled_cascade_steps: usize,
}

pub(crate) struct InjectorInner {
    pub(crate) registry: Mutex<FaultRegistry>,
    cleanup_tasks: Mutex<Vec<CleanupTask>>,
    pub(crate) cascades: Mutex<HashMap<FaultId, Vec<CascadeHandle>>>,
    pub(crate) proxy: Option<Arc<dyn ProxyBackend>>,
    pub(crate) processes: Arc<dyn ProcessInspector>,
    pub(crate) interceptor: Arc<Interceptor>,
    pub(crate) defaults: FaultDefaults,
    pub(crate) listen_host: String,
    seed: Option<u64>,
    pub(crate) metrics: Option<InjectorMetrics>,
    observers: RwLock<Vec<Arc<dyn FaultObserver>>>,
    events: broadcast::Sender<FaultEvent>,
}

/// Applies faults, tracks their side effects, and reverses them on request.
///
/// Cloning is cheap; every clone drives the same active-fault table.
#[derive(Clone)]
pub struct FaultInjector {
    pub(crate) inner: Arc<InjectorInner>,
}

/// Builder for [`FaultInjector`].
pub struct FaultInjectorBuilder {
    proxy: Option<Arc<dyn ProxyBackend>>,
    processes: Option<Arc<dyn ProcessInspector>>,
    interceptor: Option<Arc<Interceptor>>,
    defaults: FaultDefaults,
    listen_host: String,
    seed: Option<u64>,
    metrics: Option<InjectorMetrics>,
}

impl Default for FaultInjectorBuilder {
    fn default() -> Self {
        Self {
            proxy: None,
            processes: None,
            interceptor: None,
            defaults: FaultDefaults::default(),
            listen_host: DEFAULT_LISTEN_HOST.to_owned(),
            seed: None,
            metrics: None,
        }
    }
}

impl FaultInjectorBuilder {
    /// Proxy backend used by network faults. Without one, network faults fail fast.
    pub fn proxy_backend(mut self, backend: Arc<dyn ProxyBackend>) -> Self {
        self.proxy = Some(backend);
        self
    }

    pub fn process_inspector(mut self, inspector: Arc<dyn ProcessInspector>) -> Self {
        self.processes = Some(inspector);
        self
    }

    /// Hook point used by interception-based faults; defaults to [`Interceptor::global`].
    pub fn interceptor(mut self, interceptor: Arc<Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn defaults(mut self, defaults: FaultDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    /// Seed for the per-fault random draws; each fault mixes in its own generation.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn metrics(mut self, metrics: InjectorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> FaultInjector {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        FaultInjector {
            inner: Arc::new(InjectorInner {
                registry: Mutex::new(FaultRegistry::default()),
                cleanup_tasks: Mutex::new(Vec::new()),
                cascades: Mutex::new(HashMap::new()),
                proxy: self.proxy,
                processes: self
                    .processes
                    .unwrap_or_else(|| Arc::new(SystemProcessInspector::new())),
                interceptor: self.interceptor.unwrap_or_else(Interceptor::global),
                defaults: self.defaults,
                listen_host: self.listen_host,
                seed: self.seed,
                metrics: self.metrics,
                observers: RwLock::new(Vec::new()),
                events,
            }),
        }
    }
}

impl FaultInjector {
    pub fn builder() -> FaultInjectorBuilder {
        FaultInjectorBuilder::default()
    }

    /// Wire an injector against the real proxy controller and process table.
    pub fn from_config(config: &InjectorConfig) -> Result<Self> {
        let mut builder = Self::builder()
            .proxy_backend(Arc::new(ToxiproxyClient::from_config(&config.proxy)?))
            .defaults(config.defaults.clone())
            .listen_host(config.proxy.listen_host.clone());
        if let Some(seed) = config.seed {
            builder = builder.seed(seed);
        }
        if config.metrics.enabled {
            builder = builder.metrics(InjectorMetrics::new(new_registry())?);
        }
        Ok(builder.build())
    }

    /// Apply `config` and return the recorded result.
    ///
    /// The result is registered before the strategy runs, so a concurrent
    /// [`cleanup`](Self::cleanup) sees partially applied state. A failing
    /// strategy is rolled back through [`remove_fault`](Self::remove_fault)
    /// before its error is returned.
    pub async fn inject_fault(&self, config: FaultConfiguration) -> Result<FaultInjectionResult> {
        config.validate()?;
        let fault_id = {
            let mut registry = self.inner.registry.lock();
            let fault_id = registry.insert(&config);
            self.set_active_gauge(registry.len());
            fault_id
        };
        debug!(
            target: "faultline::injector",
            fault_id = %fault_id,
            fault_type = %config.fault_type,
            target_id = %config.target,
            "fault registered"
        );

        let scope = InjectionScope {
            injector: self,
            fault_id,
        };
        match self.dispatch(&config, &scope).await {
            Ok(()) => {
                let result = self.inner.registry.lock().live_mut(fault_id).map(|result| {
                    result.success = true;
                    result.clone()
                });
                let Some(result) = result else {
                    warn!(
                        target: "faultline::injector",
                        fault_id = %fault_id,
                        "fault was removed before injection completed"
                    );
                    return Err(FaultError::UnknownFault(fault_id));
                };
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_injected(config.fault_type);
                }
                warn!(
                    target: "faultline::injector",
                    fault_id = %fault_id,
                    fault_type = %config.fault_type,
                    target_id = %config.target,
                    intensity = config.intensity,
                    method = %result.injection_method,
                    artifacts = result.artifacts.len(),
                    "fault injected"
                );
                self.publish(FaultEvent::Injected {
                    fault_id,
                    config,
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(err) => {
                error!(
                    target: "faultline::injector",
                    fault_id = %fault_id,
                    fault_type = %config.fault_type,
                    target_id = %config.target,
                    error = %err,
                    "fault injection failed, rolling back"
                );
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_injection_failure(config.fault_type);
                }
                self.remove_fault(fault_id).await;
                Err(err)
            }
        }
    }

    /// Boxed entry point for callers that must name the future type, such as cascade steps.
    pub(crate) fn inject_boxed(
        &self,
        config: FaultConfiguration,
    ) -> BoxFuture<'static, Result<FaultInjectionResult>> {
        let injector = self.clone();
        Box::pin(async move { injector.inject_fault(config).await })
    }

    async fn dispatch(&self, config: &FaultConfiguration, scope: &InjectionScope<'_>) -> Result<()> {
        match config.fault_type {
            FaultType::NetworkPartition | FaultType::HighLatency | FaultType::BandwidthLimit => {
                self.inject_network_fault(config, scope).await
            }
            FaultType::ServiceCrash => self.inject_service_crash(config, scope).await,
            FaultType::ResourceExhaustion => self.inject_resource_exhaustion(config, scope).await,
            FaultType::DataCorruption => self.inject_data_corruption(config, scope).await,
            FaultType::LambdaChaos => self.inject_lambda_chaos(config, scope).await,
            FaultType::CascadingFailure => self.inject_cascading_failure(config, scope).await,
        }
    }

    /// Reverse every artifact of `fault_id` and drop it from the active table.
    ///
    /// Returns false for unknown, stale, or already removed ids. Reversal
    /// failures are logged per artifact and never abort the pass.
    pub async fn remove_fault(&self, fault_id: FaultId) -> bool {
        let artifacts = {
            let mut registry = self.inner.registry.lock();
            match registry.get_mut(fault_id) {
                Some(entry) if !entry.removing => {
                    entry.removing = true;
                    entry.result.artifacts.clone()
                }
                _ => return false,
            }
        };

        for artifact in &artifacts {
            if artifact.cleanup_required {
                self.reverse_artifact(fault_id, artifact).await;
            } else {
                debug!(
                    target: "faultline::injector::rollback",
                    fault_id = %fault_id,
                    artifact = artifact.artifact_type.as_str(),
                    identifier = %artifact.identifier,
                    "artifact is irreversible, skipping"
                );
            }
        }

        let owned: Vec<CleanupTask> = {
            let mut tasks = self.inner.cleanup_tasks.lock();
            let (owned, rest) = std::mem::take(&mut *tasks)
                .into_iter()
                .partition(|task| task.owner == fault_id);
            *tasks = rest;
            owned
        };
        for task in owned.into_iter().rev() {
            self.run_cleanup_task(task).await;
        }

        let removed = {
            let mut registry = self.inner.registry.lock();
            let removed = registry.remove(fault_id);
            self.set_active_gauge(registry.len());
            removed
        };
        let Some(mut entry) = removed else {
            return false;
        };
        self.prune_cascade(fault_id);
        entry.result.mark_rolled_back(Utc::now());
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_removed(entry.result.fault_type);
        }
        info!(
            target: "faultline::injector",
            fault_id = %fault_id,
            fault_type = %entry.result.fault_type,
            target_id = %entry.result.target,
            duration_ms = entry.result.duration.map(|d| d.as_millis() as u64).unwrap_or_default(),
            "fault removed"
        );
        self.publish(FaultEvent::Removed {
            fault_id,
            result: entry.result,
        });
        true
    }

    /// Undo everything: cancel unfired cascade steps, remove every active
    /// fault concurrently, then drain leftover ad-hoc cleanup tasks LIFO.
    pub async fn cleanup(&self) -> CleanupReport {
        let cancelled_cascade_steps = self.cancel_all_cascades();
        let ids = self.inner.registry.lock().ids();
        let removed = join_all(ids.iter().map(|fault_id| self.remove_fault(*fault_id)))
            .await
            .into_iter()
            .filter(|removed| *removed)
            .count();

        let leftover = std::mem::take(&mut *self.inner.cleanup_tasks.lock());
        let drained_tasks = leftover.len();
        for task in leftover.into_iter().rev() {
            self.run_cleanup_task(task).await;
        }

        let report = CleanupReport {
            removed,
            drained_tasks,
            cancelled_cascade_steps,
        };
        if report != CleanupReport::default() {
            info!(
                target: "faultline::injector",
                removed,
                drained_tasks,
                cancelled_cascade_steps,
                "cleanup pass complete"
            );
        }
        report
    }

    /// Snapshot of one active fault.
    pub fn fault(&self, fault_id: FaultId) -> Option<FaultInjectionResult> {
        self.inner
            .registry
            .lock()
            .get(fault_id)
            .map(|entry| entry.result.clone())
    }

    /// Configuration an active fault was injected with.
    pub fn fault_config(&self, fault_id: FaultId) -> Option<FaultConfiguration> {
        self.inner
            .registry
            .lock()
            .get(fault_id)
            .map(|entry| entry.config.clone())
    }

    /// Snapshots of every active fault, oldest first.
    pub fn active_faults(&self) -> Vec<FaultInjectionResult> {
        let registry = self.inner.registry.lock();
        registry
            .ids()
            .into_iter()
            .filter_map(|fault_id| registry.get(fault_id).map(|entry| entry.result.clone()))
            .collect()
    }

    pub fn active_fault_ids(&self) -> Vec<FaultId> {
        self.inner.registry.lock().ids()
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Number of ad-hoc cleanup tasks still holding process-local state.
    pub fn pending_cleanup_tasks(&self) -> usize {
        self.inner.cleanup_tasks.lock().len()
    }

    /// Receive every lifecycle event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<FaultEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn FaultObserver>) {
        self.inner.observers.write().push(observer);
    }

    pub fn interceptor(&self) -> Arc<Interceptor> {
        self.inner.interceptor.clone()
    }

    pub fn metrics(&self) -> Option<&InjectorMetrics> {
        self.inner.metrics.as_ref()
    }

    pub fn defaults(&self) -> &FaultDefaults {
        &self.inner.defaults
    }

    pub(crate) fn proxy_backend(&self) -> Result<Arc<dyn ProxyBackend>> {
        self.inner
            .proxy
            .clone()
            .ok_or_else(|| FaultError::ProxyUnavailable("no proxy backend configured".into()))
    }

    pub(crate) fn rng_for(&self, fault_id: FaultId) -> StdRng {
        match self.inner.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ fault_id.generation()),
            None => StdRng::from_entropy(),
        }
    }

    fn publish(&self, event: FaultEvent) {
        let observers = self.inner.observers.read().clone();
        for observer in &observers {
            match &event {
                FaultEvent::Injected {
                    fault_id,
                    config,
                    result,
                } => observer.on_fault_injected(*fault_id, config, result),
                FaultEvent::Removed { fault_id, result } => {
                    observer.on_fault_removed(*fault_id, result)
                }
            }
        }
        let label = event.label();
        if self.inner.events.send(event).is_err() {
            debug!(target: "faultline::injector", event = label, "no event subscribers");
        }
    }

    async fn reverse_artifact(&self, fault_id: FaultId, artifact: &FaultArtifact) {
        let outcome = match artifact.artifact_type {
            ArtifactType::Proxy => match self.proxy_backend() {
                Ok(backend) => backend.delete_proxy(&artifact.identifier).await,
                Err(err) => Err(err),
            },
            other => {
                warn!(
                    target: "faultline::injector::rollback",
                    fault_id = %fault_id,
                    artifact = other.as_str(),
                    identifier = %artifact.identifier,
                    "no reversal available for artifact"
                );
                Ok(())
            }
        };
        match outcome {
            Ok(()) => debug!(
                target: "faultline::injector::rollback",
                fault_id = %fault_id,
                artifact = artifact.artifact_type.as_str(),
                identifier = %artifact.identifier,
                "artifact reversed"
            ),
            Err(err) => {
                warn!(
                    target: "faultline::injector::rollback",
                    fault_id = %fault_id,
                    artifact = artifact.artifact_type.as_str(),
                    identifier = %artifact.identifier,
                    error = %err,
                    "artifact cleanup failed"
                );
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_artifact_cleanup_failure(artifact.artifact_type.as_str());
                }
            }
        }
    }

    async fn run_cleanup_task(&self, task: CleanupTask) {
        let CleanupTask { owner, label, run } = task;
        match tokio::task::spawn_blocking(run).await {
            Ok(()) => debug!(
                target: "faultline::injector::rollback",
                fault_id = %owner,
                task = label,
                "cleanup task ran"
            ),
            Err(err) => warn!(
                target: "faultline::injector::rollback",
                fault_id = %owner,
                task = label,
                error = %err,
                "cleanup task failed"
            ),
        }
    }

    fn set_active_gauge(&self, count: usize) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_active(count);
        }
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("active", &self.active_count())
            .field("proxy", &self.inner.proxy.as_ref().map(|proxy| proxy.name()))
            .field("interceptor_depth", &self.inner.interceptor.depth())
            .finish_non_exhaustive()
    }
}

/// Write access a strategy gets to the fault it is applying.
///
/// Anything recorded after a concurrent removal claimed the fault is
/// reversed on the spot instead of being attached to the result.
pub(crate) struct InjectionScope<'a> {
    injector: &'a FaultInjector,
    fault_id: FaultId,
}

impl InjectionScope<'_> {
    pub(crate) fn fault_id(&self) -> FaultId {
        self.fault_id
    }

    pub(crate) async fn record_artifact(&self, artifact: FaultArtifact) {
        let rejected = {
            let mut registry = self.injector.inner.registry.lock();
            match registry.live_mut(self.fault_id) {
                Some(result) => {
                    result.artifacts.push(artifact);
                    None
                }
                None => Some(artifact),
            }
        };
        if let Some(artifact) = rejected {
            warn!(
                target: "faultline::injector::rollback",
                fault_id = %self.fault_id,
                identifier = %artifact.identifier,
                "fault removed mid-injection, reversing artifact immediately"
            );
            if artifact.cleanup_required {
                self.injector.reverse_artifact(self.fault_id, &artifact).await;
            }
        }
    }

    pub(crate) fn record_metric(&self, name: &str, value: f64) {
        if let Some(result) = self.injector.inner.registry.lock().live_mut(self.fault_id) {
            result.record_metric(name, value);
        }
    }

    pub(crate) async fn register_cleanup(
        &self,
        label: &'static str,
        run: impl FnOnce() + Send + 'static,
    ) {
        let task = CleanupTask {
            owner: self.fault_id,
            label,
            run: Box::new(run),
        };
        let rejected = {
            let mut registry = self.injector.inner.registry.lock();
            if registry.live_mut(self.fault_id).is_some() {
                self.injector.inner.cleanup_tasks.lock().push(task);
                None
            } else {
                Some(task)
            }
        };
        if let Some(task) = rejected {
            self.injector.run_cleanup_task(task).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::InMemoryProxyBackend;

    fn injector() -> (FaultInjector, Arc<InMemoryProxyBackend>) {
        let backend = Arc::new(InMemoryProxyBackend::new());
        let injector = FaultInjector::builder()
            .proxy_backend(backend.clone())
            .interceptor(Arc::new(Interceptor::new()))
            .build();
        (injector, backend)
    }

    #[tokio::test]
    async fn invalid_intensity_is_rejected_before_registration() {
        let (injector, _) = injector();
        let config = FaultConfiguration::new(FaultType::HighLatency, "bridge", 1.5);
        let err = injector.inject_fault(config).await.unwrap_err();
        assert!(matches!(err, FaultError::InvalidConfiguration(_)));
        assert_eq!(injector.active_count(), 0);
    }

    #[tokio::test]
    async fn scope_rejects_artifacts_after_removal_claims_the_fault() {
        let (injector, backend) = injector();
        let config = FaultConfiguration::new(FaultType::HighLatency, "bridge", 0.1);
        let fault_id = injector.inner.registry.lock().insert(&config);
        backend
            .create_proxy(&crate::proxy::Proxy::new("late", "127.0.0.1:0", "127.0.0.1:1"))
            .await
            .unwrap();
        injector
            .inner
            .registry
            .lock()
            .get_mut(fault_id)
            .unwrap()
            .removing = true;

        let scope = InjectionScope {
            injector: &injector,
            fault_id,
        };
        scope
            .record_artifact(FaultArtifact::new(
                ArtifactType::Proxy,
                "late",
                serde_json::Value::Null,
                true,
            ))
            .await;
        assert!(backend.proxy("late").is_none());
        assert!(injector
            .inner
            .registry
            .lock()
            .get(fault_id)
            .unwrap()
            .result
            .artifacts
            .is_empty());
    }

    #[tokio::test]
    async fn removal_runs_only_the_owners_cleanup_tasks() {
        let (injector, _) = injector();
        let config = FaultConfiguration::new(FaultType::ResourceExhaustion, "host", 0.0);
        let (first, second) = {
            let mut registry = injector.inner.registry.lock();
            (registry.insert(&config), registry.insert(&config))
        };
        let ran = Arc::new(Mutex::new(Vec::new()));
        for (fault_id, label) in [(first, "first"), (second, "second")] {
            let ran = ran.clone();
            InjectionScope {
                injector: &injector,
                fault_id,
            }
            .register_cleanup("test", move || ran.lock().push(label))
            .await;
        }

        assert!(injector.remove_fault(first).await);
        assert_eq!(*ran.lock(), vec!["first"]);
        assert_eq!(injector.pending_cleanup_tasks(), 1);
        assert!(!injector.remove_fault(first).await);

        let report = injector.cleanup().await;
        assert_eq!(report.removed, 1);
        assert_eq!(*ran.lock(), vec!["first", "second"]);
    }
}
