//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Cascade step timing, cancellation, and bookkeeping release."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use faultline_injector::{
    ArtifactType, CascadeStepState, FaultConfiguration, FaultError, FaultEvent, FaultInjector,
    FaultType, InMemoryProxyBackend, Interceptor, ProxyBackend,
};
use serde_json::{json, Value};
use tokio::time::sleep;

fn injector(backend: &Arc<InMemoryProxyBackend>) -> FaultInjector {
    FaultInjector::builder()
        .proxy_backend(backend.clone())
        .interceptor(Arc::new(Interceptor::new()))
        .build()
}

fn cascade(sequence: Value) -> FaultConfiguration {
    FaultConfiguration::new(FaultType::CascadingFailure, "checkout", 0.5)
        .with_param("port", 8080)
        .with_param("failureSequence", sequence)
}

#[tokio::test(start_paused = true)]
async fn parent_succeeds_before_any_step_fires() {
    let backend = Arc::new(InMemoryProxyBackend::new());
    let injector = injector(&backend);
    let mut events = injector.subscribe();

    let parent = injector
        .inject_fault(cascade(json!([
            {"type": "high_latency", "delay": 100},
            {"type": "bandwidth_limit", "delay": 500, "intensity": 1.0},
        ])))
        .await
        .unwrap();
    assert!(parent.success);
    assert_eq!(parent.metric("cascade_steps_scheduled"), Some(2.0));
    assert_eq!(parent.artifacts.len(), 2);
    assert!(parent
        .artifacts
        .iter()
        .all(|artifact| artifact.artifact_type == ArtifactType::CascadeStep
            && !artifact.cleanup_required));
    assert!(injector.cascade_children(parent.fault_id).is_empty());
    assert_eq!(injector.active_count(), 1);

    sleep(Duration::from_millis(150)).await;
    let children = injector.cascade_children(parent.fault_id);
    assert_eq!(children.len(), 1);
    let first = injector.fault(children[0]).unwrap();
    assert_eq!(first.target, "checkout-cascade-0");
    assert_eq!(first.fault_type, FaultType::HighLatency);
    assert_eq!(first.intensity, 0.5);

    sleep(Duration::from_millis(500)).await;
    let children = injector.cascade_children(parent.fault_id);
    assert_eq!(children.len(), 2);
    let second = injector.fault(children[1]).unwrap();
    assert_eq!(second.target, "checkout-cascade-1");
    assert_eq!(second.metric("bandwidth_rate_kbps"), Some(0.0));
    assert_eq!(injector.active_count(), 3);

    let mut injected = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FaultEvent::Injected { result, .. } = event {
            injected.push(result.target);
        }
    }
    assert_eq!(
        injected,
        vec!["checkout", "checkout-cascade-0", "checkout-cascade-1"]
    );
}

#[tokio::test(start_paused = true)]
async fn removing_the_parent_leaves_steps_scheduled() {
    let backend = Arc::new(InMemoryProxyBackend::new());
    let injector = injector(&backend);
    let mut events = injector.subscribe();
    let parent = injector
        .inject_fault(cascade(json!([{"type": "high_latency", "delay": 50}])))
        .await
        .unwrap();
    assert!(injector.remove_fault(parent.fault_id).await);
    assert_eq!(injector.cascade_status(parent.fault_id).len(), 1);

    sleep(Duration::from_millis(100)).await;
    let mut children = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FaultEvent::Injected { fault_id, result, .. } = event {
            if result.target == "checkout-cascade-0" {
                children.push(fault_id);
            }
        }
    }
    assert_eq!(children.len(), 1);
    assert!(injector.fault(children[0]).is_some());
    // Parent gone and every step settled: nothing is kept for it.
    assert!(injector.cascade_status(parent.fault_id).is_empty());

    assert!(injector.remove_fault(children[0]).await);
    assert!(backend.list_proxies().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn removed_parent_with_settled_steps_is_forgotten() {
    let backend = Arc::new(InMemoryProxyBackend::new());
    let injector = injector(&backend);
    let parent = injector
        .inject_fault(cascade(json!([
            {"type": "service_crash", "delay": 10},
            {"type": "high_latency", "delay": 5000},
        ])))
        .await
        .unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(injector.cascade_status(parent.fault_id).len(), 2);
    assert!(injector.remove_fault(parent.fault_id).await);
    // The second step is still pending, so its handle stays cancellable.
    assert_eq!(injector.cascade_status(parent.fault_id).len(), 2);

    assert_eq!(injector.cancel_cascade(parent.fault_id), 1);
    assert!(injector.cascade_status(parent.fault_id).is_empty());
    assert_eq!(injector.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_only_unfired_steps() {
    let backend = Arc::new(InMemoryProxyBackend::new());
    let injector = injector(&backend);
    let parent = injector
        .inject_fault(cascade(json!([
            {"type": "high_latency", "delay": 100},
            {"type": "high_latency", "delay": 1000},
        ])))
        .await
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(injector.cancel_cascade(parent.fault_id), 1);
    assert_eq!(injector.cancel_cascade(parent.fault_id), 0);

    sleep(Duration::from_secs(2)).await;
    let status = injector.cascade_status(parent.fault_id);
    assert!(matches!(status[0].state, CascadeStepState::Injected(_)));
    assert_eq!(status[1].state, CascadeStepState::Cancelled);
    assert_eq!(injector.active_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_step_does_not_affect_siblings() {
    let backend = Arc::new(InMemoryProxyBackend::new());
    let injector = injector(&backend);
    let parent = injector
        .inject_fault(cascade(json!([
            {"type": "service_crash", "delay": 10},
            {"type": "high_latency", "delay": 20},
        ])))
        .await
        .unwrap();
    assert!(parent.success);

    sleep(Duration::from_millis(50)).await;
    let status = injector.cascade_status(parent.fault_id);
    assert_eq!(status[0].state, CascadeStepState::Failed);
    assert!(matches!(status[1].state, CascadeStepState::Injected(_)));
    assert!(injector.fault(parent.fault_id).unwrap().success);
}

#[tokio::test(start_paused = true)]
async fn cleanup_cancels_pending_steps_and_removes_children() {
    let backend = Arc::new(InMemoryProxyBackend::new());
    let injector = injector(&backend);
    let parent = injector
        .inject_fault(cascade(json!([
            {"type": "high_latency", "delay": 10},
            {"type": "bandwidth_limit", "delay": 10_000},
        ])))
        .await
        .unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(injector.active_count(), 2);

    let report = injector.cleanup().await;
    assert_eq!(report.removed, 2);
    assert_eq!(report.cancelled_cascade_steps, 1);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(injector.active_count(), 0);
    assert!(injector.cascade_status(parent.fault_id).is_empty());
    assert!(backend.list_proxies().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_sequences_schedule_nothing() {
    let backend = Arc::new(InMemoryProxyBackend::new());
    let injector = injector(&backend);

    let err = injector
        .inject_fault(cascade(json!({"type": "high_latency"})))
        .await
        .unwrap_err();
    assert!(matches!(err, FaultError::InvalidConfiguration(_)));

    let err = injector
        .inject_fault(cascade(json!([
            {"type": "high_latency", "delay": 0},
            {"type": "high_latency", "delay": 0, "intensity": 1.5},
        ])))
        .await
        .unwrap_err();
    assert!(matches!(err, FaultError::InvalidConfiguration(_)));
    assert_eq!(injector.active_count(), 0);
}
