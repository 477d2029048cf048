//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Outbound request interception used by emulated upstream faults."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Outbound calls that should be subject to emulated faults go through
//! [`Interceptor::invoke`]. Installed hooks form a LIFO stack: the most
//! recently installed hook sees the call first, and each installation is
//! undone by exactly one [`Interceptor::restore`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

static GLOBAL: Lazy<Arc<Interceptor>> = Lazy::new(|| Arc::new(Interceptor::new()));

/// Failure surfaced to callers of an intercepted outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterceptError {
    /// An injected fault replaced the call with an exception.
    #[error("injected failure calling {target}: {message}")]
    Injected {
        target: String,
        message: String,
    },
    /// An injected fault stalled the call and then failed it.
    #[error("call to {target} timed out after {elapsed_ms} ms")]
    TimedOut {
        target: String,
        elapsed_ms: u64,
    },
    /// The real outbound call failed.
    #[error("upstream call failed: {0}")]
    Upstream(String),
}

/// One wrapper around the outbound call path.
#[async_trait]
pub trait RequestHook: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before the call is delegated inward; an error short-circuits the call.
    async fn before_call(&self, target: &str) -> Result<(), InterceptError>;

    /// Runs on the response payload on its way back out.
    fn after_call(&self, _target: &str, _payload: &mut Vec<u8>) {}
}

/// Receipt for one installation; consumed by [`Interceptor::restore`].
#[derive(Debug, PartialEq, Eq)]
pub struct HookHandle {
    id: u64,
}

impl HookHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Installed {
    id: u64,
    hook: Arc<dyn RequestHook>,
}

/// Stack of installed request hooks wrapping the outbound call path.
pub struct Interceptor {
    stack: Mutex<Vec<Installed>>,
    next_id: AtomicU64,
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor {
    pub fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Process-wide hook point shared by every injector that does not supply its own.
    pub fn global() -> Arc<Interceptor> {
        GLOBAL.clone()
    }

    /// Wrap the current chain with `hook`.
    pub fn install(&self, hook: Arc<dyn RequestHook>) -> HookHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut stack = self.stack.lock();
        debug!(hook = hook.name(), depth = stack.len() + 1, "request hook installed");
        stack.push(Installed { id, hook });
        HookHandle { id }
    }

    /// Undo one installation. Returns false if it was not installed.
    pub fn restore(&self, handle: HookHandle) -> bool {
        let mut stack = self.stack.lock();
        let Some(position) = stack.iter().position(|installed| installed.id == handle.id) else {
            return false;
        };
        if position + 1 != stack.len() {
            warn!(
                hook = stack[position].hook.name(),
                depth = stack.len(),
                "restoring request hook out of LIFO order"
            );
        }
        let removed = stack.remove(position);
        debug!(hook = removed.hook.name(), depth = stack.len(), "request hook restored");
        true
    }

    /// Number of installed wrappers.
    pub fn depth(&self) -> usize {
        self.stack.lock().len()
    }

    /// Names of installed hooks, outermost first.
    pub fn installed(&self) -> Vec<String> {
        self.stack
            .lock()
            .iter()
            .rev()
            .map(|installed| installed.hook.name().to_owned())
            .collect()
    }

    /// Run `call` through every installed hook.
    pub async fn invoke<F, Fut>(&self, target: &str, call: F) -> Result<Vec<u8>, InterceptError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, InterceptError>>,
    {
        let chain: Vec<Arc<dyn RequestHook>> = self
            .stack
            .lock()
            .iter()
            .rev()
            .map(|installed| installed.hook.clone())
            .collect();

        for hook in &chain {
            hook.before_call(target).await?;
        }
        let mut payload = call().await?;
        for hook in chain.iter().rev() {
            hook.after_call(target, &mut payload);
        }
        Ok(payload)
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("installed", &self.installed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag {
        name: &'static str,
        fail: bool,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl RequestHook for Tag {
        fn name(&self) -> &str {
            self.name
        }

        async fn before_call(&self, target: &str) -> Result<(), InterceptError> {
            self.seen.lock().push(self.name);
            if self.fail {
                return Err(InterceptError::Injected {
                    target: target.to_owned(),
                    message: self.name.to_owned(),
                });
            }
            Ok(())
        }

        fn after_call(&self, _target: &str, payload: &mut Vec<u8>) {
            payload.extend_from_slice(self.name.as_bytes());
        }
    }

    fn tag(name: &'static str, fail: bool, seen: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Tag> {
        Arc::new(Tag {
            name,
            fail,
            seen: seen.clone(),
        })
    }

    #[tokio::test]
    async fn hooks_wrap_in_lifo_order() {
        let interceptor = Interceptor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _inner = interceptor.install(tag("a", false, &seen));
        let _outer = interceptor.install(tag("b", false, &seen));

        let payload = interceptor
            .invoke("svc", || async { Ok(b"x".to_vec()) })
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["b", "a"]);
        assert_eq!(payload, b"xab".to_vec());
        assert_eq!(interceptor.installed(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn failing_hook_short_circuits_inner_chain() {
        let interceptor = Interceptor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        interceptor.install(tag("inner", false, &seen));
        interceptor.install(tag("outer", true, &seen));

        let err = interceptor
            .invoke("svc", || async { Ok(Vec::new()) })
            .await
            .unwrap_err();
        assert!(matches!(err, InterceptError::Injected { .. }));
        assert_eq!(*seen.lock(), vec!["outer"]);
    }

    #[tokio::test]
    async fn restore_removes_exactly_one_installation() {
        let interceptor = Interceptor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = interceptor.install(tag("a", false, &seen));
        let second = interceptor.install(tag("b", false, &seen));
        let stale = HookHandle { id: second.id };

        assert!(interceptor.restore(second));
        assert!(!interceptor.restore(stale));
        assert_eq!(interceptor.depth(), 1);
        assert!(interceptor.restore(first));
        assert_eq!(interceptor.depth(), 0);

        let payload = interceptor
            .invoke("svc", || async { Ok(b"raw".to_vec()) })
            .await
            .unwrap();
        assert_eq!(payload, b"raw".to_vec());
    }
}
