//! Hooks: the unit of work behind a scheduled task.
//!
//! A task's hook is either a name resolved through the [`HookRegistry`]
//! (the plugin dispatch mechanism) or a [`Hook`] object that manages its
//! own execution, such as the LRT wrappers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, TaskError};
use crate::store::TaskStore;

/// Keyword parameters carried by a task.
pub type Params = serde_json::Map<String, Value>;

/// Reserved params key holding the original task ID.
pub const TID_KEY: &str = "_tid";

/// Reserved params key carrying a re-armable task's timeout in seconds.
pub const TIMEOUT_KEY: &str = "_timeout";

/// Reserved params key marking a flattened persistent LRT wrapper.
pub const LRT_HOOK_KEY: &str = "_lrt_hook";

/// Reserved params key for the structured error recorded on failure.
pub const ERROR_KEY: &str = "error";

/// Optional client tag guarding against cross-client TID collisions.
pub const CLIENT_KEY: &str = "client";

/// Flattened form of a persistent LRT wrapper: the underlying hook name
/// plus the wrapper's own parameters. This is what the durable store
/// persists instead of the wrapper object.
#[derive(Debug, Clone)]
pub struct PersistentHookSpec {
    pub hook: String,
    pub params: Params,
}

/// A hook object invoked through its own `run`/`start` methods.
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// Execute the hook synchronously (awaited by the caller).
    async fn run(&self, tid: &str, params: Params) -> Result<Value>;

    /// Start the hook asynchronously. Hooks that manage their own
    /// scheduling (the LRT wrappers) override this; the default detaches
    /// the run and traps its error.
    async fn start(
        self: Arc<Self>,
        store: Arc<dyn TaskStore>,
        tid: String,
        params: Params,
    ) -> Result<()> {
        let _ = store;
        tokio::spawn(async move {
            if let Err(err) = self.run(&tid, params).await {
                tracing::error!(%tid, %err, "detached hook execution failed");
            }
        });
        Ok(())
    }

    /// The flattened persistent form, if this hook survives a round trip
    /// through the durable store. `None` for plain hook objects.
    fn persistent_spec(&self) -> Option<PersistentHookSpec> {
        None
    }
}

/// Reference to the work a task executes.
#[derive(Clone)]
pub enum HookRef {
    /// Dispatched through the registry by name.
    Named(String),

    /// Invoked through its own `run`/`start`.
    Callable(Arc<dyn Hook>),
}

impl HookRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Equality for `is_registered` checks: names compare by value,
    /// callables by identity.
    pub fn matches(&self, other: &HookRef) -> bool {
        match (self, other) {
            (Self::Named(a), Self::Named(b)) => a == b,
            (Self::Callable(a), Self::Callable(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for HookRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => write!(f, "HookRef::Named({name})"),
            Self::Callable(_) => f.write_str("HookRef::Callable(..)"),
        }
    }
}

impl fmt::Display for HookRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Callable(hook) => match hook.persistent_spec() {
                Some(spec) => f.write_str(&spec.hook),
                None => f.write_str("<callable>"),
            },
        }
    }
}

/// Registry of named hooks (name -> handler).
///
/// Built during initialization, used immutably at runtime; this keeps the
/// hot dispatch path lock-free.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
        }
    }

    /// Register a handler under a hook name.
    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> Result<()> {
        let name = name.into();
        if self.hooks.contains_key(&name) {
            return Err(TaskError::DuplicateHook(name));
        }
        self.hooks.insert(name, hook);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Hook>> {
        self.hooks.get(name)
    }

    /// Execute the single handler registered under `name`.
    pub async fn call_one(&self, name: &str, tid: &str, params: Params) -> Result<Value> {
        let hook = self
            .hooks
            .get(name)
            .ok_or_else(|| TaskError::HookNotFound(name.to_string()))?;
        hook.run(tid, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHook;

    #[async_trait]
    impl Hook for EchoHook {
        async fn run(&self, tid: &str, _params: Params) -> Result<Value> {
            Ok(json!(tid))
        }
    }

    #[tokio::test]
    async fn call_one_runs_registered_hook() {
        let mut registry = HookRegistry::new();
        registry.register("echo", Arc::new(EchoHook)).unwrap();

        let value = registry
            .call_one("echo", "job-1", Params::new())
            .await
            .unwrap();
        assert_eq!(value, json!("job-1"));
    }

    #[tokio::test]
    async fn call_one_unknown_name_is_an_error() {
        let registry = HookRegistry::new();
        let err = registry
            .call_one("missing", "job-1", Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::HookNotFound(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HookRegistry::new();
        registry.register("echo", Arc::new(EchoHook)).unwrap();
        let err = registry.register("echo", Arc::new(EchoHook)).unwrap_err();
        assert!(matches!(err, TaskError::DuplicateHook(_)));
    }

    #[test]
    fn hook_ref_matching() {
        let named = HookRef::named("a");
        assert!(named.matches(&HookRef::named("a")));
        assert!(!named.matches(&HookRef::named("b")));

        let hook: Arc<dyn Hook> = Arc::new(EchoHook);
        let callable = HookRef::Callable(Arc::clone(&hook));
        assert!(callable.matches(&HookRef::Callable(hook)));
        assert!(!callable.matches(&HookRef::Callable(Arc::new(EchoHook))));
        assert!(!callable.matches(&named));
    }
}
