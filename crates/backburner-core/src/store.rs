//! Task store contract.
//!
//! Both backends (memory and persistent) implement [`TaskStore`]; the
//! trait is the seam that lets callers chain stores without knowing which
//! one owns a TID.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::error::{Result, TaskError};
use crate::hook::{HookRef, HookRegistry, Params};
use crate::record::{TaskRecord, call_target};

#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Mark the store as running. The persistent store additionally
    /// performs crash recovery here.
    async fn start(&self) -> Result<()>;

    /// Best-effort stop: no new insertions or dispatches; in-flight work
    /// is not awaited.
    fn stop(&self);

    fn is_started(&self) -> bool;

    /// Schedule a one-shot task due at now + `timeout` (default: the
    /// configured task timeout).
    async fn add(
        &self,
        tid: &str,
        hook: HookRef,
        timeout: Option<Duration>,
        params: Params,
    ) -> Result<()>;

    /// Like `add`, but the timeout is stored with the record so the task
    /// can later be re-armed instead of only fired once.
    async fn register_timeout(
        &self,
        tid: &str,
        hook: HookRef,
        timeout: Option<Duration>,
        params: Params,
    ) -> Result<()>;

    /// Push the task's expiry using its stored timeout ("touch").
    /// Returns false for an unknown TID.
    async fn reregister_timeout(&self, tid: &str) -> Result<bool>;

    /// Idempotent cancellation; true if a record was actually removed.
    async fn remove(&self, tid: &str) -> Result<bool>;

    /// Alias of `remove` kept for the timeout-registration surface.
    async fn unregister_timeout(&self, tid: &str) -> Result<bool> {
        self.remove(tid).await
    }

    /// Lookup without side effects.
    async fn get(&self, tid: &str) -> Result<Option<TaskRecord>>;

    /// Existence check, optionally constrained to a specific hook.
    async fn is_registered(&self, tid: &str, hook: Option<&HookRef>) -> Result<bool>;

    /// Chain-of-responsibility entry point: a task only executes when
    /// `last_return` is still `None`.
    async fn call(&self, params: &Params, last_return: Option<Value>) -> Result<Option<Value>> {
        call_chain(self, params, last_return).await
    }

    /// Execute one record synchronously. The persistent store overrides
    /// this to wrap execution in a status-transition guard.
    async fn run_task(&self, record: &TaskRecord) -> Result<Value> {
        run_record(self.registry(), record).await
    }

    /// Pop/claim due work and dispatch it. Driven by the scheduler when
    /// `next_due` is reached.
    async fn run(self: Arc<Self>) -> Result<()>;

    /// The next wake-up the scheduler should arm; `None` when idle.
    fn next_due(&self) -> Result<Option<DateTime<Utc>>>;

    fn registry(&self) -> &Arc<HookRegistry>;

    fn clock(&self) -> &Arc<dyn Clock>;

    /// Notified whenever the next wake-up may have moved earlier.
    fn wakeups(&self) -> watch::Receiver<()>;
}

/// Shared `call` logic: pass through a non-`None` chain result, resolve
/// the TID, validate the client tag, re-arm re-armable records, then run
/// synchronously. Unknown TIDs and tag mismatches fall through as `None`
/// so the next store in the chain can be probed.
pub(crate) async fn call_chain<S>(
    store: &S,
    params: &Params,
    last_return: Option<Value>,
) -> Result<Option<Value>>
where
    S: TaskStore + ?Sized,
{
    if last_return.is_some() {
        return Ok(last_return);
    }

    let Some(tid) = call_target(params) else {
        return Ok(None);
    };
    let Some(record) = store.get(tid).await? else {
        return Ok(None);
    };
    if !record.client_matches(params) {
        return Ok(None);
    }

    if record.rearm_timeout.is_some() {
        store.reregister_timeout(tid).await?;
    }

    store.run_task(&record).await.map(Some)
}

/// Execute one record: callable hooks through their own `run`, named
/// hooks through the registry. An empty hook name marks a malformed
/// record and fails fast.
pub(crate) async fn run_record(registry: &HookRegistry, record: &TaskRecord) -> Result<Value> {
    match &record.hook {
        HookRef::Callable(hook) => hook.run(&record.tid, record.params.clone()).await,
        HookRef::Named(name) if name.is_empty() => Err(TaskError::UnsupportedTask),
        HookRef::Named(name) => {
            registry
                .call_one(name, &record.tid, record.params.clone())
                .await
        }
    }
}
