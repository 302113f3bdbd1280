//! Durable task store backed by SQLite.
//!
//! Rows survive restarts; `start` recovers work a dead process left
//! claimed. Claiming (WAITING -> QUEUED) happens under a lock so
//! concurrent `run` calls never dispatch the same row; the dispatch
//! itself happens after the lock is released.

mod context;
mod entity;

pub use context::TaskExecutionContext;
pub use entity::{TaskDb, TaskEntity, TaskStatus, hash_tid};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, TaskError};
use crate::hook::{HookRef, HookRegistry, LRT_HOOK_KEY, Params, TIMEOUT_KEY};
use crate::lrt::{LrtLimiter, PersistentLrtHook};
use crate::record::{TaskRecord, call_target};
use crate::scheduler::Dispatcher;
use crate::store::{TaskStore, call_chain, run_record};

pub struct PersistentTaskStore {
    db: Arc<TaskDb>,
    config: Config,
    clock: Arc<dyn Clock>,
    registry: Arc<HookRegistry>,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<LrtLimiter>,
    claim_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    rearm_tx: watch::Sender<()>,
}

impl PersistentTaskStore {
    pub fn new(
        db: Arc<TaskDb>,
        config: Config,
        clock: Arc<dyn Clock>,
        registry: Arc<HookRegistry>,
        dispatcher: Arc<Dispatcher>,
        limiter: Arc<LrtLimiter>,
    ) -> Arc<Self> {
        let (rearm_tx, _) = watch::channel(());
        Arc::new(Self {
            db,
            config,
            clock,
            registry,
            dispatcher,
            limiter,
            claim_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            rearm_tx,
        })
    }

    pub fn db(&self) -> &Arc<TaskDb> {
        &self.db
    }

    /// Flatten a hook reference into its durable form: a hook name plus
    /// extra params. Callable hooks must declare a persistent form; the
    /// LRT marker is set so `get` can rebuild the wrapper.
    fn flatten_hook(&self, hook: HookRef, params: &mut Params) -> Result<String> {
        match hook {
            HookRef::Named(name) => Ok(name),
            HookRef::Callable(hook) => {
                let spec = hook.persistent_spec().ok_or(TaskError::UnsupportedTask)?;
                for (key, value) in spec.params {
                    params.entry(key).or_insert(value);
                }
                params.insert(LRT_HOOK_KEY.to_string(), json!(true));
                Ok(spec.hook)
            }
        }
    }

    /// Upsert the row for `tid`, reusing the existing row id when the
    /// task is already known.
    fn upsert(
        &self,
        tid: &str,
        hook: HookRef,
        mut params: Params,
        time_scheduled: Option<i64>,
        timeout: Option<i64>,
    ) -> Result<()> {
        if !self.is_started() {
            tracing::debug!(%tid, "store stopped, insertion skipped");
            return Ok(());
        }

        let hook_name = self.flatten_hook(hook, &mut params)?;
        let mut entity = match self.db.load_tid(tid)? {
            Some(existing) => existing,
            None => TaskEntity::new(tid, hook_name.clone(), params.clone()),
        };
        entity.hook = hook_name;
        entity.params = params;
        entity.status = TaskStatus::Waiting;
        entity.time_scheduled = time_scheduled.unwrap_or(0);
        entity.timeout = timeout.unwrap_or(0);
        self.db.save(&mut entity)?;

        if time_scheduled.is_some() {
            // the next wake-up may have moved earlier
            self.rearm_tx.send_replace(());
        }
        Ok(())
    }

    /// Rebuild the runtime record for a row. Rows flagged as LRT come
    /// back wrapped so dispatch goes through the limiter again.
    fn record_from_entity(&self, entity: &TaskEntity) -> TaskRecord {
        let hook = if entity.is_lrt() {
            HookRef::Callable(PersistentLrtHook::new(
                Arc::clone(&self.limiter),
                Arc::clone(&self.db),
                Arc::clone(&self.registry),
                entity.hook.clone(),
                entity.params.clone(),
            ))
        } else {
            HookRef::named(entity.hook.clone())
        };

        let due_secs = if entity.time_scheduled > 0 {
            entity.time_scheduled
        } else {
            entity.timeout
        };
        let due_at = DateTime::from_timestamp(due_secs, 0).unwrap_or_default();

        let mut record = TaskRecord::new(entity.tid.clone(), hook, entity.params.clone(), due_at);
        if let Some(secs) = entity.rearm_timeout_secs() {
            record = record.with_rearm_timeout(Duration::from_secs(secs));
        }
        record
    }

    fn hook_name(hook: &HookRef) -> Option<String> {
        match hook {
            HookRef::Named(name) => Some(name.clone()),
            HookRef::Callable(hook) => hook.persistent_spec().map(|spec| spec.hook),
        }
    }
}

#[async_trait]
impl TaskStore for PersistentTaskStore {
    async fn start(&self) -> Result<()> {
        let recovered = self.db.reset_stale_running()?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered tasks left claimed by a previous run");
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn add(
        &self,
        tid: &str,
        hook: HookRef,
        timeout: Option<Duration>,
        params: Params,
    ) -> Result<()> {
        let timeout = timeout.unwrap_or(self.config.task_timeout);
        tracing::debug!(%tid, %hook, ?timeout, "adding task");

        let due = self.db.now_secs() + timeout.as_secs() as i64;
        self.upsert(tid, hook, params, Some(due), None)
    }

    /// Timeout registrations are expiry watches, not scheduled work: the
    /// row carries a deadline but no schedule, so `run` never claims it.
    /// Once the deadline passes the row reads as absent.
    async fn register_timeout(
        &self,
        tid: &str,
        hook: HookRef,
        timeout: Option<Duration>,
        mut params: Params,
    ) -> Result<()> {
        let secs = timeout.unwrap_or(self.config.task_timeout).as_secs();
        tracing::debug!(%tid, %hook, secs, "registering timeout task");

        params.insert(TIMEOUT_KEY.to_string(), json!(secs));
        let deadline = self.db.now_secs() + secs as i64;
        self.upsert(tid, hook, params, None, Some(deadline))
    }

    async fn reregister_timeout(&self, tid: &str) -> Result<bool> {
        let Some(mut entity) = self.db.load_tid(tid)? else {
            return Ok(false);
        };
        let Some(secs) = entity.rearm_timeout_secs() else {
            return Ok(false);
        };

        entity.timeout = self.db.now_secs() + secs as i64;
        self.db.save(&mut entity)?;
        Ok(true)
    }

    async fn remove(&self, tid: &str) -> Result<bool> {
        let removed = self.db.delete_tid(tid)?;
        if removed {
            tracing::debug!(%tid, "removed task");
        }
        Ok(removed)
    }

    async fn get(&self, tid: &str) -> Result<Option<TaskRecord>> {
        Ok(self
            .db
            .load_tid(tid)?
            .map(|entity| self.record_from_entity(&entity)))
    }

    async fn is_registered(&self, tid: &str, hook: Option<&HookRef>) -> Result<bool> {
        let Some(record) = self.get(tid).await? else {
            return Ok(false);
        };
        Ok(hook.is_none_or(|hook| {
            match (Self::hook_name(hook), Self::hook_name(&record.hook)) {
                (Some(a), Some(b)) => a == b,
                _ => hook.matches(&record.hook),
            }
        }))
    }

    /// A durable task only answers `call` while WAITING; claimed, running
    /// and settled rows fall through so another store may own the TID.
    async fn call(&self, params: &Params, last_return: Option<Value>) -> Result<Option<Value>> {
        if last_return.is_some() {
            return Ok(last_return);
        }
        let Some(tid) = call_target(params) else {
            return Ok(None);
        };
        let Some(entity) = self.db.load_tid(tid)? else {
            return Ok(None);
        };
        if entity.status != TaskStatus::Waiting {
            return Ok(None);
        }
        call_chain(self, params, None).await
    }

    /// Named hooks execute under the status-transition guard; callable
    /// (LRT) hooks wrap their own execution.
    async fn run_task(&self, record: &TaskRecord) -> Result<Value> {
        match &record.hook {
            HookRef::Callable(_) => run_record(&self.registry, record).await,
            HookRef::Named(_) => match self.db.load_tid(&record.tid)? {
                Some(entity) => {
                    let registry = Arc::clone(&self.registry);
                    TaskExecutionContext::new(&self.db, entity)
                        .execute(|| async move { run_record(&registry, record).await })
                        .await
                }
                None => run_record(&self.registry, record).await,
            },
        }
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        if !self.is_started() {
            return Ok(());
        }

        let claimed = {
            let _claim = self.claim_lock.lock().await;
            match self.db.load_next(TaskStatus::Waiting)? {
                Some(mut entity) if entity.time_scheduled <= self.db.now_secs() => {
                    if entity.transition_to(TaskStatus::Queued) {
                        self.db.save(&mut entity)?;
                        Some(entity)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        let Some(entity) = claimed else {
            return Ok(());
        };
        let record = self.record_from_entity(&entity);
        tracing::debug!(tid = %record.tid, hook = %record.hook, "claimed task");

        // dispatch outside the claim lock
        match record.hook.clone() {
            HookRef::Callable(hook) => {
                let store = Arc::clone(&self) as Arc<dyn TaskStore>;
                hook.start(store, record.tid, record.params).await?;
            }
            HookRef::Named(_) => {
                let store = Arc::clone(&self);
                self.dispatcher
                    .submit(async move {
                        let tid = record.tid.clone();
                        if let Err(err) = store.run_task(&record).await {
                            tracing::error!(%tid, %err, "task execution failed");
                        }
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .db
            .load_next(TaskStatus::Waiting)?
            .map(|entity| DateTime::from_timestamp(entity.time_scheduled, 0).unwrap_or_default()))
    }

    fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn wakeups(&self) -> watch::Receiver<()> {
        self.rearm_tx.subscribe()
    }
}
