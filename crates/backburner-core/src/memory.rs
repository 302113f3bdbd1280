//! In-memory task store.
//!
//! Tasks live in a mutex-guarded list kept sorted ascending by due time.
//! Hooks are dispatched off the scheduler loop; use the LRT wrappers for
//! long running or CPU intensive work.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::clock::{Clock, delta};
use crate::config::Config;
use crate::error::Result;
use crate::hook::{HookRef, HookRegistry, Params};
use crate::record::TaskRecord;
use crate::scheduler::Dispatcher;
use crate::store::{TaskStore, run_record};

pub struct MemoryTaskStore {
    config: Config,
    clock: Arc<dyn Clock>,
    registry: Arc<HookRegistry>,
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<Vec<TaskRecord>>,
    started: AtomicBool,
    rearm_tx: watch::Sender<()>,
}

impl MemoryTaskStore {
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        registry: Arc<HookRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let (rearm_tx, _) = watch::channel(());
        Arc::new(Self {
            config,
            clock,
            registry,
            dispatcher,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            rearm_tx,
        })
    }

    /// Insert keeping the list sorted by due time.
    ///
    /// Split heuristic: tasks above the default timeout are rare and
    /// long-dated, so they scan backward from the tail; the common case
    /// scans forward from the head. Linear on purpose; queues here are
    /// expected to stay small.
    fn insert_record(&self, record: TaskRecord, timeout: Duration) {
        if !self.is_started() {
            tracing::debug!(tid = %record.tid, "store stopped, insertion skipped");
            return;
        }

        let index = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let index = if timeout > self.config.task_timeout {
                let mut index = 0;
                for position in (0..tasks.len()).rev() {
                    if record.due_at > tasks[position].due_at {
                        index = position + 1;
                        break;
                    }
                }
                index
            } else {
                let mut index = tasks.len();
                for (position, task) in tasks.iter().enumerate() {
                    if record.due_at < task.due_at {
                        index = position;
                        break;
                    }
                }
                index
            };
            tasks.insert(index, record);
            index
        };

        if index == 0 {
            // the new head moved the next wake-up earlier
            self.rearm_tx.send_replace(());
        }
    }

    /// Remove the last record matching `tid`.
    fn delete(&self, tid: &str) -> bool {
        let (removed, was_head) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            match tasks.iter().rposition(|task| task.tid == tid) {
                Some(position) => {
                    tasks.remove(position);
                    (true, position == 0)
                }
                None => (false, false),
            }
        };

        if was_head {
            self.rearm_tx.send_replace(());
        }
        removed
    }

    fn due_at(&self, timeout: Duration) -> DateTime<Utc> {
        self.clock.now() + delta(timeout)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn start(&self) -> Result<()> {
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

        let record = TaskRecord::new(tid, hook, params, self.due_at(timeout));
        self.insert_record(record, timeout);
        Ok(())
    }

    async fn register_timeout(
        &self,
        tid: &str,
        hook: HookRef,
        timeout: Option<Duration>,
        params: Params,
    ) -> Result<()> {
        let timeout = timeout.unwrap_or(self.config.task_timeout);
        tracing::debug!(%tid, %hook, "registering timeout task");

        let record =
            TaskRecord::new(tid, hook, params, self.due_at(timeout)).with_rearm_timeout(timeout);
        self.insert_record(record, timeout);
        Ok(())
    }

    async fn reregister_timeout(&self, tid: &str) -> Result<bool> {
        let Some(record) = self.get(tid).await? else {
            return Ok(false);
        };
        let Some(timeout) = record.rearm_timeout else {
            return Ok(false);
        };

        self.delete(tid);
        self.register_timeout(tid, record.hook, Some(timeout), record.params)
            .await?;
        Ok(true)
    }

    async fn remove(&self, tid: &str) -> Result<bool> {
        let removed = self.delete(tid);
        if removed {
            tracing::debug!(%tid, "removed task");
        }
        Ok(removed)
    }

    async fn get(&self, tid: &str) -> Result<Option<TaskRecord>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.iter().find(|task| task.tid == tid).cloned())
    }

    async fn is_registered(&self, tid: &str, hook: Option<&HookRef>) -> Result<bool> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.iter().any(|task| {
            task.tid == tid && hook.is_none_or(|hook| hook.matches(&task.hook))
        }))
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        if !self.is_started() {
            return Ok(());
        }

        let due = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if tasks
                .first()
                .is_some_and(|task| task.due_at <= self.clock.now())
            {
                Some(tasks.remove(0))
            } else {
                None
            }
        };

        let Some(record) = due else {
            return Ok(());
        };

        if record.rearm_timeout.is_some() {
            // expiry record: it was never touched in time
            tracing::debug!(tid = %record.tid, "task timed out");
            return Ok(());
        }

        match record.hook.clone() {
            HookRef::Callable(hook) => {
                let store: Arc<dyn TaskStore> = Arc::clone(&self) as Arc<dyn TaskStore>;
                hook.start(store, record.tid, record.params).await?;
            }
            HookRef::Named(_) => {
                let registry = Arc::clone(&self.registry);
                self.dispatcher
                    .submit(async move {
                        let tid = record.tid.clone();
                        if let Err(err) = run_record(&registry, &record).await {
                            tracing::error!(%tid, %err, "task execution failed");
                        }
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.first().map(|task| task.due_at))
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
