//! Long-running-task (LRT) admission control.
//!
//! The [`LrtLimiter`] caps how many LRT contexts run at once. Work
//! arriving for an already-active context joins that context's FIFO
//! queue; work that would open a context beyond the cap is pushed back
//! into a task store with a backoff that grows with the total backlog.
//!
//! Two hook flavors feed the limiter: [`LrtHook`] wraps arbitrary
//! in-process work, [`PersistentLrtHook`] executes a durable task row
//! under its status-transition guard and survives a round trip through
//! the persistent store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::error::Result;
use crate::hook::{Hook, HookRef, HookRegistry, Params, PersistentHookSpec, TID_KEY};
use crate::persistent::{TaskDb, TaskExecutionContext};
use crate::store::TaskStore;

/// The actual work an LRT performs once admitted.
#[async_trait]
pub trait LrtWork: Send + Sync + 'static {
    async fn execute(&self, tid: &str, params: &Params) -> Result<Value>;
}

struct QueuedWork {
    work: Arc<dyn LrtWork>,
    tid: String,
    params: Params,
}

/// One unit of work submitted to the limiter.
pub struct LrtSubmission {
    /// Serialization domain: work sharing a context runs one at a time.
    pub context_id: String,

    /// Independently scheduled work (each unit is its own store record)
    /// is never queued behind an active context; it is always deferred
    /// back to the store instead, so the store remains the only queue.
    pub independent_scheduling: bool,

    pub work: Arc<dyn LrtWork>,
    pub tid: String,
    pub params: Params,
}

/// Caps concurrent LRT contexts and drains each context FIFO.
pub struct LrtLimiter {
    context_limit: usize,
    min_retry_delay: Duration,
    max_retry_delay: Duration,
    queues: Mutex<HashMap<String, VecDeque<QueuedWork>>>,
}

impl LrtLimiter {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            context_limit: config.lrt_context_limit.max(1),
            min_retry_delay: config.lrt_min_retry_delay,
            max_retry_delay: config.lrt_max_retry_delay,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Admit, queue, or defer one unit of work.
    ///
    /// Admission opens a new context and spawns its drain worker. Work
    /// for an active context is queued (unless independently scheduled).
    /// Everything else goes back into `store` with [`Self::retry_delay`].
    pub async fn submit(
        self: &Arc<Self>,
        store: Arc<dyn TaskStore>,
        hook: Arc<dyn Hook>,
        submission: LrtSubmission,
    ) -> Result<()> {
        let LrtSubmission {
            context_id,
            independent_scheduling,
            work,
            tid,
            params,
        } = submission;

        enum Outcome {
            Opened,
            Queued,
            Deferred,
        }

        let outcome = {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(queue) = queues.get_mut(&context_id) {
                if independent_scheduling {
                    Outcome::Deferred
                } else {
                    queue.push_back(QueuedWork {
                        work: Arc::clone(&work),
                        tid: tid.clone(),
                        params: params.clone(),
                    });
                    Outcome::Queued
                }
            } else if queues.len() < self.context_limit {
                queues.insert(
                    context_id.clone(),
                    VecDeque::from([QueuedWork {
                        work: Arc::clone(&work),
                        tid: tid.clone(),
                        params: params.clone(),
                    }]),
                );
                Outcome::Opened
            } else {
                Outcome::Deferred
            }
        };

        match outcome {
            Outcome::Opened => {
                tracing::debug!(context = %context_id, %tid, "opened lrt context");
                let limiter = Arc::clone(self);
                tokio::spawn(limiter.drain(context_id));
                Ok(())
            }
            Outcome::Queued => {
                tracing::debug!(context = %context_id, %tid, "queued into active lrt context");
                Ok(())
            }
            Outcome::Deferred => {
                let delay = self.retry_delay();
                tracing::debug!(
                    context = %context_id,
                    %tid,
                    delay_secs = delay.as_secs(),
                    "lrt contexts saturated, deferring"
                );
                store
                    .add(&tid, HookRef::Callable(hook), Some(delay), params)
                    .await
            }
        }
    }

    /// Backoff for deferred work: the minimum delay scaled by the total
    /// backlog relative to the context limit, clamped to the configured
    /// bounds.
    pub fn retry_delay(&self) -> Duration {
        let backlog: usize = {
            let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            queues.values().map(VecDeque::len).sum()
        };
        let scaled = self.min_retry_delay.as_secs_f64() * (1 + backlog) as f64
            / self.context_limit as f64;
        Duration::from_secs_f64(scaled).clamp(self.min_retry_delay, self.max_retry_delay)
    }

    async fn drain(self: Arc<Self>, context_id: String) {
        while let Some(entry) = self.pop_or_close(&context_id) {
            if let Err(err) = entry.work.execute(&entry.tid, &entry.params).await {
                tracing::error!(context = %context_id, tid = %entry.tid, %err, "lrt work failed");
            }
        }
    }

    /// Pop the context's next unit; closes the context when its queue is
    /// empty so a fresh submission can re-open it.
    fn pop_or_close(&self, context_id: &str) -> Option<QueuedWork> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.get_mut(context_id)?;
        match queue.pop_front() {
            Some(entry) => Some(entry),
            None => {
                queues.remove(context_id);
                tracing::debug!(context = %context_id, "closed lrt context");
                None
            }
        }
    }

    #[cfg(test)]
    fn active_contexts(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

/// Plain LRT wrapper: in-process work funneled through the limiter under
/// a caller-chosen context.
pub struct LrtHook {
    limiter: Arc<LrtLimiter>,
    context_id: String,
    work: Arc<dyn LrtWork>,
}

impl LrtHook {
    pub fn new(
        limiter: Arc<LrtLimiter>,
        context_id: impl Into<String>,
        work: Arc<dyn LrtWork>,
    ) -> Arc<Self> {
        Arc::new(Self {
            limiter,
            context_id: context_id.into(),
            work,
        })
    }
}

#[async_trait]
impl Hook for LrtHook {
    async fn run(&self, tid: &str, params: Params) -> Result<Value> {
        self.work.execute(tid, &params).await
    }

    async fn start(
        self: Arc<Self>,
        store: Arc<dyn TaskStore>,
        tid: String,
        params: Params,
    ) -> Result<()> {
        let limiter = Arc::clone(&self.limiter);
        let submission = LrtSubmission {
            context_id: self.context_id.clone(),
            independent_scheduling: false,
            work: Arc::clone(&self.work),
            tid,
            params,
        };
        limiter.submit(store, self, submission).await
    }
}

/// LRT wrapper for a durable task row.
///
/// The wrapper flattens into the underlying hook name plus its own
/// parameters when persisted, and is rebuilt from the row's LRT marker
/// when loaded back. Execution re-loads the row and runs it under the
/// status-transition guard; deferral goes back through the persistent
/// store as an ordinary record, which is why each unit is independently
/// scheduled.
pub struct PersistentLrtHook {
    limiter: Arc<LrtLimiter>,
    db: Arc<TaskDb>,
    registry: Arc<HookRegistry>,
    hook: String,
    params: Params,
}

impl PersistentLrtHook {
    pub fn new(
        limiter: Arc<LrtLimiter>,
        db: Arc<TaskDb>,
        registry: Arc<HookRegistry>,
        hook: impl Into<String>,
        params: Params,
    ) -> Arc<Self> {
        Arc::new(Self {
            limiter,
            db,
            registry,
            hook: hook.into(),
            params,
        })
    }
}

#[async_trait]
impl Hook for PersistentLrtHook {
    async fn run(&self, tid: &str, params: Params) -> Result<Value> {
        self.execute(tid, &params).await
    }

    async fn start(
        self: Arc<Self>,
        store: Arc<dyn TaskStore>,
        tid: String,
        params: Params,
    ) -> Result<()> {
        let limiter = Arc::clone(&self.limiter);
        let submission = LrtSubmission {
            // one context per underlying hook, so rows for the same hook
            // never run concurrently
            context_id: self.hook.clone(),
            independent_scheduling: true,
            work: Arc::clone(&self) as Arc<dyn LrtWork>,
            tid,
            params,
        };
        limiter.submit(store, self, submission).await
    }

    fn persistent_spec(&self) -> Option<PersistentHookSpec> {
        Some(PersistentHookSpec {
            hook: self.hook.clone(),
            params: self.params.clone(),
        })
    }
}

#[async_trait]
impl LrtWork for PersistentLrtHook {
    async fn execute(&self, tid: &str, params: &Params) -> Result<Value> {
        let row_tid = params
            .get(TID_KEY)
            .and_then(Value::as_str)
            .unwrap_or(tid);

        match self.db.load_tid(row_tid)? {
            Some(entity) => {
                let registry = Arc::clone(&self.registry);
                let hook = self.hook.clone();
                let run_params = params.clone();
                TaskExecutionContext::new(&self.db, entity)
                    .execute(|| async move { registry.call_one(&hook, tid, run_params).await })
                    .await
            }
            None => {
                tracing::warn!(%row_tid, hook = %self.hook, "lrt row vanished, running without guard");
                self.registry.call_one(&self.hook, tid, params.clone()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::MemoryTaskStore;
    use crate::scheduler::Dispatcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    struct BlockingWork {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LrtWork for BlockingWork {
        async fn execute(&self, _tid: &str, _params: &Params) -> Result<Value> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(json!(null))
        }
    }

    struct RecordingWork {
        order: Mutex<Vec<String>>,
        done: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LrtWork for RecordingWork {
        async fn execute(&self, tid: &str, _params: &Params) -> Result<Value> {
            self.order.lock().unwrap().push(tid.to_string());
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    }

    fn limiter_with(limit: usize, min_secs: u64, max_secs: u64) -> Arc<LrtLimiter> {
        let config = Config {
            lrt_context_limit: limit,
            lrt_min_retry_delay: Duration::from_secs(min_secs),
            lrt_max_retry_delay: Duration::from_secs(max_secs),
            ..Config::default()
        };
        LrtLimiter::new(&config)
    }

    fn memory_store() -> Arc<MemoryTaskStore> {
        let config = Config::default();
        MemoryTaskStore::new(
            config.clone(),
            Arc::new(SystemClock),
            Arc::new(HookRegistry::new()),
            Dispatcher::spawn(&config),
        )
    }

    #[tokio::test]
    async fn saturated_limiter_defers_work_back_to_the_store() {
        let limiter = limiter_with(1, 10, 120);
        let store = memory_store();
        store.start().await.unwrap();

        let blocker = Arc::new(BlockingWork {
            started: Notify::new(),
            release: Notify::new(),
        });
        let first = LrtHook::new(
            Arc::clone(&limiter),
            "ctx-a",
            Arc::clone(&blocker) as Arc<dyn LrtWork>,
        );
        Arc::clone(&first)
            .start(
                Arc::clone(&store) as Arc<dyn TaskStore>,
                "lrt-1".to_string(),
                Params::new(),
            )
            .await
            .unwrap();
        blocker.started.notified().await;
        assert_eq!(limiter.active_contexts(), 1);

        // a second context exceeds the cap and lands back in the store
        let second = LrtHook::new(
            Arc::clone(&limiter),
            "ctx-b",
            Arc::new(RecordingWork {
                order: Mutex::new(Vec::new()),
                done: Arc::new(AtomicU32::new(0)),
            }) as Arc<dyn LrtWork>,
        );
        Arc::clone(&second)
            .start(
                Arc::clone(&store) as Arc<dyn TaskStore>,
                "lrt-2".to_string(),
                Params::new(),
            )
            .await
            .unwrap();

        assert_eq!(limiter.active_contexts(), 1);
        assert!(store.is_registered("lrt-2", None).await.unwrap());
        let due = store.get("lrt-2").await.unwrap().unwrap().due_at;
        assert!(due > store.clock().now());

        blocker.release.notify_one();
    }

    #[tokio::test]
    async fn same_context_work_runs_in_submission_order() {
        let limiter = limiter_with(1, 10, 120);
        let store = memory_store();
        store.start().await.unwrap();

        let done = Arc::new(AtomicU32::new(0));
        let work = Arc::new(RecordingWork {
            order: Mutex::new(Vec::new()),
            done: Arc::clone(&done),
        });
        let hook = LrtHook::new(
            Arc::clone(&limiter),
            "ctx-a",
            Arc::clone(&work) as Arc<dyn LrtWork>,
        );

        for tid in ["lrt-1", "lrt-2", "lrt-3"] {
            Arc::clone(&hook)
                .start(
                    Arc::clone(&store) as Arc<dyn TaskStore>,
                    tid.to_string(),
                    Params::new(),
                )
                .await
                .unwrap();
        }

        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(*work.order.lock().unwrap(), vec!["lrt-1", "lrt-2", "lrt-3"]);

        // the context closes once drained
        for _ in 0..200 {
            if limiter.active_contexts() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("drained context never closed");
    }

    #[test]
    fn retry_delay_grows_with_backlog_and_is_clamped() {
        let limiter = limiter_with(2, 10, 60);
        assert_eq!(limiter.retry_delay(), Duration::from_secs(10));

        let mut last = Duration::ZERO;
        for n in 0..50 {
            {
                let mut queues = limiter.queues.lock().unwrap();
                queues
                    .entry("ctx".to_string())
                    .or_default()
                    .push_back(QueuedWork {
                        work: Arc::new(RecordingWork {
                            order: Mutex::new(Vec::new()),
                            done: Arc::new(AtomicU32::new(0)),
                        }),
                        tid: format!("lrt-{n}"),
                        params: Params::new(),
                    });
            }
            let delay = limiter.retry_delay();
            assert!(delay >= last, "backoff must be monotone in the backlog");
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(60));
            last = delay;
        }
        assert_eq!(last, Duration::from_secs(60));
    }
}
