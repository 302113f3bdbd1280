//! Timer loop and bounded dispatch pool.
//!
//! The [`Scheduler`] drives a store: it sleeps until the store's next due
//! time, calls `run()`, and re-arms whenever the store signals that its
//! next wake-up moved earlier. The [`Dispatcher`] is a bounded worker
//! pool that executes detached hook work with explicit backpressure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Result, TaskError};
use crate::store::TaskStore;

type DispatchJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Bounded worker pool for detached task execution.
pub struct Dispatcher {
    tx: mpsc::Sender<DispatchJob>,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    /// Spawn the worker pool sized from the configuration.
    pub fn spawn(config: &Config) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.dispatch_queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for worker_id in 0..config.dispatch_workers.max(1) {
            let rx = Arc::clone(&rx);
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    let job = tokio::select! {
                        _ = shutdown_rx.changed() => continue,
                        job = async { rx.lock().await.recv().await } => job,
                    };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
                tracing::debug!(worker_id, "dispatch worker stopped");
            });
        }

        Arc::new(Self { tx, shutdown_tx })
    }

    /// Queue one job; waits when the pool's queue is full.
    pub async fn submit(&self, job: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::pin(job))
            .await
            .map_err(|_| TaskError::Stopped)
    }

    /// Stop taking new work. In-flight jobs are not awaited.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Sleep horizon when the store reports no due work; a wake-up signal
/// cuts it short.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Drives one task store's `run()` at its `next_due()` times.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Start the store (crash recovery included) and the timer loop.
    pub async fn start(store: Arc<dyn TaskStore>) -> Result<Self> {
        store.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_store = Arc::clone(&store);
        let handle = tokio::spawn(run_loop(loop_store, shutdown_rx));

        Ok(Self {
            store,
            shutdown_tx,
            handle,
        })
    }

    /// Best-effort shutdown: stops the store and the loop; in-flight
    /// dispatches keep running detached.
    pub async fn stop(self) {
        self.store.stop();
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn run_loop(store: Arc<dyn TaskStore>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut wakeups = store.wakeups();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let sleep_for = match store.next_due() {
            Ok(Some(due)) => (due - store.clock().now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            Ok(None) => IDLE_SLEEP,
            Err(err) => {
                tracing::error!(%err, "failed to read next due time");
                Duration::from_secs(1)
            }
        };

        tokio::select! {
            _ = shutdown_rx.changed() => continue,
            // the next wake-up may have moved earlier
            _ = wakeups.changed() => continue,
            _ = tokio::time::sleep(sleep_for) => {
                if let Err(err) = Arc::clone(&store).run().await {
                    tracing::error!(%err, "scheduled run failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::hook::{Hook, HookRef, HookRegistry, Params};
    use crate::memory::MemoryTaskStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHook {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Hook for CountingHook {
        async fn run(&self, _tid: &str, _params: Params) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    }

    #[tokio::test]
    async fn dispatcher_executes_submitted_jobs() {
        let counter = Arc::new(AtomicU32::new(0));
        let dispatcher = Dispatcher::spawn(&Config::default());

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            dispatcher
                .submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 5 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dispatcher never ran all jobs");
    }

    #[tokio::test]
    async fn shutdown_dispatcher_refuses_new_work() {
        let counter = Arc::new(AtomicU32::new(0));
        let dispatcher = Dispatcher::spawn(&Config::default());

        {
            let counter = Arc::clone(&counter);
            dispatcher
                .submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        dispatcher.request_shutdown();

        // once the workers exit they drop the queue and submissions fail
        let mut refused = false;
        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            let submitted = dispatcher
                .submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            if submitted.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(refused, "dispatcher kept accepting work after shutdown");
    }

    #[tokio::test]
    async fn scheduler_fires_task_added_while_idle() {
        let hook = Arc::new(CountingHook {
            calls: AtomicU32::new(0),
        });
        let mut registry = HookRegistry::new();
        registry
            .register("tick", Arc::clone(&hook) as Arc<dyn Hook>)
            .unwrap();

        let config = Config::default();
        let store = MemoryTaskStore::new(
            config.clone(),
            Arc::new(SystemClock),
            Arc::new(registry),
            Dispatcher::spawn(&config),
        );

        let scheduler = Scheduler::start(Arc::clone(&store) as Arc<dyn TaskStore>)
            .await
            .unwrap();

        // the loop is parked on the idle sleep; the insertion must re-arm it
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .add(
                "tick-1",
                HookRef::named("tick"),
                Some(Duration::from_millis(30)),
                Params::new(),
            )
            .await
            .unwrap();

        let mut fired = false;
        for _ in 0..200 {
            if hook.calls.load(Ordering::SeqCst) == 1 {
                fired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.stop().await;
        assert!(fired, "scheduler never dispatched the due task");
    }
}
