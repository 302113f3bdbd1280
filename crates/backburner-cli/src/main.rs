use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use backburner_core::scheduler::Dispatcher;
use backburner_core::{
    Config, Hook, HookRef, HookRegistry, MemoryTaskStore, Params, Result, Scheduler, TaskStore,
};

#[derive(Debug, Deserialize)]
struct GreetParams {
    name: String,
}

struct GreetHook;

#[async_trait]
impl Hook for GreetHook {
    async fn run(&self, tid: &str, params: Params) -> Result<Value> {
        let p: GreetParams = serde_json::from_value(Value::Object(params))?;
        println!("[{tid}] Hello, {}!", p.name);
        Ok(json!(null))
    }
}

struct SessionHook;

#[async_trait]
impl Hook for SessionHook {
    async fn run(&self, tid: &str, _params: Params) -> Result<Value> {
        println!("[{tid}] session touched, expiry pushed back");
        Ok(json!("alive"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,backburner_core=debug".into()),
        )
        .init();

    // (A) registry and the memory store
    let mut registry = HookRegistry::new();
    registry.register("greet", Arc::new(GreetHook))?;
    registry.register("session", Arc::new(SessionHook))?;
    let registry = Arc::new(registry);

    let config = Config::default();
    let dispatcher = Dispatcher::spawn(&config);
    let store = MemoryTaskStore::new(
        config,
        Arc::new(backburner_core::SystemClock),
        registry,
        Arc::clone(&dispatcher),
    );

    // (B) scheduler drives the store's run() at its due times
    let scheduler = Scheduler::start(Arc::clone(&store) as Arc<dyn TaskStore>).await?;

    // (C) a one-shot task, due in one second
    let mut params = Params::new();
    params.insert("name".to_string(), json!("backburner"));
    store
        .add("greet-1", HookRef::named("greet"), Some(Duration::from_secs(1)), params)
        .await?;

    // (D) a keep-alive registration: touched once, then left to expire
    store
        .register_timeout(
            "session-1",
            HookRef::named("session"),
            Some(Duration::from_secs(2)),
            Params::new(),
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut touch = Params::new();
    touch.insert("tid".to_string(), json!("session-1"));
    let result = store.call(&touch, None).await?;
    println!("touch result: {result:?}");

    // let the session expire silently
    tokio::time::sleep(Duration::from_millis(2500)).await;
    println!(
        "session still registered: {}",
        store.is_registered("session-1", None).await?
    );

    scheduler.stop().await;
    dispatcher.request_shutdown();
    Ok(())
}
