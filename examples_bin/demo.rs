//! Minimal runnable smoke-test for `taskforge`.
//!
//! Registers one task, starts an in-memory worker, submits a job through
//! the client, and prints its result. Not the dashboard/host-bootstrap
//! surface the crate excludes — just the "hello world" a reader can run.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use taskforge::backend::InMemoryBackend;
use taskforge::broker::{InMemoryBroker, QueueOptions};
use taskforge::config::Settings;
use taskforge::delayed::DelayedDispatcher;
use taskforge::executor::WorkerExecutor;
use taskforge::filters::FilterPipeline;
use taskforge::handler::{FnHandler, TaskContext};
use taskforge::registry::{TaskBuilder, TaskRegistry};
use taskforge::router::Router;
use taskforge::serializer::JsonSerializer;
use taskforge::signals::SignalBus;
use taskforge::stores::{InMemoryPartitionLockStore, InMemoryRevocationStore};
use taskforge::{Client, SendOptions};

#[derive(Parser, Debug)]
#[command(name = "taskforge-demo", about = "Submit and run one greeting task end to end")]
struct Args {
    /// Name to greet.
    #[arg(long, default_value = "world")]
    name: String,

    /// Path to an optional TOML settings file (layered under defaults and env).
    #[arg(long, default_value = "taskforge.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Greeting {
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("taskforge=info".parse()?))
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    tracing::info!(concurrency = settings.worker.concurrency, "loaded settings");

    let serializer = Arc::new(JsonSerializer);
    let broker = Arc::new(InMemoryBroker::new());
    broker.declare_queue("celery", QueueOptions::default()).await?;
    let backend = Arc::new(InMemoryBackend::new());
    let locks = Arc::new(InMemoryPartitionLockStore::new());
    let revocations = Arc::new(InMemoryRevocationStore::new());
    let signals = Arc::new(SignalBus::new(1024));
    let router = Arc::new(Router::new());

    let mut registry = TaskRegistry::new();
    registry.register(
        TaskBuilder::new(
            "demo.greet",
            Arc::new(FnHandler::new(serializer.clone(), |_ctx: TaskContext, input: Greet| async move {
                Ok::<_, (String, String)>(Greeting { message: format!("hello, {}!", input.name) })
            })),
        )
        .max_retries(3)
        .build(),
    );
    let registry = Arc::new(registry);

    let executor = Arc::new(WorkerExecutor::new(
        settings.worker.to_executor_config(),
        broker.clone(),
        backend.clone(),
        registry.clone(),
        Arc::new(FilterPipeline::new()),
        locks,
        revocations.clone(),
        signals,
        "demo-worker",
    ));
    let shutdown = tokio_util::sync::CancellationToken::new();
    let workers = executor.spawn(shutdown.clone());

    let delayed = Arc::new(DelayedDispatcher::new(broker.clone(), taskforge::delayed::DEFAULT_TICK));
    let delayed_ticker = delayed.clone().spawn();

    let client = Client::new(broker, backend, revocations, router, serializer).with_delayed_dispatcher(delayed);
    let result = client
        .send::<_, Greeting>("demo.greet", Greet { name: args.name }, SendOptions::default())
        .await?;
    let greeting = result.get(Duration::from_secs(5)).await?;
    println!("{}", greeting.message);

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    delayed_ticker.abort();
    Ok(())
}
