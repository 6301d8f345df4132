use clap::Parser;
use drudge_core::InMemoryQueue;
use drudge_worker::cli::Cli;
use drudge_worker::{signals, Lifecycle, Manager, ShutdownOutcome, WorkerRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.validate()?;

    let config = cli.load_config()?;
    let log_guard = cli.init_tracing(&config.log_level)?;
    cli.write_pid()?;

    let (events, signal_rx) = mpsc::unbounded_channel();
    let _listeners = signals::install(events);

    // Create queues and register the configured workers
    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(WorkerRegistry::new());
    for (name, queue_config) in &config.queues {
        queue.create_queue(name.clone(), queue_config.visibility_timeout());
        for body in &queue_config.seed_messages {
            queue.send(name, body.clone())?;
        }
        registry.register(queue_config.builtin_descriptor(name)?);
    }

    tracing::info!("Registered queues: {:?}", registry.queue_names());

    let manager = Arc::new(Manager::new(config.clone(), registry, queue));
    manager.start();

    let outcome = Lifecycle::new(manager, signal_rx)
        .with_deadline(config.shutdown_timeout())
        .run()
        .await;

    if outcome == ShutdownOutcome::DeadlineExceeded {
        tracing::warn!("Exiting with processors still running");
    }
    tracing::info!("Bye");

    drop(log_guard);
    std::process::exit(0);
}
