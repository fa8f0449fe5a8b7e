//! taskloom - command line entry point
//!
//! Runs one orchestration pass against the configured repository and prints
//! the run report as JSON.

use std::sync::Arc;

use taskloom::config::Config;
use taskloom::executor::CommandExecutor;
use taskloom::ledger::create_ledger;
use taskloom::sync::{GhCliTracker, SyncGateway};
use taskloom::Orchestrator;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    // Agent pipelines nest deeply (scheduler -> pipeline -> subprocess I/O).
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(8 * 1024 * 1024)
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskloom=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: repo={} agent={} ledger={}",
        config.tracker_repo,
        config.agent.program,
        config.ledger_dir.display()
    );

    let ledger = create_ledger(config.ledger_store, config.ledger_dir.clone()).await?;
    let gateway = SyncGateway::new(Arc::new(GhCliTracker::new(config.tracker_repo.clone())))
        .with_label(config.tracker_label.clone())
        .with_backoff(config.sync_backoff);
    let executor = CommandExecutor::new(config.agent.clone());

    let orchestrator = Orchestrator::new(Arc::from(ledger), Arc::new(gateway), Arc::new(executor))
        .with_config(&config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, cancelling run");
                on_signal.cancel();
            }
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        }
    });

    let report = orchestrator.run(cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
