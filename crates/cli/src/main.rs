use clap::{Parser, Subcommand};
use std::sync::Arc;

use possync_broker_sim::SimBrokerage;
use possync_core::config::AppConfig;
use possync_core::traits::Brokerage;
use possync_core::types::{BrokerPosition, OptionRight};
use possync_core::ConfigLoader;
use possync_data::{Database, Repositories};
use possync_sync::{
    BrokerageSession, ContractRegistry, LogAlerter, PositionLog, PositionLogHandler,
    PositionSynchronizer, QueueWorker, ReconciliationService, Reconciler, WorkQueue,
};

#[derive(Parser)]
#[command(name = "possync")]
#[command(about = "Brokerage position synchronization daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the synchronization daemon
    Run {
        /// Config profile (also loads config/Config.<profile>.toml)
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Run one reconciliation pass and print the report
    Reconcile {
        /// Config profile (also loads config/Config.<profile>.toml)
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Show registry, queue, and position log counters
    Status {
        /// Config profile (also loads config/Config.<profile>.toml)
        #[arg(short, long)]
        profile: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run { profile } => {
            run_daemon(profile.as_deref()).await?;
        }
        Commands::Reconcile { profile } => {
            run_reconcile(profile.as_deref()).await?;
        }
        Commands::Status { profile } => {
            run_status(profile.as_deref()).await?;
        }
    }

    Ok(())
}

async fn open_database(config: &AppConfig) -> anyhow::Result<Database> {
    // Ensure the parent directory exists for SQLite database files
    if let Some(file_path) = config.database.url.strip_prefix("sqlite://") {
        let path = std::path::Path::new(file_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Database::new(&config.database.url, config.database.max_connections).await
}

fn build_brokerage(config: &AppConfig) -> anyhow::Result<Arc<dyn Brokerage>> {
    if !config.brokerage.paper {
        anyhow::bail!(
            "no live gateway connector is wired up yet; set brokerage.paper = true \
             (host {}:{} ignored in paper mode)",
            config.brokerage.host,
            config.brokerage.port
        );
    }
    let sim = SimBrokerage::new();
    seed_paper_book(&sim);
    Ok(Arc::new(sim))
}

/// Seeds the paper brokerage with a few open positions so the daemon has
/// something to route.
fn seed_paper_book(sim: &SimBrokerage) {
    sim.set_positions(vec![
        BrokerPosition::new(1001, "NVDA", OptionRight::Call, 140.0, "20260320", 5.0)
            .with_market_data(12.40, 6200.0, 9.80, 1300.0),
        BrokerPosition::new(1002, "SPY", OptionRight::Put, 500.0, "20251219", -2.0)
            .with_market_data(8.15, -1630.0, 7.90, -50.0),
        BrokerPosition::new(1003, "TSLA", OptionRight::Call, 300.0, "20260116", 1.0)
            .with_market_data(22.10, 2210.0, 25.00, -290.0),
    ]);
    tracing::info!("Paper brokerage seeded with 3 simulated positions");
}

async fn run_daemon(profile: Option<&str>) -> anyhow::Result<()> {
    let config = ConfigLoader::load(profile)?;
    let database = open_database(&config).await?;
    let repos = Repositories::new(database.pool().clone());

    let brokerage = build_brokerage(&config)?;
    let session = Arc::new(BrokerageSession::new(brokerage));

    let registry = ContractRegistry::new(repos.contracts.clone(), repos.queue.clone());
    let active = registry.initialize().await?;
    tracing::info!("Restored {} active contract(s) from history", active);

    let queue = Arc::new(WorkQueue::new(repos.queue.clone()));
    let (log, writer_task) = PositionLog::spawn(repos.position_log.clone(), &config.position_log);

    let synchronizer = PositionSynchronizer::new(
        Arc::clone(&session),
        registry.clone(),
        Arc::clone(&queue),
        config.synchronizer.clone(),
    )?;
    synchronizer
        .register_handler(Arc::new(PositionLogHandler::new(log.clone())))
        .await;
    let report = synchronizer.start().await?;
    tracing::info!(
        "Synchronizer started: {} streaming, {} queued, {} failed",
        report.streamed,
        report.queued,
        report.failed
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let worker = Arc::new(QueueWorker::new(
        Arc::clone(&session),
        Arc::clone(&queue),
        log.clone(),
        config.queue_worker.clone(),
    ));
    let worker_task = {
        let worker = Arc::clone(&worker);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    let reconciliation_task = {
        let service = ReconciliationService::new(
            Reconciler::new(
                Arc::clone(&session),
                log.clone(),
                config.reconciliation.quantity_tolerance,
            ),
            Arc::new(LogAlerter),
            config.reconciliation.clone(),
        );
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { service.run(shutdown_rx).await })
    };

    wait_for_shutdown().await;

    tracing::info!("Shutting down position sync daemon...");
    synchronizer.stop().await;
    let _ = shutdown_tx.send(true);
    let _ = worker_task.await;
    let _ = reconciliation_task.await;

    // Flush drains the buffer; the idle writer task can then be dropped.
    if let Err(e) = log.flush().await {
        tracing::error!("Final position log flush failed: {}", e);
    }
    writer_task.abort();

    if let Err(e) = session.disconnect().await {
        tracing::error!("Disconnect failed: {}", e);
    }
    tracing::info!("Position sync daemon stopped");
    Ok(())
}

async fn run_reconcile(profile: Option<&str>) -> anyhow::Result<()> {
    let config = ConfigLoader::load(profile)?;
    let database = open_database(&config).await?;
    let repos = Repositories::new(database.pool().clone());

    let brokerage = build_brokerage(&config)?;
    let session = Arc::new(BrokerageSession::new(brokerage));
    let (log, writer_task) = PositionLog::spawn(repos.position_log.clone(), &config.position_log);

    let reconciler = Reconciler::new(
        Arc::clone(&session),
        log.clone(),
        config.reconciliation.quantity_tolerance,
    );
    let report = reconciler.reconcile().await?;
    println!("{}", report.format_summary());

    writer_task.abort();
    session.disconnect().await?;

    if report.has_critical_issues() {
        anyhow::bail!("critical discrepancies found");
    }
    Ok(())
}

async fn run_status(profile: Option<&str>) -> anyhow::Result<()> {
    let config = ConfigLoader::load(profile)?;
    let database = open_database(&config).await?;
    let repos = Repositories::new(database.pool().clone());

    let registry = ContractRegistry::new(repos.contracts.clone(), repos.queue.clone());
    let active = registry.initialize().await?;

    let queue = WorkQueue::new(repos.queue.clone());
    let counts = queue.counts_by_status().await?;
    let logged = repos.position_log.count().await?;

    println!("Active contracts: {active}");
    println!("Queue:");
    if counts.is_empty() {
        println!("  (empty)");
    } else {
        for (status, count) in counts {
            println!("  {status}: {count}");
        }
    }
    println!("Position log rows: {logged}");
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to create SIGTERM handler");
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("Failed to create SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
    }
}
