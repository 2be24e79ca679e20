use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use issuesync_storage::{open_store, IssueStore, PgIssueStore};
use issuesync_sync::triage::TriageService;
use issuesync_sync::{CycleScheduler, SyncConfig, SyncPipeline, TriggerSource};
use issuesync_web::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "issuesync")]
#[command(about = "Mirror open GitHub issues into a local store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single sync cycle and print its report.
    Sync,
    /// Serve the issue API, with the background sync unless disabled.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Backfill missing timestamps on stored issues.
    Repair,
    /// Print the stored issue count and a few recent issues.
    Inspect {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = open_store(config.database_url.as_deref()).await?;
            let pipeline = SyncPipeline::from_config(&config, store)?;
            let report = pipeline.run_cycle(TriggerSource::Manual).await;
            println!(
                "sync complete: cycle_id={} termination={} pages={} inserted={} updated={} unchanged={} evicted={}",
                report.cycle_id,
                report.termination,
                report.pages_fetched,
                report.inserted,
                report.updated,
                report.unchanged,
                report.evicted
            );
        }
        Commands::Serve => serve(config).await?,
        Commands::Migrate => {
            persistent_store(&config, "migrate").await?;
            println!("migrations applied");
        }
        Commands::Repair => {
            let store = persistent_store(&config, "repair").await?;
            let report = store.repair_missing_timestamps().await?;
            println!("repair complete: repaired={} removed={}", report.repaired, report.removed);
        }
        Commands::Inspect { limit } => {
            let store = persistent_store(&config, "inspect").await?;
            let total = store.count().await?;
            let recent = store.list_recent(limit).await?;
            println!("{total} stored issues");
            println!("{}", serde_json::to_string_pretty(&recent)?);
        }
    }

    Ok(())
}

/// Maintenance commands act on stored data, which only Postgres keeps
/// between processes.
async fn persistent_store(config: &SyncConfig, command: &str) -> Result<PgIssueStore> {
    let url = require_database_url(config, command)?;
    let store = PgIssueStore::connect(url).await.context("connecting to DATABASE_URL")?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

fn require_database_url<'a>(config: &'a SyncConfig, command: &str) -> Result<&'a str> {
    config.database_url.as_deref().with_context(|| {
        format!(
            "DATABASE_URL is required for {command}; without it issues live only in the \
             serving process (use POST /api/github/fix-fields or GET /api/github/debug there)"
        )
    })
}

/// An enabled background sync without credentials is a startup error.
fn background_sync_enabled(config: &SyncConfig) -> Result<bool> {
    if !config.scheduler_enabled {
        return Ok(false);
    }
    config.credential_pool().context(
        "background sync needs GitHub credentials (set ISSUESYNC_SCHEDULER_ENABLED=false to serve only)",
    )?;
    Ok(true)
}

async fn serve(config: SyncConfig) -> Result<()> {
    let store = open_store(config.database_url.as_deref()).await?;
    let mut state = AppState::new(store.clone(), TriageService::from_config(&config)?);

    let drivers = if !background_sync_enabled(&config)? {
        info!("background sync disabled");
        None
    } else {
        let pipeline = SyncPipeline::from_config(&config, store)?;
        let scheduler = Arc::new(CycleScheduler::new(Arc::new(pipeline)));
        let drivers = scheduler
            .start_drivers(config.heartbeat, config.refresh_cron.as_ref())
            .await?;
        state = state.with_scheduler(scheduler);
        Some(drivers)
    };

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    issuesync_web::serve(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    if let Some(drivers) = drivers {
        drivers.shutdown().await?;
    }
    info!("shut down");
    Ok(())
}
