use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use zre_pipeline::{build_scheduler, Pipeline, PipelineConfig, Stage};
use zre_storage::{HttpListingSource, PgConnector, Warehouse, WarehouseConnector};
use zre_telemetry::{init_logging, JsonlMetricsSink, Telemetry};

#[derive(Debug, Parser)]
#[command(name = "zre-cli")]
#[command(about = "Zipco real estate listings pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch listings from the API into the raw tables
    Bronze,
    /// Rebuild the canonical listing tables from raw
    Silver,
    /// Rebuild the per-state summary tables
    Gold,
    /// bronze, silver, gold in order with stage retries (default)
    Run,
    /// Run the whole pipeline on the configured cron schedule until interrupted
    Schedule,
    /// Create the canonical and summary tables
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;
    let _log_guard = init_logging(&config.log_config())?;

    let telemetry = Telemetry::new(Arc::new(JsonlMetricsSink::new(config.metrics_path.clone())));
    let connector = PgConnector::new(config.database_url.clone());
    let source = Arc::new(HttpListingSource::new(config.http_client_config())?);
    let pipeline = Pipeline::new(connector, source, config.endpoints(), telemetry)
        .with_retry_policy(config.retry_policy());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Bronze => run_single(&pipeline, Stage::Bronze).await?,
        Commands::Silver => run_single(&pipeline, Stage::Silver).await?,
        Commands::Gold => run_single(&pipeline, Stage::Gold).await?,
        Commands::Run => {
            let summary = pipeline.run_all().await?;
            println!(
                "run complete: run_id={} stages={} elapsed_ms={}",
                summary.run_id,
                summary.stages.len(),
                (summary.finished_at - summary.started_at).num_milliseconds()
            );
        }
        Commands::Schedule => {
            let cron = config.schedule_cron.clone();
            let pipeline = Arc::new(pipeline);
            let mut sched = build_scheduler(Arc::clone(&pipeline), &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(
                host = pipeline.telemetry().host(),
                cron = %cron,
                "scheduler started; waiting for ctrl-c"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            println!("scheduler stopped");
        }
        Commands::Migrate => {
            let mut conn = pipeline.connector().connect().await?;
            let outcome = conn.ensure_derived_schema().await;
            conn.close().await?;
            outcome.context("creating canonical and summary tables")?;
            println!("migrate complete");
        }
    }

    Ok(())
}

async fn run_single(pipeline: &Pipeline<PgConnector>, stage: Stage) -> Result<()> {
    let report = pipeline.run_stage_with_retries(stage).await?;
    println!(
        "{stage} complete: {}",
        serde_json::to_string(&report).context("serializing stage report")?
    );
    Ok(())
}
