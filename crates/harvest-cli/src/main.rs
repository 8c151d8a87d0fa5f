use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::{column_index, column_letter};
use harvest_sync::{SyncConfig, SyncPipeline, SyncRunSummary};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "harvest")]
#[command(about = "Metadata harvester: gather remote catalogs and reconcile them into a local one")]
struct Cli {
    /// Ignore incremental watermarks and write packages even when they are not newer.
    #[arg(long, global = true)]
    force: bool,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Gather and import every enabled source.
    Run,
    /// Gather one source and stop before import.
    Gather {
        #[arg(long)]
        source: String,
    },
    /// Import the pending objects of a gathered job.
    Import {
        #[arg(long)]
        source: String,
        #[arg(long)]
        job: Uuid,
    },
    /// Check source configurations and field mappings.
    ValidateConfig {
        #[arg(long)]
        source: Option<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Convert a spreadsheet column index to letters, or letters to an index.
    Columns { value: String },
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if json {
        tracing_subscriber::registry().with(filter).with(layer.json()).try_init()?;
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init()?;
    }
    Ok(())
}

/// Cancel the pipeline's token on Ctrl-C; work already reconciled stays.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current request");
            token.cancel();
        }
    });
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "harvest complete: run_id={} sources={} failed_sources={} created={} updated={} unchanged={} deleted={} failed={} reports={}",
        summary.run_id,
        summary.enabled_sources,
        summary.failed_sources,
        summary.created,
        summary.updated,
        summary.unchanged,
        summary.deleted,
        summary.failed_objects,
        summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    let mut config = SyncConfig::from_env();
    if cli.force {
        config.full_fetch = true;
        config.force_import = true;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = SyncPipeline::connect(config).await?;
            cancel_on_interrupt(pipeline.cancellation_token());
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Gather { source } => {
            let pipeline = SyncPipeline::connect(config).await?;
            cancel_on_interrupt(pipeline.cancellation_token());
            let source = pipeline.source(&source).await?;
            let report = pipeline.gather(Uuid::new_v4(), &source).await?;
            println!(
                "gather complete: job_id={} new={} change={} delete={} skipped={}",
                report.job_id, report.new, report.change, report.delete, report.skipped
            );
        }
        Commands::Import { source, job } => {
            let pipeline = SyncPipeline::connect(config).await?;
            cancel_on_interrupt(pipeline.cancellation_token());
            let source = pipeline.source(&source).await?;
            let report = pipeline.import(Uuid::new_v4(), &source, job).await?;
            println!(
                "import complete: job_id={} created={} updated={} unchanged={} deleted={} failed={}",
                report.job_id, report.created, report.updated, report.unchanged, report.deleted, report.failed
            );
        }
        Commands::ValidateConfig { source } => {
            let pipeline = SyncPipeline::connect(config).await?;
            let results = pipeline.validate_sources(source.as_deref()).await?;
            let mut invalid = 0;
            for result in &results {
                match &result.message {
                    None => println!("ok      {}", result.source_id),
                    Some(message) => {
                        invalid += 1;
                        println!("invalid {}: {message}", result.source_id);
                    }
                }
            }
            if invalid > 0 {
                bail!("{invalid} of {} source(s) have invalid configuration", results.len());
            }
        }
        Commands::Migrate => {
            harvest_sync::migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler is disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            pipeline.cancellation_token().cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Columns { value } => match value.parse::<usize>() {
            Ok(index) => println!("{}", column_letter(index)),
            Err(_) => match column_index(&value) {
                Some(index) => println!("{index}"),
                None => bail!("{value} is neither a column index nor column letters"),
            },
        },
    }

    Ok(())
}
