use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ecoalert_sync::{BatchCursor, EcoPipeline, RunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ecoalert")]
#[command(about = "EcoAlert environmental data loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rewrite species/climate onto lookup tables.
    Migrate,
    /// Fetch forecasts and load one capped batch of weather rows.
    Weather,
    /// Load climate anomalies from a NOAA dump (.json) or saved page (.html).
    Climate {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 0)]
        cursor: usize,
    },
    /// Load species assessments from an IUCN dump (.json) or saved page (.html).
    Species {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 0)]
        cursor: usize,
    },
    /// Weather plus any given snapshot inputs.
    Sync {
        #[arg(long)]
        climate: Option<PathBuf>,
        #[arg(long)]
        species: Option<PathBuf>,
    },
    Report,
    /// Print column layout and sample rows of species and climate.
    Verify,
    /// Run the weather load on ECOALERT_SYNC_CRON until interrupted.
    Schedule,
}

fn print_run(summary: &RunSummary) {
    println!(
        "{} run {}: inserted={} skipped_existing={} candidates={} next_cursor={} rejected={} unresolved={} calls_used={}",
        summary.dataset,
        summary.run_id,
        summary.inserted,
        summary.skipped_existing,
        summary.candidates,
        summary.cursor.position(),
        summary.rejected,
        summary.unresolved,
        summary.calls_used
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let pipeline = ecoalert_sync::connect_from_env().await?;

    match cli.command.unwrap_or(Commands::Weather) {
        Commands::Migrate => {
            let outcome = pipeline.migrate().await?;
            println!("migrate: {outcome:?}");
        }
        Commands::Weather => print_run(&pipeline.run_weather().await?),
        Commands::Climate { input, cursor } => {
            print_run(&pipeline.run_climate(&input, BatchCursor(cursor)).await?)
        }
        Commands::Species { input, cursor } => {
            print_run(&pipeline.run_species(&input, BatchCursor(cursor)).await?)
        }
        Commands::Sync { climate, species } => {
            for run in pipeline.run_once(climate.as_deref(), species.as_deref()).await? {
                print_run(&run);
            }
        }
        Commands::Report => {
            let summary = pipeline.write_reports().await?;
            println!(
                "report complete: run_id={} locations={} reports={} manifest={}",
                summary.run_id, summary.locations, summary.reports_dir, summary.parquet_manifest
            );
        }
        Commands::Verify => {
            let report = pipeline.verify().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing schema report")?
            );
        }
        Commands::Schedule => run_scheduler(Arc::new(pipeline)).await?,
    }

    Ok(())
}

async fn run_scheduler(pipeline: Arc<EcoPipeline>) -> Result<()> {
    let cron = pipeline.config().sync_cron.clone();
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        bail!("scheduler disabled; set ECOALERT_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    tracing::info!(%cron, "scheduler running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
