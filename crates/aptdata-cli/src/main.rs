use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use aptdata_adapters::sheet::DEFAULT_SHEET_PART;
use aptdata_sync::{HarvestMode, Pipeline, SyncConfig, MAX_WINDOW};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aptdata-cli")]
#[command(about = "Apartment fee and trade ingestion pipeline")]
struct Cli {
    /// Log statements instead of executing them; checkpoints stay in memory.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create tables and natural-key indexes.
    Migrate,
    /// Stream a packaged fee worksheet into the store.
    LoadSheet {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = DEFAULT_SHEET_PART)]
        part: String,
        /// Household count map written by `harvest-households`.
        #[arg(long)]
        households: Option<PathBuf>,
    },
    /// Build the region x month target registry.
    InitTargets {
        #[arg(long, default_value_t = 2015)]
        start_year: i32,
        #[arg(long, default_value_t = 10)]
        years: u32,
    },
    /// Fetch every pending target into the archive.
    Harvest {
        /// Keep upstream fields instead of normalizing.
        #[arg(long)]
        raw: bool,
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Load archived JSON lines into the store.
    LoadArchive {
        #[arg(long)]
        raw: bool,
    },
    /// Delete and reload the trailing months.
    SyncWindow {
        #[arg(long)]
        months: Option<usize>,
        /// Keep running and sync on the configured cron schedule.
        #[arg(long)]
        schedule: bool,
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Look up household counts for complexes missing one.
    HarvestHouseholds,
}

fn mode(raw: bool) -> HarvestMode {
    if raw {
        HarvestMode::Raw
    } else {
        HarvestMode::Normalized
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    match &cli.command {
        Commands::Harvest { fixtures: Some(dir), .. } | Commands::SyncWindow { fixtures: Some(dir), .. } => {
            config.fixtures_dir = Some(dir.clone());
        }
        _ => {}
    }
    if let Commands::SyncWindow { months: Some(months), .. } = &cli.command {
        config.update_months = (*months).clamp(1, MAX_WINDOW);
    }
    let pipeline = Pipeline::new(config, cli.dry_run).await?;

    match cli.command {
        Commands::Migrate => {
            pipeline.migrate().await?;
            println!("migrate complete");
        }
        Commands::LoadSheet {
            file,
            part,
            households,
        } => {
            let tally = pipeline
                .load_sheet(&file, &part, households.as_deref())
                .await
                .with_context(|| format!("loading {}", file.display()))?;
            println!("load-sheet complete: {tally}");
        }
        Commands::InitTargets { start_year, years } => {
            let summary = pipeline.init_targets(start_year, years).await?;
            println!(
                "init-targets complete: pending={} completed={} error={}",
                summary.pending, summary.completed, summary.error
            );
        }
        Commands::Harvest { raw, .. } => {
            let summary = pipeline.harvest(mode(raw)).await?;
            println!(
                "harvest complete: completed={} errored={} items={} rejected={}",
                summary.completed, summary.errored, summary.items, summary.rejected
            );
        }
        Commands::LoadArchive { raw } => {
            let tally = pipeline.load_archive(mode(raw)).await?;
            println!("load-archive complete: {tally}");
        }
        Commands::SyncWindow { schedule, .. } => {
            let months = pipeline.config().update_months;
            let pipeline = Arc::new(pipeline);
            if let Some(mut sched) = pipeline.clone().maybe_build_scheduler(schedule).await? {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                sched.shutdown().await.context("stopping scheduler")?;
                return Ok(());
            }

            let reports = pipeline.sync_window(months).await?;
            for report in &reports {
                println!(
                    "{} {}: deleted={} fetched={} {}",
                    report.period, report.state, report.deleted, report.fetched, report.tally
                );
            }
            println!("sync-window complete: periods={}", reports.len());
        }
        Commands::HarvestHouseholds => {
            let summary = pipeline.harvest_households().await?;
            println!(
                "harvest-households complete: found={} failed={} settled={} rows_updated={}",
                summary.found, summary.failed, summary.settled, summary.rows_updated
            );
        }
    }

    Ok(())
}
