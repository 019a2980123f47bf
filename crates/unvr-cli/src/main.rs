use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use unvr_core::{DataSource, FeaturedSelection};
use unvr_storage::{
    MemoryOrganizationDirectory, MemoryRunTracker, MemoryVacancyStore, PgOrganizationDirectory,
    PgRunTracker, PgVacancyStore,
};
use unvr_sync::{
    build_scheduler, select_featured, RunSummary, SourceRegistry, SyncConfig, SyncPipeline,
    DEFAULT_FEATURED_LIMIT,
};

#[derive(Debug, Parser)]
#[command(name = "unvr")]
#[command(about = "UN Vacancy Reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ETL for one source now.
    Run {
        /// imf, unhcr, wfp, undp, inspira or worldbank
        source: DataSource,
    },
    /// Run every enabled source in turn.
    RunAll,
    /// Serve the JSON API, with the scheduler when UNVR_SCHEDULER_ENABLED is set.
    Serve,
    /// Run the cron scheduler without the API.
    Schedule,
    /// Print the featured vacancy selection as JSON.
    Featured {
        #[arg(long, value_enum, default_value_t = FeaturedKind::ExpiringSoon)]
        kind: FeaturedKind,
        #[arg(long, default_value_t = 2)]
        days: u32,
        #[arg(long)]
        network: Option<String>,
        #[arg(long, default_value_t = DEFAULT_FEATURED_LIMIT)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FeaturedKind {
    ExpiringSoon,
    JobNetwork,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,unvr_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if matches!(cli.command, Commands::Schedule) && !config.scheduler_enabled {
        warn!("UNVR_SCHEDULER_ENABLED is off; enabling it for the schedule command");
        config.scheduler_enabled = true;
    }
    let pipeline = Arc::new(build_pipeline(config).await?);

    match cli.command {
        Commands::Run { source } => {
            let summary = pipeline.run_etl(source).await?;
            print_summary(&summary);
        }
        Commands::RunAll => {
            let mut failed = 0;
            for (source, result) in pipeline.run_all().await {
                match result {
                    Ok(summary) => print_summary(&summary),
                    Err(err) => {
                        failed += 1;
                        eprintln!("{source}: {err}");
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} source run(s) failed");
            }
        }
        Commands::Serve => {
            let scheduler = build_scheduler(pipeline.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            unvr_web::serve(pipeline).await?;
        }
        Commands::Schedule => {
            let Some(mut sched) = build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Featured {
            kind,
            days,
            network,
            limit,
        } => {
            let selection = match kind {
                FeaturedKind::ExpiringSoon => FeaturedSelection::ExpiringSoon { days },
                FeaturedKind::JobNetwork => FeaturedSelection::JobNetwork {
                    name: network.context("--network is required for job-network")?,
                },
            };
            let store = pipeline.store();
            let featured = select_featured(
                store.as_ref(),
                &selection,
                limit,
                Utc::now(),
                &pipeline.config().public_base_url,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&featured)?);
        }
    }

    Ok(())
}

/// Postgres-backed pipeline when DATABASE_URL is set, in-memory otherwise.
async fn build_pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let registry = SourceRegistry::load(&config.workspace_root)?;
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .context("connecting to database")?;
            info!("database connected");
            SyncPipeline::new(
                config,
                registry,
                Arc::new(PgVacancyStore::new(pool.clone())),
                Arc::new(PgRunTracker::new(pool.clone())),
                Arc::new(PgOrganizationDirectory::new(pool)),
            )
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store");
            SyncPipeline::new(
                config,
                registry,
                Arc::new(MemoryVacancyStore::new()),
                Arc::new(MemoryRunTracker::new()),
                Arc::new(MemoryOrganizationDirectory::default()),
            )
        }
    }
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.stats;
    println!(
        "{} {}: run_id={} inserted={} updated={} ghost_closed={} expired_closed={} pages={} failures={}",
        summary.data_source,
        summary.status.as_str(),
        summary.run_id,
        stats.inserted,
        stats.updated,
        stats.ghost_closed,
        stats.expired_closed,
        stats.pages_fetched,
        stats.page_failures + stats.listing_failures,
    );
    if let Some(dir) = &summary.reports_dir {
        println!("  reports: {dir}");
    }
}
