use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pwatch_storage::PgStore;
use pwatch_sync::{maybe_build_scheduler, parse_stale_minutes, SyncConfig, SyncPipeline};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pwatch-cli")]
#[command(about = "Category price watcher: scrape, diff and notify")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one category, given its UUID or slug.
    RunScrape {
        category: String,
        /// Diff the finished run and dispatch immediate alerts.
        #[arg(long)]
        diff: bool,
    },
    /// Diff a completed scrape run and create its report.
    RunDiff { scrape_run_id: Uuid },
    /// Send the pending paid and admin deliveries of one report.
    SendImmediate { change_report_id: Uuid },
    /// Send digests to free users whose cooldown has elapsed.
    RunDigest,
    /// Fail RUNNING scrape runs older than the given minutes (default 30).
    CleanupStale { minutes: Option<String> },
    /// Scrape every active category whose interval has elapsed.
    ScrapeDue,
    /// Upsert the category reference list.
    SeedCategories,
    /// Apply database migrations.
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt.json())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt).init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env().context("loading configuration")?;
    init_tracing(config.log_json);

    if matches!(cli.command, Commands::Migrate) {
        let store = PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        store.migrate().await.context("applying migrations")?;
        info!("migrations applied");
        return Ok(());
    }

    if matches!(cli.command, Commands::Schedule) {
        config.scheduler_enabled = true;
    }
    let pipeline = Arc::new(SyncPipeline::connect(config).await?);

    match cli.command {
        Commands::RunScrape { category, diff } => {
            let scrape = pipeline
                .scrape_category(&category)
                .await
                .with_context(|| format!("scraping category {category}"))?;
            if diff {
                let diff = pipeline
                    .run_diff(scrape.scrape_run_id)
                    .await
                    .context("diffing scrape run")?;
                print_json(&serde_json::json!({ "scrape": scrape, "diff": diff }))?;
            } else {
                print_json(&scrape)?;
            }
        }
        Commands::RunDiff { scrape_run_id } => {
            let diff = pipeline
                .run_diff(scrape_run_id)
                .await
                .with_context(|| format!("diffing scrape run {scrape_run_id}"))?;
            print_json(&diff)?;
        }
        Commands::SendImmediate { change_report_id } => {
            let result = pipeline
                .send_immediate(change_report_id)
                .await
                .context("sending immediate alerts")?;
            print_json(&result)?;
        }
        Commands::RunDigest => {
            let result = pipeline.send_digests().await.context("sending digests")?;
            print_json(&result)?;
        }
        Commands::CleanupStale { minutes } => {
            let minutes = parse_stale_minutes(minutes.as_deref()).map_err(|e| anyhow!(e))?;
            let result = pipeline
                .cleanup_stale_runs(minutes)
                .await
                .context("sweeping stale runs")?;
            print_json(&result)?;
        }
        Commands::ScrapeDue => {
            let summary = pipeline
                .scrape_due_categories()
                .await
                .context("scraping due categories")?;
            print_json(&summary)?;
        }
        Commands::SeedCategories => {
            let result = pipeline.seed_categories().await?;
            print_json(&result)?;
        }
        Commands::Schedule => {
            let Some(mut sched) = maybe_build_scheduler(Arc::clone(&pipeline)).await? else {
                return Err(anyhow!("scheduler is disabled"));
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::Migrate => {}
    }

    Ok(())
}
