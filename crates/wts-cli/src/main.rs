use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use wts_adapters::ReferenceTables;
use wts_storage::PgStore;
use wts_sync::{
    open_store, report_runs_markdown, store_metrics, EffortSummary, MetricsScope, ReconcileMode,
    StoreKind, SyncConfig, SyncPipeline, UnitStatus,
};

#[derive(Debug, Parser)]
#[command(name = "wts-cli")]
#[command(about = "Work-To-Sheets task ledger command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every submission into the store (dry run unless --apply).
    Ingest {
        #[arg(long)]
        apply: bool,
        #[arg(long)]
        submissions: Option<PathBuf>,
        #[arg(long)]
        reference: Option<PathBuf>,
        #[arg(long)]
        store: Option<StoreKind>,
    },
    /// Create or upgrade the Postgres schema.
    Migrate,
    /// Effort, person-days and efficiency over persisted records.
    Metrics {
        #[arg(long)]
        person: Option<String>,
        #[arg(long)]
        team: Option<String>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        include_incomplete: bool,
        #[arg(long)]
        store: Option<StoreKind>,
        #[arg(long)]
        reference: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Summarize the most recent run directories.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_rows(title: &str, rows: &[EffortSummary]) {
    println!("{title}");
    for row in rows {
        println!(
            "  {:<16} minutes={:>9.1} person_days={:>4} tasks={:>4} efficiency={:.3}",
            row.key, row.task_minutes, row.person_days, row.tasks, row.efficiency
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest {
        apply: false,
        submissions: None,
        reference: None,
        store: None,
    }) {
        Commands::Ingest {
            apply,
            submissions,
            reference,
            store,
        } => {
            let mut config = SyncConfig::from_env();
            if apply {
                config.mode = ReconcileMode::Apply;
            }
            if let Some(dir) = submissions {
                config.submissions_dir = dir;
            }
            if let Some(path) = reference {
                config.reference_path = path;
            }
            if let Some(kind) = store {
                config.store = kind;
            }

            let store = open_store(&config).await?;
            let pipeline = SyncPipeline::new(config, store)?;
            let stop = pipeline.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight units");
                    stop.store(true, Ordering::SeqCst);
                }
            });

            let summary = pipeline.run_once().await?;
            println!(
                "ingest complete: run_id={} mode={:?} units={} applied={} planned={} failed={} +{} ~{} -{} issues={} reports={}",
                summary.run_id,
                summary.mode,
                summary.units.len(),
                summary.units_with(UnitStatus::Applied),
                summary.units_with(UnitStatus::Planned),
                summary.units_with(UnitStatus::Failed),
                summary.totals.inserted,
                summary.totals.updated,
                summary.totals.deleted,
                summary.quality.total_issues(),
                summary.reports_dir
            );
            if summary.has_failures() {
                bail!(
                    "{} unit(s) and {} file(s) failed; see {}",
                    summary.units_with(UnitStatus::Failed),
                    summary.failed_files.len(),
                    summary.reports_dir
                );
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            PgStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Metrics {
            person,
            team,
            from,
            to,
            include_incomplete,
            store,
            reference,
            json,
        } => {
            let mut config = SyncConfig::from_env();
            if let Some(kind) = store {
                config.store = kind;
            }
            if let Some(path) = reference {
                config.reference_path = path;
            }
            let reference = ReferenceTables::load(&config.reference_path)
                .with_context(|| format!("loading {}", config.reference_path.display()))?;
            let store = open_store(&config).await?;
            let scope = MetricsScope {
                person,
                team,
                from,
                to,
                include_incomplete,
            };
            let report =
                store_metrics(store.as_ref(), &reference, config.shift_minutes, &scope).await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serializing metrics")?
                );
            } else {
                print_rows("total", std::slice::from_ref(&report.total));
                print_rows("teams", &report.teams);
                print_rows("persons", &report.persons);
            }
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            let markdown = report_runs_markdown(runs, &config.reports_dir)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
