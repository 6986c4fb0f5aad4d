use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod alerts;
mod baseline;
mod classify;
mod config;
mod error;
mod grid;
mod linalg;
mod locale;
mod merge;
mod models;
mod monthly;
mod report;
mod sources;
mod store;
mod taxonomy;

use crate::alerts::{BatchOptions, BatchSummary};
use crate::baseline::PoissonSeasonalModel;
use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::grid::{build_date_axis, build_grid, Grain};
use crate::locale::UnresolvedLog;
use crate::models::{LocaleKind, PairOutcome};
use crate::store::{latest_scope, CompletionStore, JsonlStore, PgStore, RunScope};

#[derive(Parser)]
#[command(name = "species-early-warning")]
#[command(about = "Early warning of surging public activity around invasive species", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./early-warning.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured locale kind
    #[arg(long, global = true, value_enum)]
    locale_kind: Option<LocaleKind>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Jsonl,
    Postgres,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Read every source extract and write the unified daily table
    Unify,
    /// Aggregate the unified table by month, joined with introduction metadata when configured
    Monthly,
    /// Fit baselines and classify every pair, resuming from earlier runs
    Alerts {
        /// Skip this many pairs at the head of the queue
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, value_enum, default_value_t = StoreKind::Jsonl)]
        store: StoreKind,
    },
    /// Generate a markdown report from recorded outcomes
    Report {
        #[arg(long, value_enum, default_value_t = StoreKind::Jsonl)]
        store: StoreKind,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config =
        PipelineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(kind) = cli.locale_kind {
        config.locale_kind = kind;
    }
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output_dir.display()
        )
    })?;

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&config).await?;
            store::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Unify => {
            let summary = unify_sources(&config)?;
            println!(
                "Wrote {} rows ({} non-zero) from {} sources to {}.",
                summary.rows,
                summary.non_zero,
                summary.sources,
                config.unified_path().display()
            );
        }
        Commands::Monthly => {
            let written = write_monthly(&config)?;
            println!(
                "Wrote {written} monthly aggregates to {}.",
                config.monthly_path().display()
            );
        }
        Commands::Alerts { offset, store } => {
            let summary = match store {
                StoreKind::Jsonl => {
                    let mut store = JsonlStore::open(config.progress_path())?;
                    run_alerts(&config, offset, &mut store).await?
                }
                StoreKind::Postgres => {
                    let pool = connect(&config).await?;
                    let mut store = PgStore::new(pool);
                    run_alerts(&config, offset, &mut store).await?
                }
            };
            println!(
                "Modeled {} pairs, {} alerting; skipped {} (insufficient history), {} (fit failure), {} (no evaluation data).",
                summary.modeled,
                summary.alerted,
                summary.skipped_insufficient,
                summary.skipped_fit_failure,
                summary.skipped_no_evaluation
            );
            println!("Alert report written to {}.", config.alert_report_path().display());
        }
        Commands::Report { store, out } => {
            let outcomes = match store {
                StoreKind::Jsonl => {
                    recorded_outcomes(&config, &JsonlStore::open(config.progress_path())?).await?
                }
                StoreKind::Postgres => {
                    let pool = connect(&config).await?;
                    recorded_outcomes(&config, &PgStore::new(pool)).await?
                }
            };
            write_markdown(&config, None, &outcomes, &out)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn connect(config: &PipelineConfig) -> anyhow::Result<PgPool> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL or database_url must point at a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

fn unify_sources(config: &PipelineConfig) -> anyhow::Result<merge::UnifySummary> {
    if config.sources.is_empty() {
        anyhow::bail!("no [[sources]] configured");
    }

    let unresolved = UnresolvedLog::default();
    let mut tables = Vec::with_capacity(config.sources.len());
    for spec in &config.sources {
        let adapter = sources::adapter_for(spec);
        match adapter.read_canonical(config.locale_kind, &unresolved) {
            Ok(table) => tables.push(table),
            Err(err @ IngestError::SchemaMismatch { .. }) => {
                warn!(%err, "skipping source");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to ingest {}", spec.source));
            }
        }
    }
    if unresolved.count() > 0 {
        warn!(
            distinct = unresolved.count(),
            "some locales could not be resolved"
        );
    }

    let grid = build_grid(&tables);
    if grid.is_empty() {
        warn!("no (entity, locale) pairs survived resolution");
    }
    let axis = build_date_axis(config.start, config.end_date(), Grain::Daily)?;
    info!(
        pairs = grid.len(),
        days = axis.len(),
        grain = ?axis.grain(),
        first = ?axis.first(),
        last = ?axis.last(),
        locale_kind = %config.locale_kind,
        "built canonical grid"
    );

    let path = config.unified_path();
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    merge::unify(tables, &grid, &axis, &mut writer)
}

fn open_unified(config: &PipelineConfig) -> anyhow::Result<BufReader<File>> {
    let path = config.unified_path();
    let file = File::open(&path).with_context(|| {
        format!(
            "failed to open {}; run `unify` first",
            path.display()
        )
    })?;
    Ok(BufReader::new(file))
}

fn write_monthly(config: &PipelineConfig) -> anyhow::Result<usize> {
    let axis = build_date_axis(config.start, config.end_date(), Grain::Monthly)?;
    let aggregates = monthly::with_unified_records(open_unified(config)?, |records| {
        monthly::aggregate_monthly(records, &axis)
    })
    .context("failed to parse unified daily table")?;

    let path = config.monthly_path();
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for aggregate in &aggregates {
        writer.serialize(aggregate)?;
    }
    writer.flush()?;

    if let Some(intro_path) = &config.introductions {
        let file = File::open(intro_path)
            .with_context(|| format!("failed to open {}", intro_path.display()))?;
        let introductions = monthly::read_introductions(file)
            .with_context(|| format!("failed to parse {}", intro_path.display()))?;
        let joined = monthly::join_introductions(&aggregates, &introductions);

        let path = config.monthly_introductions_path();
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for row in &joined {
            writer.serialize(row)?;
        }
        writer.flush()?;
        info!(rows = joined.len(), path = %path.display(), "wrote monthly introductions table");
    }

    Ok(aggregates.len())
}

async fn run_alerts<S: CompletionStore>(
    config: &PipelineConfig,
    offset: usize,
    store: &mut S,
) -> anyhow::Result<BatchSummary> {
    let series = alerts::load_pair_series(open_unified(config)?, &config.alert_sources())?;
    let model = Arc::new(PoissonSeasonalModel::new(config.baseline.clone()));
    let options = BatchOptions {
        workers: config.workers,
        offset,
        min_historical_observations: config.baseline.min_historical_observations,
    };

    let data_end = alerts::data_end(&series).unwrap_or_else(|| config.end_date());
    let scope = RunScope::new(config.locale_kind, config.cutoff, data_end);
    let summary = alerts::run_batch(series, model, scope, &options, store).await?;

    let outcomes = store.outcomes(&scope).await?;
    let entries = alerts::alert_entries(&outcomes);
    let path = config.alert_report_path();
    let file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    alerts::write_alert_report(&entries, file)?;

    let report_path = config
        .output_dir
        .join(format!("alerts_{}.md", config.locale_kind));
    write_markdown(config, Some(&summary), &outcomes, &report_path)?;

    Ok(summary)
}

async fn recorded_outcomes<S: CompletionStore>(
    config: &PipelineConfig,
    store: &S,
) -> anyhow::Result<Vec<PairOutcome>> {
    let scopes = store.scopes().await?;
    let Some(scope) = latest_scope(scopes, config.locale_kind, config.cutoff) else {
        anyhow::bail!(
            "no recorded outcomes for {} with cutoff {}; run `alerts` first",
            config.locale_kind,
            config.cutoff
        );
    };
    info!(data_end = %scope.data_end, "reporting latest recorded run");
    store.outcomes(&scope).await
}

fn write_markdown(
    config: &PipelineConfig,
    summary: Option<&BatchSummary>,
    outcomes: &[PairOutcome],
    out: &Path,
) -> anyhow::Result<()> {
    let report = report::build_report(config.locale_kind, config.cutoff, summary, outcomes);
    std::fs::write(out, report).with_context(|| format!("failed to write {}", out.display()))?;
    Ok(())
}
