use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use stockpulse_core::config::Settings;
use stockpulse_core::ingest::{HttpJsonProvider, Provider};
use stockpulse_core::pipeline::{JobKind, JobRunner, ManualOutcome, Pipeline, TriggerOutcome};
use stockpulse_core::storage::{InMemoryRepository, PgRepository, Repository};
use stockpulse_core::time::{Clock, SystemClock};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "stockpulse_worker")]
struct Args {
    /// Keep everything in memory instead of writing to the database.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daily scheduler until interrupted (default).
    Run,
    /// Capture analyst snapshots now. With --ticker, a debounced single-ticker snapshot.
    Snapshot {
        #[arg(long)]
        ticker: Option<String>,
    },
    /// Resolve due predictions.
    Evaluate {
        /// Market as-of date (YYYY-MM-DD). Defaults to today's date in MARKET_TZ.
        #[arg(long)]
        as_of_date: Option<String>,
    },
    /// Rebuild analyst scores from resolved predictions.
    Recompute,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let repo = open_repository(&settings, args.dry_run).await?;
    let provider: Arc<dyn Provider> = Arc::new(HttpJsonProvider::from_settings(&settings)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let pipeline = Arc::new(Pipeline::new(repo, provider, clock.clone(), &settings));
    let runner = Arc::new(JobRunner::new(
        pipeline.clone(),
        pipeline.calendar().clone(),
        clock.clone(),
        &settings,
    ));

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_scheduler(runner, settings.worker_tick_secs).await,
        Command::Snapshot { ticker: Some(ticker) } => {
            match runner.manual_snapshot(&ticker).await? {
                ManualOutcome::Accepted { report } => {
                    tracing::info!(%ticker, failures = report.failures, summary = %report.summary, "manual snapshot finished");
                }
                ManualOutcome::Debounced { ticker, market_date } => {
                    tracing::info!(%ticker, %market_date, "snapshot already captured today; skipped");
                }
            }
            Ok(())
        }
        Command::Snapshot { ticker: None } => {
            let date = runner.market_date();
            finish(JobKind::Snapshot, runner.run_now(JobKind::Snapshot, date).await)
        }
        Command::Evaluate { as_of_date } => {
            let date = pipeline
                .calendar()
                .resolve_as_of_date(as_of_date.as_deref(), clock.now())?;
            finish(JobKind::Evaluate, runner.run_now(JobKind::Evaluate, date).await)
        }
        Command::Recompute => {
            let date = runner.market_date();
            finish(JobKind::Recompute, runner.run_now(JobKind::Recompute, date).await)
        }
    }
}

async fn open_repository(settings: &Settings, dry_run: bool) -> anyhow::Result<Arc<dyn Repository>> {
    if dry_run {
        tracing::info!(dry_run = true, "using in-memory repository");
        return Ok(Arc::new(InMemoryRepository::with_tracked(&settings.tracked_tickers)));
    }

    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    stockpulse_core::storage::migrate(&pool).await?;
    Ok(Arc::new(PgRepository::new(pool)))
}

async fn run_scheduler(runner: Arc<JobRunner>, tick_secs: u64) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!(tick_secs, "scheduler started");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Long runs must not block later ticks; overlapping triggers are dropped by the runner.
                let runner = runner.clone();
                tokio::spawn(async move {
                    for (job, outcome) in runner.tick().await {
                        log_outcome(job, &outcome);
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received; scheduler stopping");
                return Ok(());
            }
        }
    }
}

fn log_outcome(job: JobKind, outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::NotTradingDay
        | TriggerOutcome::NotDue
        | TriggerOutcome::AlreadyCompleted
        | TriggerOutcome::AlreadyAttempted
        | TriggerOutcome::WaitingOnUpstream { .. } => {
            tracing::debug!(job = job.as_str(), ?outcome, "no run");
        }
        TriggerOutcome::Dropped => {}
        TriggerOutcome::Completed { report } | TriggerOutcome::PartialFailure { report } => {
            tracing::info!(job = job.as_str(), failures = report.failures, summary = %report.summary, "job run");
        }
        TriggerOutcome::Failed { error } => {
            tracing::error!(job = job.as_str(), %error, "job run failed");
        }
    }
}

fn finish(job: JobKind, outcome: TriggerOutcome) -> anyhow::Result<()> {
    log_outcome(job, &outcome);
    match outcome {
        TriggerOutcome::Failed { error } => {
            let err = anyhow::anyhow!("{} failed: {error}", job.as_str());
            sentry_anyhow::capture_anyhow(&err);
            Err(err)
        }
        TriggerOutcome::Dropped => anyhow::bail!("{} is already running", job.as_str()),
        _ => Ok(()),
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
