use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockpulse_core::config::Settings;
use stockpulse_core::domain::{AnalystScore, AnalystSnapshot, ConsensusSnapshot, HistoryPeriod};
use stockpulse_core::ingest::HttpJsonProvider;
use stockpulse_core::pipeline::queries::{PredictionSummary, ScorecardEntry};
use stockpulse_core::pipeline::{queries, JobRunner, ManualOutcome, Pipeline, ScoreConfig};
use stockpulse_core::storage::{PgRepository, Repository};
use stockpulse_core::time::{Clock, MarketCalendar, SystemClock};

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

    let repo: Option<Arc<dyn Repository>> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match stockpulse_core::storage::migrate(&pool).await {
                Ok(()) => Some(Arc::new(PgRepository::new(pool)) as Arc<dyn Repository>),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let calendar = MarketCalendar::from_settings(&settings);
    let runner = repo
        .clone()
        .and_then(|repo| build_runner(repo, clock.clone(), &settings));

    let state = AppState {
        repo,
        runner,
        calendar,
        clock,
        score_cfg: ScoreConfig {
            min_resolved: settings.min_resolved_for_score,
        },
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/tickers/:ticker/consensus", get(get_consensus_history))
        .route("/tickers/:ticker/firms/:firm/history", get(get_firm_history))
        .route("/tickers/:ticker/scorecard", get(get_scorecard))
        .route("/tickers/:ticker/summary", get(get_summary))
        .route("/tickers/:ticker/snapshot", post(post_manual_snapshot))
        .route("/analysts/top", get(get_top_analysts))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Manual snapshots need the data provider; without it the API stays read-only.
fn build_runner(
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    settings: &Settings,
) -> Option<Arc<JobRunner>> {
    let provider = match HttpJsonProvider::from_settings(settings) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::warn!(error = %e, "data provider not configured; manual snapshots disabled");
            return None;
        }
    };
    let pipeline = Arc::new(Pipeline::new(repo, provider, clock.clone(), settings));
    Some(Arc::new(JobRunner::new(
        pipeline.clone(),
        pipeline.calendar().clone(),
        clock,
        settings,
    )))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    repo: Option<Arc<dyn Repository>>,
    runner: Option<Arc<JobRunner>>,
    calendar: MarketCalendar,
    clock: Arc<dyn Clock>,
    score_cfg: ScoreConfig,
}

impl AppState {
    fn repo(&self) -> Result<&dyn Repository, StatusCode> {
        self.repo.as_deref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %e, "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Debug, Deserialize)]
struct ConsensusParams {
    period: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConsensusHistory {
    ticker: String,
    period: HistoryPeriod,
    snapshots: Vec<ConsensusSnapshot>,
}

async fn get_consensus_history(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    Query(params): Query<ConsensusParams>,
) -> Result<Json<ConsensusHistory>, StatusCode> {
    let repo = state.repo()?;
    let period = match params.period.as_deref() {
        Some(p) => HistoryPeriod::parse(p).map_err(|_| StatusCode::BAD_REQUEST)?,
        None => HistoryPeriod::OneYear,
    };

    let today = state.calendar.market_date(state.clock.now());
    let snapshots = queries::consensus_history(repo, &ticker, period, today)
        .await
        .map_err(internal_error)?;

    Ok(Json(ConsensusHistory {
        ticker: ticker.trim().to_uppercase(),
        period,
        snapshots,
    }))
}

async fn get_firm_history(
    State(state): State<AppState>,
    Path((ticker, firm)): Path<(String, String)>,
) -> Result<Json<Vec<AnalystSnapshot>>, StatusCode> {
    let repo = state.repo()?;
    if firm.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let rows = queries::firm_history(repo, &ticker, &firm)
        .await
        .map_err(internal_error)?;
    if rows.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct TopParams {
    limit: Option<usize>,
    /// Scores on one ticker instead of firm-wide.
    ticker: Option<String>,
}

async fn get_top_analysts(
    State(state): State<AppState>,
    Query(params): Query<TopParams>,
) -> Result<Json<Vec<AnalystScore>>, StatusCode> {
    let repo = state.repo()?;
    let limit = params.limit.unwrap_or(queries::DEFAULT_TOP_LIMIT);

    let ticker = params.ticker.as_deref().filter(|t| !t.trim().is_empty());

    let scores = queries::top_analysts(repo, ticker, limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(scores))
}

async fn get_scorecard(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<Vec<ScorecardEntry>>, StatusCode> {
    let repo = state.repo()?;
    if ticker.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let card = queries::analyst_scorecard(repo, &ticker, state.score_cfg, state.clock.now())
        .await
        .map_err(internal_error)?;
    Ok(Json(card))
}

async fn get_summary(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<PredictionSummary>, StatusCode> {
    let repo = state.repo()?;
    if ticker.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let today = state.calendar.market_date(state.clock.now());
    let summary = queries::prediction_summary(repo, &ticker, today)
        .await
        .map_err(internal_error)?;
    Ok(Json(summary))
}

async fn post_manual_snapshot(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<(StatusCode, Json<ManualOutcome>), StatusCode> {
    let Some(runner) = &state.runner else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    if ticker.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let outcome = runner.manual_snapshot(&ticker).await.map_err(internal_error)?;
    let status = match outcome {
        ManualOutcome::Accepted { .. } => StatusCode::OK,
        ManualOutcome::Debounced { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)))
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
