//! The daily prediction pipeline: snapshot, evaluate, recompute.

pub mod evaluation;
pub mod queries;
pub mod scheduler;
pub mod scoring;
pub mod snapshot;

use crate::cache::{CacheTtls, ProviderCache};
use crate::config::Settings;
use crate::domain::{AnalystScore, AnalystSnapshot, ConsensusSnapshot, HistoryPeriod};
use crate::ingest::Provider;
use crate::storage::{JobRunRecord, Repository};
use crate::time::{Clock, MarketCalendar};
use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

pub use evaluation::{compute_outcome, EvaluationRunResult, EvaluationService, ExpiryPolicy};
pub use scheduler::{JobKind, JobRunner, JobState, ManualOutcome, StageExecutor, StageReport, TriggerOutcome};
pub use scoring::{ScoreConfig, ScoringRunResult, ScoringService};
pub use snapshot::{SnapshotRunResult, SnapshotService};

pub struct Pipeline {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    calendar: MarketCalendar,
    snapshots: SnapshotService,
    evaluation: EvaluationService,
    scoring: ScoringService,
    configured_tickers: Vec<String>,
    concurrency: usize,
    score_cfg: ScoreConfig,
}

impl Pipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        let cache = Arc::new(ProviderCache::new(
            provider,
            clock.clone(),
            CacheTtls::from_settings(settings),
        ));
        let score_cfg = ScoreConfig {
            min_resolved: settings.min_resolved_for_score,
        };
        Self {
            snapshots: SnapshotService::new(
                repo.clone(),
                cache.clone(),
                Duration::days(settings.prediction_horizon_days),
            ),
            evaluation: EvaluationService::new(
                repo.clone(),
                cache,
                clock.clone(),
                settings.success_threshold,
                ExpiryPolicy::from_settings(settings),
            ),
            scoring: ScoringService::new(repo.clone(), clock.clone(), score_cfg),
            calendar: MarketCalendar::from_settings(settings),
            configured_tickers: settings.tracked_tickers.clone(),
            concurrency: settings.pipeline_concurrency.max(1),
            score_cfg,
            repo,
            clock,
        }
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    pub fn market_date(&self) -> NaiveDate {
        self.calendar.market_date(self.clock.now())
    }

    /// Stored tracked tickers plus TRACKED_TICKERS, uppercased and sorted.
    pub async fn tracked_tickers(&self) -> anyhow::Result<Vec<String>> {
        let stored = self
            .repo
            .tracked_tickers()
            .await
            .context("load tracked tickers")?;
        let all: BTreeSet<String> = stored
            .iter()
            .chain(self.configured_tickers.iter())
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();
        Ok(all.into_iter().collect())
    }

    /// Snapshots one ticker, or every tracked ticker, for today's market date.
    pub async fn snapshot(&self, ticker: Option<&str>) -> anyhow::Result<SnapshotRunResult> {
        let tickers = match ticker {
            Some(t) => vec![t.to_string()],
            None => self.tracked_tickers().await?,
        };
        Ok(self.snapshot_on(&tickers, self.market_date()).await)
    }

    pub async fn snapshot_on(&self, tickers: &[String], snapshot_date: NaiveDate) -> SnapshotRunResult {
        self.snapshots
            .capture_all(tickers, snapshot_date, self.concurrency)
            .await
    }

    pub async fn evaluate(&self) -> EvaluationRunResult {
        self.evaluate_as_of(self.market_date()).await
    }

    pub async fn evaluate_as_of(&self, as_of: NaiveDate) -> EvaluationRunResult {
        self.evaluation.evaluate_due(as_of, self.concurrency).await
    }

    pub async fn recompute(&self) -> ScoringRunResult {
        self.scoring.recompute_scores().await
    }

    pub async fn consensus_history(
        &self,
        ticker: &str,
        period: HistoryPeriod,
    ) -> anyhow::Result<Vec<ConsensusSnapshot>> {
        queries::consensus_history(self.repo.as_ref(), ticker, period, self.market_date()).await
    }

    pub async fn top_analysts(&self, ticker: Option<&str>, limit: usize) -> anyhow::Result<Vec<AnalystScore>> {
        queries::top_analysts(self.repo.as_ref(), ticker, limit).await
    }

    pub async fn scorecard(&self, ticker: &str) -> anyhow::Result<Vec<queries::ScorecardEntry>> {
        queries::analyst_scorecard(self.repo.as_ref(), ticker, self.score_cfg, self.clock.now()).await
    }

    pub async fn summary(&self, ticker: &str) -> anyhow::Result<queries::PredictionSummary> {
        queries::prediction_summary(self.repo.as_ref(), ticker, self.market_date()).await
    }

    pub async fn firm_history(&self, ticker: &str, firm: &str) -> anyhow::Result<Vec<AnalystSnapshot>> {
        queries::firm_history(self.repo.as_ref(), ticker, firm).await
    }

    async fn run_stage(&self, job: JobKind, market_date: NaiveDate) -> anyhow::Result<StageReport> {
        let (summary, failures) = match job {
            JobKind::Snapshot => {
                let tickers = self.tracked_tickers().await?;
                let r = self.snapshot_on(&tickers, market_date).await;
                (serde_json::to_value(&r)?, r.errors.len())
            }
            JobKind::Evaluate => {
                let r = self.evaluate_as_of(market_date).await;
                (serde_json::to_value(&r)?, r.errors.len())
            }
            JobKind::Recompute => {
                let r = self.recompute().await;
                (serde_json::to_value(&r)?, r.errors.len())
            }
        };
        Ok(StageReport {
            job,
            market_date,
            failures,
            summary,
        })
    }

    async fn record_run(
        &self,
        job_kind: &'static str,
        as_of_date: NaiveDate,
        started_at: DateTime<Utc>,
        result: &anyhow::Result<StageReport>,
    ) {
        let (status, summary, error) = match result {
            Ok(r) if r.is_full_success() => ("ok", Some(r.summary.clone()), None),
            Ok(r) => ("partial", Some(r.summary.clone()), None),
            Err(e) => ("failed", None, Some(format!("{e:#}"))),
        };
        let record = JobRunRecord {
            job_kind,
            as_of_date,
            started_at,
            finished_at: self.clock.now(),
            status,
            summary,
            error,
        };
        if let Err(e) = self.repo.record_job_run(&record).await {
            tracing::warn!(job = job_kind, error = %e, "failed to record pipeline run");
        }
    }
}

#[async_trait::async_trait]
impl StageExecutor for Pipeline {
    async fn execute(&self, job: JobKind, market_date: NaiveDate) -> anyhow::Result<StageReport> {
        let started_at = self.clock.now();
        let result = self.run_stage(job, market_date).await;
        self.record_run(job.as_str(), market_date, started_at, &result).await;
        result
    }

    async fn snapshot_ticker(&self, ticker: &str, market_date: NaiveDate) -> anyhow::Result<StageReport> {
        let started_at = self.clock.now();
        let r = self.snapshot_on(&[ticker.to_string()], market_date).await;
        let result = serde_json::to_value(&r)
            .map(|summary| StageReport {
                job: JobKind::Snapshot,
                market_date,
                failures: r.errors.len(),
                summary,
            })
            .map_err(anyhow::Error::from);
        self.record_run("manual_snapshot", market_date, started_at, &result).await;
        result
    }

    async fn snapshot_exists(&self, ticker: &str, market_date: NaiveDate) -> anyhow::Result<bool> {
        self.repo.has_analyst_snapshots(ticker, market_date).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::Pipeline;
    use crate::cache::testing::ScriptedProvider;
    use crate::config::Settings;
    use crate::domain::{AnalystSnapshot, ConsensusSnapshot, PredictionStatus, RatingAction};
    use crate::ingest::types::{ConsensusFigures, ProviderData, Quote, RawRating};
    use crate::storage::InMemoryRepository;
    use crate::time::clock::ManualClock;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use std::sync::Arc;

    pub struct Fixture {
        pub repo: Arc<InMemoryRepository>,
        pub provider: Arc<ScriptedProvider>,
        pub clock: Arc<ManualClock>,
        pub pipeline: Arc<Pipeline>,
    }

    impl Fixture {
        pub fn new<const N: usize>(tickers: [&str; N]) -> Self {
            Self::with_settings(tickers, |_| {})
        }

        pub fn with_settings<const N: usize>(tickers: [&str; N], tweak: impl FnOnce(&mut Settings)) -> Self {
            let mut settings = Settings::default();
            tweak(&mut settings);
            let repo = Arc::new(InMemoryRepository::with_tracked(tickers));
            let provider = Arc::new(ScriptedProvider::new());
            // Monday 2026-01-05 18:05 New York.
            let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 23, 5, 0).unwrap()));
            let pipeline = Arc::new(Pipeline::new(repo.clone(), provider.clone(), clock.clone(), &settings));
            Self {
                repo,
                provider,
                clock,
                pipeline,
            }
        }
    }

    pub fn rating(firm: &str, target: Option<f64>) -> RawRating {
        RawRating {
            firm: Some(firm.to_string()),
            action: Some("main".to_string()),
            rating: Some("Buy".to_string()),
            price_target: target,
        }
    }

    pub fn ratings(rows: Vec<RawRating>) -> ProviderData {
        ProviderData::Ratings(rows)
    }

    pub fn quote(price: f64) -> ProviderData {
        ProviderData::Quote(Quote {
            price: Some(price),
            as_of: None,
        })
    }

    pub fn quote_dated(price: f64, as_of: NaiveDate) -> ProviderData {
        ProviderData::Quote(Quote {
            price: Some(price),
            as_of: Some(as_of),
        })
    }

    pub fn consensus(mean: f64, count: i32) -> ProviderData {
        ProviderData::Consensus(ConsensusFigures {
            mean: Some(mean),
            analyst_count: Some(count),
            ..ConsensusFigures::default()
        })
    }

    pub fn pending(
        firm: &str,
        ticker: &str,
        snapshot_date: NaiveDate,
        price_target: f64,
        capture_price: f64,
    ) -> AnalystSnapshot {
        AnalystSnapshot {
            firm: firm.to_string(),
            ticker: ticker.to_string(),
            action: RatingAction::Reiterate,
            rating: "Buy".to_string(),
            price_target,
            capture_price,
            implied_return: (price_target - capture_price) / capture_price,
            snapshot_date,
            resolve_date: snapshot_date + Duration::days(365),
            status: PredictionStatus::Pending,
            source: "scripted".to_string(),
            eval_attempts: 0,
            realized_price: None,
            error: None,
            success: None,
            directional_correct: None,
            resolved_at: None,
        }
    }

    pub fn consensus_row(
        ticker: &str,
        snapshot_date: NaiveDate,
        mean_target: f64,
        capture_price: Option<f64>,
    ) -> ConsensusSnapshot {
        ConsensusSnapshot {
            ticker: ticker.to_string(),
            snapshot_date,
            mean_target,
            contributor_count: 3,
            target_low: mean_target - 10.0,
            target_high: mean_target + 10.0,
            capture_price,
            provider_mean_target: None,
            provider_analyst_count: None,
            resolve_date: snapshot_date + Duration::days(365),
            realized_price: None,
            directional_correct: None,
            resolved_at: None,
        }
    }

    pub fn resolved(
        firm: &str,
        ticker: &str,
        snapshot_date: NaiveDate,
        success: bool,
        directional_correct: bool,
        error: f64,
    ) -> AnalystSnapshot {
        AnalystSnapshot {
            status: PredictionStatus::Resolved,
            realized_price: Some(100.0),
            error: Some(error),
            success: Some(success),
            directional_correct: Some(directional_correct),
            resolved_at: Some(Utc.with_ymd_and_hms(2026, 1, 5, 23, 30, 0).unwrap()),
            ..pending(firm, ticker, snapshot_date, 110.0, 100.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{quote, rating, ratings, Fixture};
    use super::*;
    use crate::ingest::types::{FetchKey, ProviderKind};

    #[tokio::test]
    async fn tracked_tickers_merge_stored_and_configured() {
        let fx = Fixture::with_settings(["msft", "AAPL"], |s| {
            s.tracked_tickers = vec!["aapl".into(), "NVDA".into()];
        });
        assert_eq!(fx.pipeline.tracked_tickers().await.unwrap(), vec!["AAPL", "MSFT", "NVDA"]);
    }

    #[tokio::test]
    async fn scheduled_stage_records_a_job_run() {
        let fx = Fixture::new(["AAPL"]);
        let key = FetchKey::current("AAPL");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![rating("Citi", Some(150.0))])),
        );
        fx.provider.push(ProviderKind::Quote, key, Ok(quote(140.0)));

        let date = fx.pipeline.market_date();
        let report = fx.pipeline.execute(JobKind::Snapshot, date).await.unwrap();
        assert!(report.is_full_success());
        assert_eq!(report.summary["rows_written"], 1);

        let runs = fx.repo.job_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_kind, "snapshot");
        assert_eq!(runs[0].status, "ok");
        assert_eq!(runs[0].as_of_date, date);
    }

    #[tokio::test]
    async fn facade_uses_the_market_date() {
        let fx = Fixture::new(["MSFT"]);
        let key = FetchKey::current("AAPL");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![rating("Citi", Some(150.0))])),
        );
        fx.provider.push(ProviderKind::Quote, key, Ok(quote(140.0)));

        let res = fx.pipeline.snapshot(Some("aapl")).await.unwrap();
        assert_eq!(res.tickers_processed, 1);
        assert_eq!(res.rows_written, 1);

        let today = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert_eq!(fx.pipeline.market_date(), today);
        assert!(fx.repo.has_analyst_snapshots("AAPL", today).await.unwrap());

        // Due a year out, so nothing resolves today.
        let eval = fx.pipeline.evaluate().await;
        assert_eq!(eval.checked, 0);
    }

    #[tokio::test]
    async fn end_to_end_through_the_runner() {
        let fx = Fixture::new(["AAPL"]);
        let key = FetchKey::current("AAPL");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![rating("Citi", Some(150.0))])),
        );
        fx.provider.push(ProviderKind::Quote, key, Ok(quote(140.0)));

        let settings = Settings::default();
        let runner = JobRunner::new(
            fx.pipeline.clone(),
            MarketCalendar::from_settings(&settings),
            fx.clock.clone(),
            &settings,
        );

        // 18:05 New York: only the snapshot window is open.
        let outcomes = runner.tick().await;
        assert!(matches!(outcomes[0], (JobKind::Snapshot, TriggerOutcome::Completed { .. })));
        assert!(matches!(outcomes[1], (JobKind::Evaluate, TriggerOutcome::NotDue)));
        assert!(matches!(outcomes[2], (JobKind::Recompute, TriggerOutcome::NotDue)));

        // The scheduled run already stored today's rows.
        assert!(matches!(
            runner.manual_snapshot("AAPL").await.unwrap(),
            ManualOutcome::Debounced { .. }
        ));

        fx.clock.advance(Duration::hours(1));
        let outcomes = runner.tick().await;
        assert!(matches!(outcomes[0].1, TriggerOutcome::AlreadyCompleted));
        assert!(matches!(outcomes[1].1, TriggerOutcome::Completed { .. }));
        assert!(matches!(outcomes[2].1, TriggerOutcome::Completed { .. }));
        assert_eq!(fx.repo.job_runs().await.len(), 3);
    }
}
