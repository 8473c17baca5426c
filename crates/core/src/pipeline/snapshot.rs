use crate::cache::{FetchStatus, ProviderCache};
use crate::domain::{
    dedupe_by_firm, AnalystSnapshot, ConsensusSnapshot, NormalizedRating, PredictionStatus,
};
use crate::error::{ItemFailure, PipelineError};
use crate::ingest::types::{FetchKey, ProviderData, ProviderKind};
use crate::storage::Repository;
use chrono::{Duration, NaiveDate};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotRunResult {
    pub tickers_processed: usize,
    pub tickers_failed: usize,
    pub rows_written: usize,
    pub records_dropped: usize,
    pub consensus_written: usize,
    pub errors: Vec<ItemFailure>,
}

/// Outcome of capturing one ticker.
#[derive(Debug, Clone, Serialize)]
pub struct TickerSnapshot {
    pub ticker: String,
    pub ratings_status: Option<FetchStatus>,
    pub rows_written: usize,
    pub records_dropped: usize,
    pub consensus_written: bool,
    /// The ticker produced nothing (ratings or price unavailable).
    pub failed: bool,
    pub errors: Vec<ItemFailure>,
}

impl TickerSnapshot {
    fn new(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            ratings_status: None,
            rows_written: 0,
            records_dropped: 0,
            consensus_written: false,
            failed: false,
            errors: Vec::new(),
        }
    }

    fn fail(mut self, error: PipelineError) -> Self {
        tracing::warn!(ticker = %self.ticker, error = %error, "snapshot failed for ticker");
        self.failed = true;
        self.errors.push(ItemFailure::new(self.ticker.clone(), error));
        self
    }
}

pub struct SnapshotService {
    repo: Arc<dyn Repository>,
    cache: Arc<ProviderCache>,
    horizon: Duration,
}

impl SnapshotService {
    pub fn new(repo: Arc<dyn Repository>, cache: Arc<ProviderCache>, horizon: Duration) -> Self {
        Self {
            repo,
            cache,
            horizon,
        }
    }

    pub async fn capture_all(
        &self,
        tickers: &[String],
        snapshot_date: NaiveDate,
        concurrency: usize,
    ) -> SnapshotRunResult {
        // Owned tickers keep the mapped futures free of a borrowed-argument lifetime.
        let per_ticker: Vec<TickerSnapshot> = futures::stream::iter(tickers.to_vec())
            .map(|ticker| async move { self.capture_snapshot(&ticker, snapshot_date).await })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut out = SnapshotRunResult::default();
        for t in per_ticker {
            out.tickers_processed += 1;
            out.tickers_failed += usize::from(t.failed);
            out.rows_written += t.rows_written;
            out.records_dropped += t.records_dropped;
            out.consensus_written += usize::from(t.consensus_written);
            out.errors.extend(t.errors);
        }
        out.errors.sort_by(|a, b| a.subject.cmp(&b.subject));

        tracing::info!(
            %snapshot_date,
            tickers = out.tickers_processed,
            failed = out.tickers_failed,
            rows_written = out.rows_written,
            dropped = out.records_dropped,
            "snapshot run finished"
        );
        out
    }

    pub async fn capture_snapshot(&self, ticker: &str, snapshot_date: NaiveDate) -> TickerSnapshot {
        let ticker = ticker.trim().to_uppercase();
        let mut out = TickerSnapshot::new(&ticker);
        if ticker.is_empty() {
            return out.fail(PipelineError::DataIncomplete("empty ticker".into()));
        }

        let key = FetchKey::current(&ticker);
        let ratings = self.cache.fetch(ProviderKind::AnalystRatings, &key).await;
        out.ratings_status = Some(ratings.status);

        let Some(rows) = ratings.usable().and_then(ProviderData::ratings) else {
            let error = match ratings.error.clone() {
                Some(e) => PipelineError::from(e),
                None => PipelineError::DataIncomplete("analyst ratings response had an unexpected shape".into()),
            };
            return out.fail(error);
        };
        if ratings.status == FetchStatus::Stale {
            tracing::warn!(%ticker, "using stale analyst ratings");
        }

        let mut normalized: Vec<NormalizedRating> = Vec::with_capacity(rows.len());
        for raw in rows {
            match raw.validate_and_normalize() {
                Ok(r) => normalized.push(r),
                Err(e) => {
                    out.records_dropped += 1;
                    tracing::debug!(%ticker, error = %e, "dropping rating row");
                }
            }
        }

        // Must happen before any write: (firm, ticker, snapshot_date) is unique.
        let retained = dedupe_by_firm(normalized);
        if retained.is_empty() {
            tracing::info!(%ticker, dropped = out.records_dropped, "no usable analyst ratings");
            return out;
        }

        let quote = self.cache.fetch(ProviderKind::Quote, &key).await;
        let Some(capture_price) = quote.usable().and_then(ProviderData::quote_price) else {
            let error = match quote.error.clone() {
                Some(e) => PipelineError::from(e),
                None => PipelineError::DataIncomplete(format!("no usable quote for {ticker}")),
            };
            return out.fail(error);
        };

        let resolve_date = snapshot_date + self.horizon;
        let source = self.cache.provider_name().to_string();
        for rating in &retained {
            let snapshot = AnalystSnapshot {
                firm: rating.firm.clone(),
                ticker: ticker.clone(),
                action: rating.action,
                rating: rating.rating.clone(),
                price_target: rating.price_target,
                capture_price,
                implied_return: (rating.price_target - capture_price) / capture_price,
                snapshot_date,
                resolve_date,
                status: PredictionStatus::Pending,
                source: source.clone(),
                eval_attempts: 0,
                realized_price: None,
                error: None,
                success: None,
                directional_correct: None,
                resolved_at: None,
            };

            match self.repo.upsert_analyst_snapshot(&snapshot).await {
                Ok(()) => out.rows_written += 1,
                Err(e) => {
                    tracing::error!(%ticker, firm = %rating.firm, error = %e, "analyst snapshot write failed");
                    out.errors.push(ItemFailure::new(
                        format!("{ticker}/{}", rating.firm),
                        PipelineError::from_storage(&e),
                    ));
                }
            }
        }

        let consensus = self
            .build_consensus(&ticker, snapshot_date, resolve_date, capture_price, &retained)
            .await;
        match self.repo.upsert_consensus_snapshot(&consensus).await {
            Ok(()) => out.consensus_written = true,
            Err(e) => {
                tracing::error!(%ticker, error = %e, "consensus snapshot write failed");
                out.errors.push(ItemFailure::new(
                    format!("{ticker}/consensus"),
                    PipelineError::from_storage(&e),
                ));
            }
        }

        tracing::debug!(%ticker, rows = out.rows_written, "ticker snapshot captured");
        out
    }

    async fn build_consensus(
        &self,
        ticker: &str,
        snapshot_date: NaiveDate,
        resolve_date: NaiveDate,
        capture_price: f64,
        retained: &[NormalizedRating],
    ) -> ConsensusSnapshot {
        let targets: Vec<f64> = retained.iter().map(|r| r.price_target).collect();
        let mean_target = targets.iter().sum::<f64>() / targets.len() as f64;
        let target_low = targets.iter().copied().fold(f64::INFINITY, f64::min);
        let target_high = targets.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let fetched = self
            .cache
            .fetch(ProviderKind::Consensus, &FetchKey::current(ticker))
            .await;
        let figures = fetched.usable().and_then(ProviderData::consensus);
        if figures.is_none() {
            tracing::warn!(%ticker, status = ?fetched.status, "provider consensus unavailable");
        }

        ConsensusSnapshot {
            ticker: ticker.to_string(),
            snapshot_date,
            mean_target,
            contributor_count: i32::try_from(retained.len()).unwrap_or(i32::MAX),
            target_low,
            target_high,
            capture_price: Some(capture_price),
            provider_mean_target: figures.and_then(|f| f.mean),
            provider_analyst_count: figures.and_then(|f| f.analyst_count),
            resolve_date,
            realized_price: None,
            directional_correct: None,
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::PredictionStatus;
    use crate::error::PipelineError;
    use crate::ingest::provider::ProviderError;
    use crate::ingest::types::{FetchKey, ProviderKind};
    use crate::pipeline::fixtures::{consensus, quote, rating, ratings, Fixture};
    use crate::storage::Repository;
    use chrono::NaiveDate;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    #[tokio::test]
    async fn duplicate_firm_rows_persist_once_with_last_target() {
        let fx = Fixture::new(["AAPL"]);
        let key = FetchKey::current("AAPL");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![
                rating("Goldman Sachs", Some(200.0)),
                rating("Morgan Stanley", Some(190.0)),
                rating("Goldman Sachs", Some(210.0)),
            ])),
        );
        fx.provider.push(ProviderKind::Quote, key.clone(), Ok(quote(180.0)));
        fx.provider.push(ProviderKind::Consensus, key, Ok(consensus(205.0, 30)));

        let res = fx.pipeline.snapshot_on(&["AAPL".to_string()], today()).await;
        assert_eq!(res.rows_written, 2);
        assert!(res.errors.is_empty());

        let rows = fx.repo.analyst_snapshots().await;
        let gs: Vec<_> = rows.iter().filter(|r| r.firm == "Goldman Sachs").collect();
        assert_eq!(gs.len(), 1);
        assert_eq!(gs[0].price_target, 210.0);
        assert_eq!(gs[0].status, PredictionStatus::Pending);
        assert_eq!(gs[0].resolve_date, NaiveDate::from_ymd_opt(2027, 1, 5).unwrap());
        assert!((gs[0].implied_return - (30.0 / 180.0)).abs() < 1e-12);

        let history = fx.repo.consensus_history("AAPL", None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].contributor_count, 2);
        assert_eq!(history[0].mean_target, 200.0);
        assert_eq!(history[0].target_low, 190.0);
        assert_eq!(history[0].target_high, 210.0);
        assert_eq!(history[0].provider_mean_target, Some(205.0));
        assert_eq!(history[0].provider_analyst_count, Some(30));
        assert_eq!(history[0].resolve_date, gs[0].resolve_date);
        assert!(!history[0].is_resolved());
    }

    #[tokio::test]
    async fn repeated_run_same_day_overwrites() {
        let fx = Fixture::new(["AAPL"]);
        let key = FetchKey::current("AAPL");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![rating("Citi", Some(150.0))])),
        );
        fx.provider.push(ProviderKind::Quote, key.clone(), Ok(quote(140.0)));

        let tickers = vec!["AAPL".to_string()];
        fx.pipeline.snapshot_on(&tickers, today()).await;
        fx.pipeline.snapshot_on(&tickers, today()).await;

        assert_eq!(fx.repo.analyst_snapshots().await.len(), 1);
        assert_eq!(fx.repo.consensus_history("AAPL", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn firm_spelling_change_on_rerun_keeps_one_row() {
        let fx = Fixture::new(["AAPL"]);
        let key = FetchKey::current("AAPL");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![rating("Goldman Sachs", Some(200.0))])),
        );
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![rating("GOLDMAN SACHS", Some(210.0))])),
        );
        fx.provider.push(ProviderKind::Quote, key.clone(), Ok(quote(180.0)));

        let tickers = vec!["AAPL".to_string()];
        fx.pipeline.snapshot_on(&tickers, today()).await;
        // Ratings TTL is an hour; let the second script entry through.
        fx.clock.advance(chrono::Duration::hours(2));
        let res = fx.pipeline.snapshot_on(&tickers, today()).await;
        assert_eq!(res.rows_written, 1);

        let rows = fx.repo.analyst_snapshots().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].firm, "GOLDMAN SACHS");
        assert_eq!(rows[0].price_target, 210.0);
        assert_eq!(fx.repo.firm_history("AAPL", "goldman sachs").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drops_incomplete_rows_without_failing() {
        let fx = Fixture::new(["AAPL"]);
        let key = FetchKey::current("AAPL");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![rating("Citi", None), rating("", Some(100.0)), rating("UBS", Some(120.0))])),
        );
        fx.provider.push(ProviderKind::Quote, key, Ok(quote(110.0)));

        let res = fx.pipeline.snapshot_on(&["AAPL".to_string()], today()).await;
        assert_eq!(res.records_dropped, 2);
        assert_eq!(res.rows_written, 1);
        assert_eq!(res.tickers_failed, 0);
    }

    #[tokio::test]
    async fn ratings_error_isolated_to_its_ticker() {
        let fx = Fixture::new(["AAPL", "MSFT"]);
        fx.provider.push(
            ProviderKind::AnalystRatings,
            FetchKey::current("AAPL"),
            Err(ProviderError::Unavailable("timeout".into())),
        );
        let msft = FetchKey::current("MSFT");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            msft.clone(),
            Ok(ratings(vec![rating("Jefferies", Some(450.0))])),
        );
        fx.provider.push(ProviderKind::Quote, msft, Ok(quote(400.0)));

        let tickers = vec!["AAPL".to_string(), "MSFT".to_string()];
        let res = fx.pipeline.snapshot_on(&tickers, today()).await;
        assert_eq!(res.tickers_processed, 2);
        assert_eq!(res.tickers_failed, 1);
        assert_eq!(res.rows_written, 1);
        assert_eq!(res.errors.len(), 1);
        assert_eq!(res.errors[0].subject, "AAPL");
        assert!(matches!(res.errors[0].error, PipelineError::ProviderUnavailable(_)));
        assert!(!fx.repo.has_analyst_snapshots("AAPL", today()).await.unwrap());
    }

    #[tokio::test]
    async fn write_failure_for_one_firm_keeps_the_rest() {
        let fx = Fixture::new(["AAPL"]);
        let key = FetchKey::current("AAPL");
        fx.provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ratings(vec![rating("Citi", Some(150.0)), rating("UBS", Some(160.0))])),
        );
        fx.provider.push(ProviderKind::Quote, key, Ok(quote(140.0)));
        fx.repo.fail_writes_for_firm("Citi").await;

        let res = fx.pipeline.snapshot_on(&["AAPL".to_string()], today()).await;
        assert_eq!(res.rows_written, 1);
        assert_eq!(res.consensus_written, 1);
        assert_eq!(res.errors.len(), 1);
        assert_eq!(res.errors[0].subject, "AAPL/Citi");
        assert!(matches!(res.errors[0].error, PipelineError::PersistenceFailure(_)));
    }

    #[tokio::test]
    async fn missing_price_fails_ticker_before_writes() {
        let fx = Fixture::new(["AAPL"]);
        fx.provider.push(
            ProviderKind::AnalystRatings,
            FetchKey::current("AAPL"),
            Ok(ratings(vec![rating("Citi", Some(150.0))])),
        );

        let res = fx.pipeline.snapshot_on(&["AAPL".to_string()], today()).await;
        assert_eq!(res.tickers_failed, 1);
        assert_eq!(res.rows_written, 0);
        assert!(fx.repo.analyst_snapshots().await.is_empty());
    }
}
