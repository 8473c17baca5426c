use crate::cache::ProviderCache;
use crate::config::Settings;
use crate::domain::{AnalystSnapshot, ConsensusSnapshot, Outcome};
use crate::error::{ItemFailure, PipelineError};
use crate::ingest::types::{FetchKey, ProviderKind};
use crate::storage::Repository;
use crate::time::Clock;
use chrono::{Duration, NaiveDate};
use futures::StreamExt;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

/// When a prediction whose realized price never shows up gets expired.
///
/// Misses only count once `as_of` is past `resolve_date + grace`; the row
/// expires when the counted misses reach `max_attempts`. Without a grace
/// window rows stay pending forever.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    pub grace: Option<Duration>,
    pub max_attempts: i32,
}

impl ExpiryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            grace: settings.expiry_grace_days.map(Duration::days),
            max_attempts: settings.expiry_max_attempts.max(1),
        }
    }

    pub fn past_grace(&self, resolve_date: NaiveDate, as_of: NaiveDate) -> bool {
        self.grace.is_some_and(|g| as_of > resolve_date + g)
    }

    pub fn exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Judges a prediction against the price observed on its resolve date.
/// `realized_price` must be positive.
pub fn compute_outcome(
    price_target: f64,
    capture_price: f64,
    realized_price: f64,
    success_threshold: f64,
) -> Outcome {
    let error = (price_target - realized_price) / realized_price;
    Outcome {
        realized_price,
        error,
        success: error.abs() < success_threshold,
        directional_correct: called_direction(price_target, capture_price, realized_price),
    }
}

/// The target and the realized price sit on the same side of the capture price.
pub fn called_direction(target: f64, capture_price: f64, realized_price: f64) -> bool {
    sign(target - capture_price) == sign(realized_price - capture_price)
}

fn sign(x: f64) -> Ordering {
    x.partial_cmp(&0.0).unwrap_or(Ordering::Equal)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationRunResult {
    pub checked: usize,
    pub resolved_count: usize,
    pub expired_count: usize,
    pub pending_count: usize,
    pub consensus_checked: usize,
    pub consensus_resolved: usize,
    pub errors: Vec<ItemFailure>,
}

enum RowOutcome {
    Resolved,
    Expired,
    Pending,
    /// Another run got to it first.
    Skipped,
    Failed(ItemFailure),
}

pub struct EvaluationService {
    repo: Arc<dyn Repository>,
    cache: Arc<ProviderCache>,
    clock: Arc<dyn Clock>,
    success_threshold: f64,
    expiry: ExpiryPolicy,
}

impl EvaluationService {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<ProviderCache>,
        clock: Arc<dyn Clock>,
        success_threshold: f64,
        expiry: ExpiryPolicy,
    ) -> Self {
        Self {
            repo,
            cache,
            clock,
            success_threshold,
            expiry,
        }
    }

    /// Resolves every pending prediction, and every unresolved consensus row,
    /// with `resolve_date <= as_of`. Both lists are read before any work starts.
    pub async fn evaluate_due(&self, as_of: NaiveDate, concurrency: usize) -> EvaluationRunResult {
        let mut out = EvaluationRunResult::default();
        let due = match self.repo.list_due_pending(as_of).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(%as_of, error = %e, "listing due predictions failed");
                out.errors
                    .push(ItemFailure::new("analyst_snapshots", PipelineError::from_storage(&e)));
                Vec::new()
            }
        };
        let due_consensus = match self.repo.list_due_consensus(as_of).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(%as_of, error = %e, "listing due consensus rows failed");
                out.errors
                    .push(ItemFailure::new("consensus_snapshots", PipelineError::from_storage(&e)));
                Vec::new()
            }
        };

        let outcomes: Vec<RowOutcome> = futures::stream::iter(due)
            .map(|row| self.evaluate_one(row, as_of))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            out.checked += 1;
            match outcome {
                RowOutcome::Resolved => out.resolved_count += 1,
                RowOutcome::Expired => out.expired_count += 1,
                RowOutcome::Pending => out.pending_count += 1,
                RowOutcome::Skipped => {}
                RowOutcome::Failed(f) => out.errors.push(f),
            }
        }

        let consensus: Vec<RowOutcome> = futures::stream::iter(due_consensus)
            .map(|row| self.evaluate_consensus(row))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for outcome in consensus {
            out.consensus_checked += 1;
            match outcome {
                RowOutcome::Resolved => out.consensus_resolved += 1,
                RowOutcome::Failed(f) => out.errors.push(f),
                RowOutcome::Expired | RowOutcome::Pending | RowOutcome::Skipped => {}
            }
        }
        out.errors.sort_by(|a, b| a.subject.cmp(&b.subject));

        tracing::info!(
            %as_of,
            checked = out.checked,
            resolved = out.resolved_count,
            expired = out.expired_count,
            pending = out.pending_count,
            consensus_resolved = out.consensus_resolved,
            failed = out.errors.len(),
            "evaluation run finished"
        );
        out
    }

    async fn realized_price(&self, ticker: &str, resolve_date: NaiveDate) -> Option<f64> {
        let fetched = self
            .cache
            .fetch(ProviderKind::Quote, &FetchKey::on(ticker, resolve_date))
            .await;
        let Some(data) = fetched.usable() else {
            tracing::debug!(%ticker, %resolve_date, error = ?fetched.error, "realized price unavailable");
            return None;
        };
        let close = data.close_on_or_after(resolve_date);
        if close.is_none() && data.quote_price().is_some() {
            tracing::warn!(%ticker, %resolve_date, "historical quote dated outside the lookahead window");
        }
        close
    }

    /// Consensus rows never expire; they wait until a price shows up.
    async fn evaluate_consensus(&self, row: ConsensusSnapshot) -> RowOutcome {
        let subject = format!("{}/consensus@{}", row.ticker, row.snapshot_date);
        let Some(realized) = self.realized_price(&row.ticker, row.resolve_date).await else {
            return RowOutcome::Pending;
        };
        let correct = row
            .capture_price
            .map(|capture| called_direction(row.mean_target, capture, realized));

        match self
            .repo
            .resolve_consensus(&row.ticker, row.snapshot_date, realized, correct, self.clock.now())
            .await
        {
            Ok(true) => {
                tracing::debug!(%subject, directional_correct = ?correct, "consensus resolved");
                RowOutcome::Resolved
            }
            Ok(false) => RowOutcome::Skipped,
            Err(e) => {
                tracing::error!(%subject, error = %e, "resolving consensus failed");
                RowOutcome::Failed(ItemFailure::new(subject, PipelineError::from_storage(&e)))
            }
        }
    }

    async fn evaluate_one(&self, row: AnalystSnapshot, as_of: NaiveDate) -> RowOutcome {
        let key = row.key();
        if let Some(realized) = self.realized_price(&row.ticker, row.resolve_date).await {
            let outcome = compute_outcome(row.price_target, row.capture_price, realized, self.success_threshold);
            return match self.repo.resolve_snapshot(&key, &outcome, self.clock.now()).await {
                Ok(true) => {
                    tracing::debug!(%key, error = outcome.error, success = outcome.success, "prediction resolved");
                    RowOutcome::Resolved
                }
                Ok(false) => RowOutcome::Skipped,
                Err(e) => {
                    tracing::error!(%key, error = %e, "resolving prediction failed");
                    RowOutcome::Failed(ItemFailure::new(key.to_string(), PipelineError::from_storage(&e)))
                }
            };
        }

        if !self.expiry.past_grace(row.resolve_date, as_of) {
            return RowOutcome::Pending;
        }

        let attempts = match self.repo.record_evaluation_miss(&key).await {
            Ok(n) => n,
            Err(e) => {
                return RowOutcome::Failed(ItemFailure::new(key.to_string(), PipelineError::from_storage(&e)));
            }
        };
        if !self.expiry.exhausted(attempts) {
            return RowOutcome::Pending;
        }

        match self.repo.expire_snapshot(&key).await {
            Ok(true) => {
                tracing::warn!(%key, attempts, "prediction expired without a realized price");
                RowOutcome::Expired
            }
            Ok(false) => RowOutcome::Skipped,
            Err(e) => RowOutcome::Failed(ItemFailure::new(key.to_string(), PipelineError::from_storage(&e))),
        }
    }
}
