//! Read paths shared by the worker and the HTTP API.

use crate::domain::{firm_key, AnalystScore, AnalystSnapshot, ConsensusSnapshot, HistoryPeriod, PredictionStatus};
use crate::pipeline::scoring::{score_firm, ScoreConfig};
use crate::storage::Repository;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_TOP_LIMIT: usize = 20;
pub const MAX_TOP_LIMIT: usize = 100;

fn normalize_ticker(ticker: &str) -> anyhow::Result<String> {
    let t = ticker.trim().to_uppercase();
    anyhow::ensure!(!t.is_empty(), "ticker is required");
    Ok(t)
}

/// Consensus rows for `ticker` within `period` of `today`, oldest first.
pub async fn consensus_history(
    repo: &dyn Repository,
    ticker: &str,
    period: HistoryPeriod,
    today: NaiveDate,
) -> anyhow::Result<Vec<ConsensusSnapshot>> {
    let ticker = normalize_ticker(ticker)?;
    repo.consensus_history(&ticker, period.since(today)).await
}

/// Best firms by composite score, firm-wide or on one ticker; unscored firms trail.
pub async fn top_analysts(
    repo: &dyn Repository,
    ticker: Option<&str>,
    limit: usize,
) -> anyhow::Result<Vec<AnalystScore>> {
    let ticker = ticker.map(normalize_ticker).transpose()?;
    repo.top_scores(ticker.as_deref(), limit.clamp(1, MAX_TOP_LIMIT))
        .await
}

#[derive(Debug, Clone, Serialize)]
pub struct ScorecardEntry {
    pub firm: String,
    pub total_predictions: usize,
    /// Fewer resolved predictions than the scoring minimum; metrics are null.
    pub insufficient: bool,
    pub latest_rating: String,
    pub latest_target: f64,
    pub score: AnalystScore,
}

/// Every firm that covered `ticker`, scored live from its predictions.
/// Scored firms first by composite descending, then by firm.
pub async fn analyst_scorecard(
    repo: &dyn Repository,
    ticker: &str,
    cfg: ScoreConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<ScorecardEntry>> {
    let ticker = normalize_ticker(ticker)?;
    let rows = repo.ticker_snapshots(&ticker).await?;

    let mut by_firm: BTreeMap<String, Vec<&AnalystSnapshot>> = BTreeMap::new();
    for row in &rows {
        by_firm.entry(firm_key(&row.firm)).or_default().push(row);
    }

    let mut entries: Vec<ScorecardEntry> = by_firm
        .values()
        .filter_map(|records| {
            let latest = records
                .iter()
                .copied()
                .max_by(|a, b| a.snapshot_date.cmp(&b.snapshot_date))?;
            let score = score_firm(&latest.firm, Some(ticker.as_str()), records, cfg, now);
            Some(ScorecardEntry {
                firm: latest.firm.clone(),
                total_predictions: records.len(),
                insufficient: score.composite_score.is_none(),
                latest_rating: latest.rating.clone(),
                latest_target: latest.price_target,
                score,
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        a.insufficient
            .cmp(&b.insufficient)
            .then_with(|| {
                let (x, y) = (a.score.composite_score.unwrap_or(0.0), b.score.composite_score.unwrap_or(0.0));
                y.total_cmp(&x)
            })
            .then_with(|| a.firm.cmp(&b.firm))
    });
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionSummary {
    pub ticker: String,
    /// Pending predictions whose resolve date has not passed.
    pub active: usize,
    pub resolved: usize,
    pub expired: usize,
    /// Share of resolved consensus rows whose mean target called the direction.
    pub consensus_accuracy: Option<f64>,
    pub latest_consensus_target: Option<f64>,
}

pub async fn prediction_summary(
    repo: &dyn Repository,
    ticker: &str,
    today: NaiveDate,
) -> anyhow::Result<PredictionSummary> {
    let ticker = normalize_ticker(ticker)?;
    let rows = repo.ticker_snapshots(&ticker).await?;
    let consensus = repo.consensus_history(&ticker, None).await?;

    let mut summary = PredictionSummary {
        ticker,
        active: 0,
        resolved: 0,
        expired: 0,
        consensus_accuracy: None,
        latest_consensus_target: consensus.last().map(|c| c.mean_target),
    };
    for row in &rows {
        match row.status {
            PredictionStatus::Pending if row.resolve_date >= today => summary.active += 1,
            PredictionStatus::Pending => {}
            PredictionStatus::Resolved => summary.resolved += 1,
            PredictionStatus::Expired => summary.expired += 1,
        }
    }

    let called: Vec<bool> = consensus.iter().filter_map(|c| c.directional_correct).collect();
    if !called.is_empty() {
        let hits = called.iter().filter(|&&c| c).count();
        summary.consensus_accuracy = Some(hits as f64 / called.len() as f64);
    }
    Ok(summary)
}

pub async fn firm_history(
    repo: &dyn Repository,
    ticker: &str,
    firm: &str,
) -> anyhow::Result<Vec<AnalystSnapshot>> {
    let ticker = normalize_ticker(ticker)?;
    let firm = firm.trim();
    anyhow::ensure!(!firm.is_empty(), "firm is required");
    repo.firm_history(&ticker, firm).await
}
