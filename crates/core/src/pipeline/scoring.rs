use crate::domain::{firm_key, AnalystScore, AnalystSnapshot};
use crate::error::{ItemFailure, PipelineError};
use crate::storage::Repository;
use crate::time::Clock;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

const W_SUCCESS: f64 = 0.4;
const W_DIRECTION: f64 = 0.3;
const W_ACCURACY: f64 = 0.3;

#[derive(Debug, Clone, Copy)]
pub struct ScoreConfig {
    /// Firms with fewer resolved predictions get null metrics.
    pub min_resolved: usize,
}

pub fn composite_score(success_rate: f64, directional_rate: f64, mean_abs_error: f64) -> f64 {
    (W_SUCCESS * success_rate + W_DIRECTION * directional_rate + W_ACCURACY * (1.0 - mean_abs_error))
        .clamp(0.0, 1.0)
}

/// Aggregates one firm's resolved predictions, firm-wide when `ticker` is None.
/// Rows without a complete outcome are ignored.
pub fn score_firm(
    firm: &str,
    ticker: Option<&str>,
    rows: &[&AnalystSnapshot],
    cfg: ScoreConfig,
    now: DateTime<Utc>,
) -> AnalystScore {
    let mut judged: Vec<Judged<'_>> = rows
        .iter()
        .filter_map(|r| {
            Some(Judged {
                ticker: r.ticker.as_str(),
                snapshot_date: r.snapshot_date,
                success: r.success?,
                directional: r.directional_correct?,
                abs_error: r.error?.abs(),
            })
        })
        .collect();
    // Fixed summation order keeps recomputes bit-identical.
    judged.sort_by(|a, b| (a.ticker, a.snapshot_date).cmp(&(b.ticker, b.snapshot_date)));

    let n = judged.len();
    let mut score = AnalystScore {
        firm: firm.to_string(),
        ticker: ticker.map(str::to_string),
        resolved_count: i32::try_from(n).unwrap_or(i32::MAX),
        success_rate: None,
        directional_rate: None,
        mean_abs_error: None,
        composite_score: None,
        best_call_ticker: None,
        worst_call_ticker: None,
        last_recomputed_at: now,
    };
    if n == 0 || n < cfg.min_resolved {
        return score;
    }

    let total = n as f64;
    let successes = judged.iter().filter(|j| j.success).count() as f64;
    let directional = judged.iter().filter(|j| j.directional).count() as f64;
    let abs_error_sum: f64 = judged.iter().map(|j| j.abs_error).sum();

    let success_rate = successes / total;
    let directional_rate = directional / total;
    let mean_abs_error = abs_error_sum / total;

    // Ties go to the earlier (ticker, date), which the sort above already fixed.
    let best = judged.iter().min_by(|a, b| a.abs_error.total_cmp(&b.abs_error));
    let worst = judged.iter().rev().max_by(|a, b| a.abs_error.total_cmp(&b.abs_error));

    score.success_rate = Some(success_rate);
    score.directional_rate = Some(directional_rate);
    score.mean_abs_error = Some(mean_abs_error);
    score.composite_score = Some(composite_score(success_rate, directional_rate, mean_abs_error));
    score.best_call_ticker = best.map(|j| j.ticker.to_string());
    score.worst_call_ticker = worst.map(|j| j.ticker.to_string());
    score
}

struct Judged<'a> {
    ticker: &'a str,
    snapshot_date: NaiveDate,
    success: bool,
    directional: bool,
    abs_error: f64,
}

/// Display name for a firm: the spelling on its most recent row.
fn display_name<'a>(rows: &[&'a AnalystSnapshot]) -> &'a str {
    rows.iter()
        .copied()
        .max_by(|a, b| (a.snapshot_date, &a.ticker).cmp(&(b.snapshot_date, &b.ticker)))
        .map(|r| r.firm.as_str())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoringRunResult {
    pub firms: usize,
    pub scored: usize,
    pub ticker_scores: usize,
    pub scores_updated: usize,
    pub errors: Vec<ItemFailure>,
}

pub struct ScoringService {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    cfg: ScoreConfig,
}

impl ScoringService {
    pub fn new(repo: Arc<dyn Repository>, clock: Arc<dyn Clock>, cfg: ScoreConfig) -> Self {
        Self { repo, clock, cfg }
    }

    /// Full recompute from every resolved prediction: one firm-wide score per
    /// firm plus one score per (firm, ticker).
    pub async fn recompute_scores(&self) -> ScoringRunResult {
        let mut out = ScoringRunResult::default();
        let resolved = match self.repo.list_resolved().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "listing resolved predictions failed");
                out.errors
                    .push(ItemFailure::new("analyst_snapshots", PipelineError::from_storage(&e)));
                return out;
            }
        };

        let mut by_firm: BTreeMap<String, Vec<&AnalystSnapshot>> = BTreeMap::new();
        for row in &resolved {
            by_firm.entry(firm_key(&row.firm)).or_default().push(row);
        }

        let now = self.clock.now();
        for rows in by_firm.values() {
            let firm = display_name(rows);
            let mut by_ticker: BTreeMap<&str, Vec<&AnalystSnapshot>> = BTreeMap::new();
            for &row in rows {
                by_ticker.entry(row.ticker.as_str()).or_default().push(row);
            }

            let overall = score_firm(firm, None, rows, self.cfg, now);
            out.firms += 1;
            out.scored += usize::from(overall.composite_score.is_some());
            self.write(&overall, &mut out).await;

            for (ticker, ticker_rows) in &by_ticker {
                let score = score_firm(firm, Some(*ticker), ticker_rows, self.cfg, now);
                out.ticker_scores += 1;
                self.write(&score, &mut out).await;
            }
        }

        tracing::info!(
            firms = out.firms,
            scored = out.scored,
            ticker_scores = out.ticker_scores,
            updated = out.scores_updated,
            "score recompute finished"
        );
        out
    }

    async fn write(&self, score: &AnalystScore, out: &mut ScoringRunResult) {
        match self.repo.upsert_score(score).await {
            Ok(true) => out.scores_updated += 1,
            Ok(false) => {}
            Err(e) => {
                let subject = match &score.ticker {
                    Some(t) => format!("{}/{t}", score.firm),
                    None => score.firm.clone(),
                };
                tracing::error!(%subject, error = %e, "score write failed");
                out.errors
                    .push(ItemFailure::new(subject, PipelineError::from_storage(&e)));
            }
        }
    }
}
