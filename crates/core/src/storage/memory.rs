use crate::domain::{
    firm_key, AnalystScore, AnalystSnapshot, ConsensusSnapshot, Outcome, PredictionStatus,
    SnapshotKey,
};
use crate::storage::{JobRunRecord, Repository};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local repository. Backs `--dry-run` and the pipeline tests.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    tracked: BTreeSet<String>,
    analyst: BTreeMap<SnapshotKey, AnalystSnapshot>,
    consensus: BTreeMap<(String, NaiveDate), ConsensusSnapshot>,
    /// (firm_key, ticker or "" for firm-wide)
    scores: BTreeMap<(String, String), AnalystScore>,
    runs: Vec<(Uuid, JobRunRecord)>,
    failing_firms: HashSet<String>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracked<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tracked = tickers
            .into_iter()
            .map(|t| t.as_ref().trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            state: Mutex::new(State {
                tracked,
                ..State::default()
            }),
        }
    }

    pub async fn insert_analyst_snapshot(&self, snapshot: AnalystSnapshot) {
        self.state.lock().await.analyst.insert(snapshot.key(), snapshot);
    }

    pub async fn analyst_snapshots(&self) -> Vec<AnalystSnapshot> {
        self.state.lock().await.analyst.values().cloned().collect()
    }

    pub async fn job_runs(&self) -> Vec<JobRunRecord> {
        self.state.lock().await.runs.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Makes every analyst upsert for `firm` fail.
    #[cfg(test)]
    pub(crate) async fn fail_writes_for_firm(&self, firm: &str) {
        self.state.lock().await.failing_firms.insert(firm.to_string());
    }
}

#[async_trait::async_trait]
impl Repository for InMemoryRepository {
    async fn tracked_tickers(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.state.lock().await.tracked.iter().cloned().collect())
    }

    async fn has_analyst_snapshots(&self, ticker: &str, snapshot_date: NaiveDate) -> anyhow::Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .analyst
            .values()
            .any(|s| s.ticker == ticker && s.snapshot_date == snapshot_date))
    }

    async fn upsert_analyst_snapshot(&self, snapshot: &AnalystSnapshot) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_firms.contains(&snapshot.firm) {
            anyhow::bail!("upsert analyst_snapshots failed ({})", snapshot.key());
        }

        let key = snapshot.key();
        let eval_attempts = match state.analyst.get(&key) {
            Some(existing) if existing.status.is_terminal() => return Ok(()),
            Some(existing) => existing.eval_attempts,
            None => 0,
        };
        state.analyst.insert(
            key,
            AnalystSnapshot {
                status: PredictionStatus::Pending,
                eval_attempts,
                ..snapshot.clone()
            },
        );
        Ok(())
    }

    async fn upsert_consensus_snapshot(&self, snapshot: &ConsensusSnapshot) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let key = (snapshot.ticker.clone(), snapshot.snapshot_date);
        if state.consensus.get(&key).is_some_and(ConsensusSnapshot::is_resolved) {
            return Ok(());
        }
        state.consensus.insert(
            key,
            ConsensusSnapshot {
                realized_price: None,
                directional_correct: None,
                resolved_at: None,
                ..snapshot.clone()
            },
        );
        Ok(())
    }

    async fn list_due_pending(&self, as_of: NaiveDate) -> anyhow::Result<Vec<AnalystSnapshot>> {
        let mut rows: Vec<AnalystSnapshot> = self
            .state
            .lock()
            .await
            .analyst
            .values()
            .filter(|s| s.status == PredictionStatus::Pending && s.resolve_date <= as_of)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.resolve_date, &a.ticker, &a.firm, a.snapshot_date)
                .cmp(&(b.resolve_date, &b.ticker, &b.firm, b.snapshot_date))
        });
        Ok(rows)
    }

    async fn resolve_snapshot(
        &self,
        key: &SnapshotKey,
        outcome: &Outcome,
        resolved_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        match state.analyst.get_mut(key) {
            Some(row) if row.status == PredictionStatus::Pending => {
                row.apply_outcome(outcome, resolved_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_evaluation_miss(&self, key: &SnapshotKey) -> anyhow::Result<i32> {
        let mut state = self.state.lock().await;
        match state.analyst.get_mut(key) {
            Some(row) if row.status == PredictionStatus::Pending => {
                row.eval_attempts += 1;
                Ok(row.eval_attempts)
            }
            _ => anyhow::bail!("no pending analyst snapshot for {key}"),
        }
    }

    async fn expire_snapshot(&self, key: &SnapshotKey) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        match state.analyst.get_mut(key) {
            Some(row) if row.status == PredictionStatus::Pending => {
                row.status = PredictionStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_resolved(&self) -> anyhow::Result<Vec<AnalystSnapshot>> {
        let mut rows: Vec<AnalystSnapshot> = self
            .state
            .lock()
            .await
            .analyst
            .values()
            .filter(|s| s.status == PredictionStatus::Resolved)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (&a.firm, &a.ticker, a.snapshot_date).cmp(&(&b.firm, &b.ticker, b.snapshot_date))
        });
        Ok(rows)
    }

    async fn list_due_consensus(&self, as_of: NaiveDate) -> anyhow::Result<Vec<ConsensusSnapshot>> {
        let mut rows: Vec<ConsensusSnapshot> = self
            .state
            .lock()
            .await
            .consensus
            .values()
            .filter(|c| !c.is_resolved() && c.resolve_date <= as_of)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.resolve_date, &a.ticker, a.snapshot_date).cmp(&(b.resolve_date, &b.ticker, b.snapshot_date))
        });
        Ok(rows)
    }

    async fn resolve_consensus(
        &self,
        ticker: &str,
        snapshot_date: NaiveDate,
        realized_price: f64,
        directional_correct: Option<bool>,
        resolved_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        match state.consensus.get_mut(&(ticker.to_string(), snapshot_date)) {
            Some(row) if !row.is_resolved() => {
                row.realized_price = Some(realized_price);
                row.directional_correct = directional_correct;
                row.resolved_at = Some(resolved_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_score(&self, score: &AnalystScore) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let key = (firm_key(&score.firm), score.ticker.clone().unwrap_or_default());
        if let Some(existing) = state.scores.get(&key) {
            if existing.same_metrics(score) {
                return Ok(false);
            }
        }
        state.scores.insert(key, score.clone());
        Ok(true)
    }

    async fn consensus_history(
        &self,
        ticker: &str,
        since: Option<NaiveDate>,
    ) -> anyhow::Result<Vec<ConsensusSnapshot>> {
        // BTreeMap order is (ticker, date) ascending.
        Ok(self
            .state
            .lock()
            .await
            .consensus
            .values()
            .filter(|c| c.ticker == ticker)
            .filter(|c| since.map_or(true, |s| c.snapshot_date >= s))
            .cloned()
            .collect())
    }

    async fn top_scores(&self, ticker: Option<&str>, limit: usize) -> anyhow::Result<Vec<AnalystScore>> {
        let mut rows: Vec<AnalystScore> = self
            .state
            .lock()
            .await
            .scores
            .values()
            .filter(|s| s.ticker.as_deref() == ticker)
            .cloned()
            .collect();
        rows.sort_by(|a, b| match (a.composite_score, b.composite_score) {
            (Some(x), Some(y)) => y.total_cmp(&x).then_with(|| a.firm.cmp(&b.firm)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.firm.cmp(&b.firm),
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn ticker_snapshots(&self, ticker: &str) -> anyhow::Result<Vec<AnalystSnapshot>> {
        let mut rows: Vec<AnalystSnapshot> = self
            .state
            .lock()
            .await
            .analyst
            .values()
            .filter(|s| s.ticker == ticker)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.snapshot_date.cmp(&a.snapshot_date).then_with(|| a.key().cmp(&b.key())));
        Ok(rows)
    }

    async fn firm_history(&self, ticker: &str, firm: &str) -> anyhow::Result<Vec<AnalystSnapshot>> {
        let firm = firm_key(firm);
        let mut rows: Vec<AnalystSnapshot> = self
            .state
            .lock()
            .await
            .analyst
            .values()
            .filter(|s| s.ticker == ticker && firm_key(&s.firm) == firm)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.snapshot_date.cmp(&a.snapshot_date));
        Ok(rows)
    }

    async fn record_job_run(&self, run: &JobRunRecord) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.state.lock().await.runs.push((id, run.clone()));
        Ok(id)
    }
}
