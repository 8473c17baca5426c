pub mod memory;
pub mod postgres;

use crate::domain::{AnalystScore, AnalystSnapshot, ConsensusSnapshot, Outcome, SnapshotKey};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use uuid::Uuid;

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Audit row for one pipeline job invocation.
#[derive(Debug, Clone)]
pub struct JobRunRecord {
    pub job_kind: &'static str,
    pub as_of_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: &'static str,
    pub summary: Option<Value>,
    pub error: Option<String>,
}

/// Durable storage. Every write is an idempotent upsert keyed by the natural key.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    async fn tracked_tickers(&self) -> anyhow::Result<Vec<String>>;

    async fn has_analyst_snapshots(&self, ticker: &str, snapshot_date: NaiveDate) -> anyhow::Result<bool>;

    /// Overwrites the prediction fields of a still-pending row; terminal rows are left untouched.
    async fn upsert_analyst_snapshot(&self, snapshot: &AnalystSnapshot) -> anyhow::Result<()>;

    /// Resolved consensus rows are left untouched.
    async fn upsert_consensus_snapshot(&self, snapshot: &ConsensusSnapshot) -> anyhow::Result<()>;

    /// Pending rows with `resolve_date <= as_of`, ordered by resolve_date then key.
    async fn list_due_pending(&self, as_of: NaiveDate) -> anyhow::Result<Vec<AnalystSnapshot>>;

    /// pending -> resolved. Returns false when the row was no longer pending.
    async fn resolve_snapshot(
        &self,
        key: &SnapshotKey,
        outcome: &Outcome,
        resolved_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Bumps `eval_attempts` on a pending row and returns the new count.
    async fn record_evaluation_miss(&self, key: &SnapshotKey) -> anyhow::Result<i32>;

    /// pending -> expired. Returns false when the row was no longer pending.
    async fn expire_snapshot(&self, key: &SnapshotKey) -> anyhow::Result<bool>;

    async fn list_resolved(&self) -> anyhow::Result<Vec<AnalystSnapshot>>;

    /// Unresolved consensus rows with `resolve_date <= as_of`, ordered by resolve_date then ticker.
    async fn list_due_consensus(&self, as_of: NaiveDate) -> anyhow::Result<Vec<ConsensusSnapshot>>;

    /// Records the realized price on an unresolved consensus row. Returns false
    /// when the row was already resolved.
    async fn resolve_consensus(
        &self,
        ticker: &str,
        snapshot_date: NaiveDate,
        realized_price: f64,
        directional_correct: Option<bool>,
        resolved_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Writes the score only if its metrics differ from the stored row. Returns whether it wrote.
    /// Scores are keyed by (firm_key, ticker scope).
    async fn upsert_score(&self, score: &AnalystScore) -> anyhow::Result<bool>;

    /// Ascending by snapshot_date; `since` is inclusive.
    async fn consensus_history(
        &self,
        ticker: &str,
        since: Option<NaiveDate>,
    ) -> anyhow::Result<Vec<ConsensusSnapshot>>;

    /// Firm-wide scores (`ticker = None`) or one ticker's scores, ordered by
    /// composite_score descending, nulls last, then firm.
    async fn top_scores(&self, ticker: Option<&str>, limit: usize) -> anyhow::Result<Vec<AnalystScore>>;

    /// Every prediction for `ticker`, newest first.
    async fn ticker_snapshots(&self, ticker: &str) -> anyhow::Result<Vec<AnalystSnapshot>>;

    /// Newest first. `firm` is matched on its firm key.
    async fn firm_history(&self, ticker: &str, firm: &str) -> anyhow::Result<Vec<AnalystSnapshot>>;

    async fn record_job_run(&self, run: &JobRunRecord) -> anyhow::Result<Uuid>;
}
