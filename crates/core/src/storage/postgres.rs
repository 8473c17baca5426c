use crate::domain::{
    firm_key, AnalystScore, AnalystSnapshot, ConsensusSnapshot, Outcome, PredictionStatus,
    RatingAction, SnapshotKey,
};
use crate::storage::{JobRunRecord, Repository};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

const ANALYST_COLUMNS: &str = "firm, ticker, action, rating, price_target, capture_price, implied_return, \
     snapshot_date, resolve_date, status, source, eval_attempts, realized_price, prediction_error, \
     success, directional_correct, resolved_at";

const CONSENSUS_COLUMNS: &str = "ticker, snapshot_date, mean_target, contributor_count, target_low, target_high, \
     capture_price, provider_mean_target, provider_analyst_count, resolve_date, realized_price, \
     directional_correct, resolved_at";

const SCORE_COLUMNS: &str = "firm, ticker, resolved_count, success_rate, directional_rate, mean_abs_error, \
     composite_score, best_call_ticker, worst_call_ticker, last_recomputed_at";

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: sqlx::PgPool,
}

impl PgRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AnalystSnapshotRow {
    firm: String,
    ticker: String,
    action: String,
    rating: String,
    price_target: f64,
    capture_price: f64,
    implied_return: f64,
    snapshot_date: NaiveDate,
    resolve_date: NaiveDate,
    status: String,
    source: String,
    eval_attempts: i32,
    realized_price: Option<f64>,
    prediction_error: Option<f64>,
    success: Option<bool>,
    directional_correct: Option<bool>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<AnalystSnapshotRow> for AnalystSnapshot {
    type Error = anyhow::Error;

    fn try_from(r: AnalystSnapshotRow) -> anyhow::Result<Self> {
        Ok(Self {
            action: RatingAction::parse(&r.action)?,
            status: PredictionStatus::parse(&r.status)?,
            firm: r.firm,
            ticker: r.ticker,
            rating: r.rating,
            price_target: r.price_target,
            capture_price: r.capture_price,
            implied_return: r.implied_return,
            snapshot_date: r.snapshot_date,
            resolve_date: r.resolve_date,
            source: r.source,
            eval_attempts: r.eval_attempts,
            realized_price: r.realized_price,
            error: r.prediction_error,
            success: r.success,
            directional_correct: r.directional_correct,
            resolved_at: r.resolved_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConsensusRow {
    ticker: String,
    snapshot_date: NaiveDate,
    mean_target: f64,
    contributor_count: i32,
    target_low: f64,
    target_high: f64,
    capture_price: Option<f64>,
    provider_mean_target: Option<f64>,
    provider_analyst_count: Option<i32>,
    resolve_date: NaiveDate,
    realized_price: Option<f64>,
    directional_correct: Option<bool>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<ConsensusRow> for ConsensusSnapshot {
    fn from(r: ConsensusRow) -> Self {
        Self {
            ticker: r.ticker,
            snapshot_date: r.snapshot_date,
            mean_target: r.mean_target,
            contributor_count: r.contributor_count,
            target_low: r.target_low,
            target_high: r.target_high,
            capture_price: r.capture_price,
            provider_mean_target: r.provider_mean_target,
            provider_analyst_count: r.provider_analyst_count,
            resolve_date: r.resolve_date,
            realized_price: r.realized_price,
            directional_correct: r.directional_correct,
            resolved_at: r.resolved_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScoreRow {
    firm: String,
    ticker: String,
    resolved_count: i32,
    success_rate: Option<f64>,
    directional_rate: Option<f64>,
    mean_abs_error: Option<f64>,
    composite_score: Option<f64>,
    best_call_ticker: Option<String>,
    worst_call_ticker: Option<String>,
    last_recomputed_at: DateTime<Utc>,
}

impl From<ScoreRow> for AnalystScore {
    fn from(r: ScoreRow) -> Self {
        Self {
            firm: r.firm,
            ticker: Some(r.ticker).filter(|t| !t.is_empty()),
            resolved_count: r.resolved_count,
            success_rate: r.success_rate,
            directional_rate: r.directional_rate,
            mean_abs_error: r.mean_abs_error,
            composite_score: r.composite_score,
            best_call_ticker: r.best_call_ticker,
            worst_call_ticker: r.worst_call_ticker,
            last_recomputed_at: r.last_recomputed_at,
        }
    }
}

fn into_snapshots(rows: Vec<AnalystSnapshotRow>) -> anyhow::Result<Vec<AnalystSnapshot>> {
    rows.into_iter().map(AnalystSnapshot::try_from).collect()
}

#[async_trait::async_trait]
impl Repository for PgRepository {
    async fn tracked_tickers(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT upper(ticker) FROM tracked_tickers ORDER BY 1")
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .context("select tracked_tickers failed")?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn has_analyst_snapshots(&self, ticker: &str, snapshot_date: NaiveDate) -> anyhow::Result<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM analyst_snapshots WHERE ticker = $1 AND snapshot_date = $2)",
        )
        .persistent(false)
        .bind(ticker)
        .bind(snapshot_date)
        .fetch_one(&self.pool)
        .await
        .context("check analyst_snapshots existence failed")?;
        Ok(exists.0)
    }

    async fn upsert_analyst_snapshot(&self, s: &AnalystSnapshot) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO analyst_snapshots (firm, ticker, snapshot_date, action, rating, price_target, \
               capture_price, implied_return, resolve_date, status, source, firm_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (firm_key, ticker, snapshot_date) DO UPDATE \
               SET firm = EXCLUDED.firm, action = EXCLUDED.action, rating = EXCLUDED.rating, \
                   price_target = EXCLUDED.price_target, \
                   capture_price = EXCLUDED.capture_price, implied_return = EXCLUDED.implied_return, \
                   resolve_date = EXCLUDED.resolve_date, source = EXCLUDED.source, updated_at = now() \
               WHERE analyst_snapshots.status = 'pending'",
        )
        .persistent(false)
        .bind(&s.firm)
        .bind(&s.ticker)
        .bind(s.snapshot_date)
        .bind(s.action.as_str())
        .bind(&s.rating)
        .bind(s.price_target)
        .bind(s.capture_price)
        .bind(s.implied_return)
        .bind(s.resolve_date)
        .bind(s.status.as_str())
        .bind(&s.source)
        .bind(firm_key(&s.firm))
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert analyst_snapshots failed ({})", s.key()))?;
        Ok(())
    }

    async fn upsert_consensus_snapshot(&self, c: &ConsensusSnapshot) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO consensus_snapshots (ticker, snapshot_date, mean_target, contributor_count, \
               target_low, target_high, capture_price, provider_mean_target, provider_analyst_count, resolve_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (ticker, snapshot_date) DO UPDATE \
               SET mean_target = EXCLUDED.mean_target, contributor_count = EXCLUDED.contributor_count, \
                   target_low = EXCLUDED.target_low, target_high = EXCLUDED.target_high, \
                   capture_price = EXCLUDED.capture_price, provider_mean_target = EXCLUDED.provider_mean_target, \
                   provider_analyst_count = EXCLUDED.provider_analyst_count, resolve_date = EXCLUDED.resolve_date, \
                   updated_at = now() \
               WHERE consensus_snapshots.realized_price IS NULL",
        )
        .persistent(false)
        .bind(&c.ticker)
        .bind(c.snapshot_date)
        .bind(c.mean_target)
        .bind(c.contributor_count)
        .bind(c.target_low)
        .bind(c.target_high)
        .bind(c.capture_price)
        .bind(c.provider_mean_target)
        .bind(c.provider_analyst_count)
        .bind(c.resolve_date)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert consensus_snapshots failed ({}@{})", c.ticker, c.snapshot_date))?;
        Ok(())
    }

    async fn list_due_pending(&self, as_of: NaiveDate) -> anyhow::Result<Vec<AnalystSnapshot>> {
        let rows = sqlx::query_as::<_, AnalystSnapshotRow>(&format!(
            "SELECT {ANALYST_COLUMNS} FROM analyst_snapshots \
             WHERE status = 'pending' AND resolve_date <= $1 \
             ORDER BY resolve_date ASC, ticker ASC, firm ASC, snapshot_date ASC"
        ))
        .persistent(false)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .context("select due pending analyst_snapshots failed")?;
        into_snapshots(rows)
    }

    async fn resolve_snapshot(
        &self,
        key: &SnapshotKey,
        outcome: &Outcome,
        resolved_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE analyst_snapshots \
             SET status = 'resolved', realized_price = $4, prediction_error = $5, success = $6, \
                 directional_correct = $7, resolved_at = $8, updated_at = now() \
             WHERE firm_key = $1 AND ticker = $2 AND snapshot_date = $3 AND status = 'pending'",
        )
        .persistent(false)
        .bind(&key.firm_key)
        .bind(&key.ticker)
        .bind(key.snapshot_date)
        .bind(outcome.realized_price)
        .bind(outcome.error)
        .bind(outcome.success)
        .bind(outcome.directional_correct)
        .bind(resolved_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("resolve analyst_snapshots failed ({key})"))?;
        Ok(res.rows_affected() == 1)
    }

    async fn record_evaluation_miss(&self, key: &SnapshotKey) -> anyhow::Result<i32> {
        let attempts: Option<(i32,)> = sqlx::query_as(
            "UPDATE analyst_snapshots SET eval_attempts = eval_attempts + 1, updated_at = now() \
             WHERE firm_key = $1 AND ticker = $2 AND snapshot_date = $3 AND status = 'pending' \
             RETURNING eval_attempts",
        )
        .persistent(false)
        .bind(&key.firm_key)
        .bind(&key.ticker)
        .bind(key.snapshot_date)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("record evaluation miss failed ({key})"))?;
        attempts
            .map(|(n,)| n)
            .with_context(|| format!("no pending analyst snapshot for {key}"))
    }

    async fn expire_snapshot(&self, key: &SnapshotKey) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE analyst_snapshots SET status = 'expired', updated_at = now() \
             WHERE firm_key = $1 AND ticker = $2 AND snapshot_date = $3 AND status = 'pending'",
        )
        .persistent(false)
        .bind(&key.firm_key)
        .bind(&key.ticker)
        .bind(key.snapshot_date)
        .execute(&self.pool)
        .await
        .with_context(|| format!("expire analyst_snapshots failed ({key})"))?;
        Ok(res.rows_affected() == 1)
    }

    async fn list_resolved(&self) -> anyhow::Result<Vec<AnalystSnapshot>> {
        let rows = sqlx::query_as::<_, AnalystSnapshotRow>(&format!(
            "SELECT {ANALYST_COLUMNS} FROM analyst_snapshots \
             WHERE status = 'resolved' \
             ORDER BY firm ASC, ticker ASC, snapshot_date ASC"
        ))
        .persistent(false)
        .fetch_all(&self.pool)
        .await
        .context("select resolved analyst_snapshots failed")?;
        into_snapshots(rows)
    }

    async fn list_due_consensus(&self, as_of: NaiveDate) -> anyhow::Result<Vec<ConsensusSnapshot>> {
        let rows = sqlx::query_as::<_, ConsensusRow>(&format!(
            "SELECT {CONSENSUS_COLUMNS} FROM consensus_snapshots \
             WHERE realized_price IS NULL AND resolve_date <= $1 \
             ORDER BY resolve_date ASC, ticker ASC, snapshot_date ASC"
        ))
        .persistent(false)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .context("select due consensus_snapshots failed")?;
        Ok(rows.into_iter().map(ConsensusSnapshot::from).collect())
    }

    async fn resolve_consensus(
        &self,
        ticker: &str,
        snapshot_date: NaiveDate,
        realized_price: f64,
        directional_correct: Option<bool>,
        resolved_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE consensus_snapshots \
             SET realized_price = $3, directional_correct = $4, resolved_at = $5, updated_at = now() \
             WHERE ticker = $1 AND snapshot_date = $2 AND realized_price IS NULL",
        )
        .persistent(false)
        .bind(ticker)
        .bind(snapshot_date)
        .bind(realized_price)
        .bind(directional_correct)
        .bind(resolved_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("resolve consensus_snapshots failed ({ticker}@{snapshot_date})"))?;
        Ok(res.rows_affected() == 1)
    }

    async fn upsert_score(&self, s: &AnalystScore) -> anyhow::Result<bool> {
        let res = sqlx::query(&format!(
            "INSERT INTO analyst_scores ({SCORE_COLUMNS}, firm_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (firm_key, ticker) DO UPDATE \
               SET firm = EXCLUDED.firm, resolved_count = EXCLUDED.resolved_count, \
                   success_rate = EXCLUDED.success_rate, directional_rate = EXCLUDED.directional_rate, \
                   mean_abs_error = EXCLUDED.mean_abs_error, composite_score = EXCLUDED.composite_score, \
                   best_call_ticker = EXCLUDED.best_call_ticker, worst_call_ticker = EXCLUDED.worst_call_ticker, \
                   last_recomputed_at = EXCLUDED.last_recomputed_at \
               WHERE (analyst_scores.firm, analyst_scores.resolved_count, analyst_scores.success_rate, \
                      analyst_scores.directional_rate, analyst_scores.mean_abs_error, analyst_scores.composite_score, \
                      analyst_scores.best_call_ticker, analyst_scores.worst_call_ticker) \
                     IS DISTINCT FROM \
                     (EXCLUDED.firm, EXCLUDED.resolved_count, EXCLUDED.success_rate, EXCLUDED.directional_rate, \
                      EXCLUDED.mean_abs_error, EXCLUDED.composite_score, \
                      EXCLUDED.best_call_ticker, EXCLUDED.worst_call_ticker)"
        ))
        .persistent(false)
        .bind(&s.firm)
        .bind(s.ticker.as_deref().unwrap_or(""))
        .bind(s.resolved_count)
        .bind(s.success_rate)
        .bind(s.directional_rate)
        .bind(s.mean_abs_error)
        .bind(s.composite_score)
        .bind(&s.best_call_ticker)
        .bind(&s.worst_call_ticker)
        .bind(s.last_recomputed_at)
        .bind(firm_key(&s.firm))
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert analyst_scores failed (firm={}, ticker={:?})", s.firm, s.ticker))?;
        Ok(res.rows_affected() > 0)
    }

    async fn consensus_history(
        &self,
        ticker: &str,
        since: Option<NaiveDate>,
    ) -> anyhow::Result<Vec<ConsensusSnapshot>> {
        let rows = sqlx::query_as::<_, ConsensusRow>(&format!(
            "SELECT {CONSENSUS_COLUMNS} FROM consensus_snapshots \
             WHERE ticker = $1 AND ($2::date IS NULL OR snapshot_date >= $2) \
             ORDER BY snapshot_date ASC"
        ))
        .persistent(false)
        .bind(ticker)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("select consensus_snapshots failed (ticker={ticker})"))?;
        Ok(rows.into_iter().map(ConsensusSnapshot::from).collect())
    }

    async fn top_scores(&self, ticker: Option<&str>, limit: usize) -> anyhow::Result<Vec<AnalystScore>> {
        let rows = sqlx::query_as::<_, ScoreRow>(&format!(
            "SELECT {SCORE_COLUMNS} FROM analyst_scores \
             WHERE ticker = $1 \
             ORDER BY composite_score DESC NULLS LAST, firm ASC \
             LIMIT $2"
        ))
        .persistent(false)
        .bind(ticker.unwrap_or(""))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("select analyst_scores failed")?;
        Ok(rows.into_iter().map(AnalystScore::from).collect())
    }

    async fn ticker_snapshots(&self, ticker: &str) -> anyhow::Result<Vec<AnalystSnapshot>> {
        let rows = sqlx::query_as::<_, AnalystSnapshotRow>(&format!(
            "SELECT {ANALYST_COLUMNS} FROM analyst_snapshots \
             WHERE ticker = $1 \
             ORDER BY snapshot_date DESC, firm_key ASC"
        ))
        .persistent(false)
        .bind(ticker)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("select analyst_snapshots failed (ticker={ticker})"))?;
        into_snapshots(rows)
    }

    async fn firm_history(&self, ticker: &str, firm: &str) -> anyhow::Result<Vec<AnalystSnapshot>> {
        let rows = sqlx::query_as::<_, AnalystSnapshotRow>(&format!(
            "SELECT {ANALYST_COLUMNS} FROM analyst_snapshots \
             WHERE ticker = $1 AND firm_key = $2 \
             ORDER BY snapshot_date DESC"
        ))
        .persistent(false)
        .bind(ticker)
        .bind(firm_key(firm))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("select firm history failed (ticker={ticker}, firm={firm})"))?;
        into_snapshots(rows)
    }

    async fn record_job_run(&self, run: &JobRunRecord) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO pipeline_runs (id, job_kind, as_of_date, started_at, finished_at, status, summary, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .persistent(false)
        .bind(id)
        .bind(run.job_kind)
        .bind(run.as_of_date)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status)
        .bind(&run.summary)
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .context("insert pipeline_runs failed")?;

        Ok(id)
    }
}
