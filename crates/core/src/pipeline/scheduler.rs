//! Daily job scheduling.
//!
//! Each job kind has configured trigger times in the market timezone. Once a
//! trigger time has passed, the next tick makes the day's single scheduled
//! attempt, on trading days only. A job never overlaps itself, and it waits
//! while an earlier stage of the pipeline is still running. A job that ends
//! with failures goes back to idle and is retried on the next trading day;
//! explicit runs are not limited.

use crate::config::Settings;
use crate::time::{Clock, MarketCalendar};
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Snapshot,
    Evaluate,
    Recompute,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Snapshot, JobKind::Evaluate, JobKind::Recompute];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Snapshot => "snapshot",
            JobKind::Evaluate => "evaluate",
            JobKind::Recompute => "recompute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "date", rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    CompletedForDay(NaiveDate),
}

/// What a stage run reports back to the runner.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub job: JobKind,
    pub market_date: NaiveDate,
    pub failures: usize,
    pub summary: serde_json::Value,
}

impl StageReport {
    pub fn is_full_success(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    NotTradingDay,
    NotDue,
    AlreadyCompleted,
    /// Today's scheduled attempt already ran and did not fully succeed.
    AlreadyAttempted,
    /// An earlier stage is still running; the trigger is retried on a later tick.
    WaitingOnUpstream { upstream: JobKind },
    /// Same job still running; the trigger is discarded.
    Dropped,
    Completed { report: StageReport },
    PartialFailure { report: StageReport },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ManualOutcome {
    Accepted { report: StageReport },
    /// A snapshot for this ticker already exists (or is in flight) for the market date.
    Debounced { ticker: String, market_date: NaiveDate },
}

/// The work behind each job kind.
#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, job: JobKind, market_date: NaiveDate) -> anyhow::Result<StageReport>;

    async fn snapshot_ticker(&self, ticker: &str, market_date: NaiveDate) -> anyhow::Result<StageReport>;

    async fn snapshot_exists(&self, ticker: &str, market_date: NaiveDate) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
struct Schedule {
    times: Vec<NaiveTime>,
}

impl Schedule {
    fn new(mut times: Vec<NaiveTime>) -> Self {
        times.sort();
        times.dedup();
        Self { times }
    }

    /// Latest trigger time at or before `now`.
    fn latest_due(&self, now: NaiveTime) -> Option<NaiveTime> {
        self.times.iter().rev().find(|t| **t <= now).copied()
    }
}

#[derive(Debug)]
struct Slot {
    state: JobState,
    /// Market date of the last scheduled attempt.
    last_attempt: Option<NaiveDate>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: JobState::Idle,
            last_attempt: None,
        }
    }
}

pub struct JobRunner {
    executor: Arc<dyn StageExecutor>,
    calendar: MarketCalendar,
    clock: Arc<dyn Clock>,
    schedules: HashMap<JobKind, Schedule>,
    slots: Mutex<HashMap<JobKind, Slot>>,
    manual: Mutex<HashSet<(String, NaiveDate)>>,
}

impl JobRunner {
    pub fn new(
        executor: Arc<dyn StageExecutor>,
        calendar: MarketCalendar,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        let schedules = HashMap::from([
            (JobKind::Snapshot, Schedule::new(settings.snapshot_times.clone())),
            (JobKind::Evaluate, Schedule::new(settings.evaluate_times.clone())),
            (JobKind::Recompute, Schedule::new(settings.recompute_times.clone())),
        ]);
        Self {
            executor,
            calendar,
            clock,
            schedules,
            slots: Mutex::new(HashMap::new()),
            manual: Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self, job: JobKind) -> JobState {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job)
            .map(|s| s.state)
            .unwrap_or(JobState::Idle)
    }

    pub fn market_date(&self) -> NaiveDate {
        self.calendar.market_date(self.clock.now())
    }

    /// Checks every job kind against its schedule, in pipeline order.
    pub async fn tick(&self) -> Vec<(JobKind, TriggerOutcome)> {
        let mut out = Vec::with_capacity(JobKind::ALL.len());
        for job in JobKind::ALL {
            out.push((job, self.trigger(job).await));
        }
        out
    }

    /// Scheduled trigger for one job kind.
    pub async fn trigger(&self, job: JobKind) -> TriggerOutcome {
        let now = self.calendar.now_in_market_tz(self.clock.now());
        let date = now.date_naive();
        if !self.calendar.is_trading_day(date) {
            return TriggerOutcome::NotTradingDay;
        }
        if self.schedules.get(&job).and_then(|s| s.latest_due(now.time())).is_none() {
            return TriggerOutcome::NotDue;
        }

        if let Err(outcome) = self.begin(job, date, true) {
            return outcome;
        }
        self.run(job, date).await
    }

    /// Explicit run (CLI, operator). Skips the schedule, the trading-day check
    /// and the once-a-day limit but still refuses to overlap a running job.
    pub async fn run_now(&self, job: JobKind, market_date: NaiveDate) -> TriggerOutcome {
        if let Err(outcome) = self.begin(job, market_date, false) {
            return outcome;
        }
        self.run(job, market_date).await
    }

    /// On-demand snapshot of one ticker. Runs outside the job state machine
    /// and is debounced per (ticker, market date).
    pub async fn manual_snapshot(&self, ticker: &str) -> anyhow::Result<ManualOutcome> {
        let ticker = ticker.trim().to_uppercase();
        anyhow::ensure!(!ticker.is_empty(), "ticker is required");
        let market_date = self.market_date();
        let key = (ticker.clone(), market_date);

        {
            let mut session = self.manual.lock().unwrap_or_else(PoisonError::into_inner);
            session.retain(|(_, d)| *d >= market_date);
            if !session.insert(key.clone()) {
                tracing::info!(%ticker, %market_date, "manual snapshot debounced (in session)");
                return Ok(ManualOutcome::Debounced { ticker, market_date });
            }
        }

        let exists = match self.executor.snapshot_exists(&ticker, market_date).await {
            Ok(b) => b,
            Err(e) => {
                self.forget_manual(&key);
                return Err(e);
            }
        };
        if exists {
            tracing::info!(%ticker, %market_date, "manual snapshot debounced (already stored)");
            return Ok(ManualOutcome::Debounced { ticker, market_date });
        }

        match self.executor.snapshot_ticker(&ticker, market_date).await {
            Ok(report) => {
                if !report.is_full_success() {
                    self.forget_manual(&key);
                }
                Ok(ManualOutcome::Accepted { report })
            }
            Err(e) => {
                self.forget_manual(&key);
                Err(e)
            }
        }
    }

    fn forget_manual(&self, key: &(String, NaiveDate)) {
        self.manual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Moves the job to Running, or says why it can't.
    fn begin(&self, job: JobKind, date: NaiveDate, scheduled: bool) -> Result<(), TriggerOutcome> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let upstream = JobKind::ALL
            .into_iter()
            .take_while(|k| *k != job)
            .find(|k| slots.get(k).is_some_and(|s| s.state == JobState::Running));
        let slot = slots.entry(job).or_default();

        match slot.state {
            JobState::Running => {
                tracing::warn!(job = job.as_str(), "trigger dropped: job already running");
                return Err(TriggerOutcome::Dropped);
            }
            JobState::CompletedForDay(d) if d == date && scheduled => {
                return Err(TriggerOutcome::AlreadyCompleted);
            }
            _ => {}
        }

        if scheduled {
            if slot.last_attempt == Some(date) {
                return Err(TriggerOutcome::AlreadyAttempted);
            }
            if let Some(upstream) = upstream {
                tracing::debug!(job = job.as_str(), upstream = upstream.as_str(), "waiting on upstream stage");
                return Err(TriggerOutcome::WaitingOnUpstream { upstream });
            }
            slot.last_attempt = Some(date);
        }
        slot.state = JobState::Running;
        Ok(())
    }

    async fn run(&self, job: JobKind, date: NaiveDate) -> TriggerOutcome {
        let mut guard = RunGuard {
            runner: self,
            job,
            finished: None,
        };
        tracing::info!(job = job.as_str(), market_date = %date, "job started");

        let outcome = match self.executor.execute(job, date).await {
            Ok(report) if report.is_full_success() => {
                guard.finished = Some(JobState::CompletedForDay(date));
                tracing::info!(job = job.as_str(), market_date = %date, "job completed");
                TriggerOutcome::Completed { report }
            }
            Ok(report) => {
                tracing::warn!(
                    job = job.as_str(),
                    market_date = %date,
                    failures = report.failures,
                    "job finished with failures; will retry next trading day"
                );
                TriggerOutcome::PartialFailure { report }
            }
            Err(e) => {
                tracing::error!(job = job.as_str(), market_date = %date, error = %format!("{e:#}"), "job failed");
                TriggerOutcome::Failed {
                    error: format!("{e:#}"),
                }
            }
        };
        drop(guard);
        outcome
    }

    fn set_state(&self, job: JobKind, state: JobState) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job)
            .or_default()
            .state = state;
    }
}

/// Leaves Running on every exit path, including a dropped future.
struct RunGuard<'a> {
    runner: &'a JobRunner,
    job: JobKind,
    finished: Option<JobState>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.runner
            .set_state(self.job, self.finished.unwrap_or(JobState::Idle));
    }
}
