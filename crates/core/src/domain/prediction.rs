use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Pending,
    Resolved,
    Expired,
}

impl PredictionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "expired" => Ok(Self::Expired),
            other => anyhow::bail!("unknown prediction status: {other}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingAction {
    Initiate,
    Reiterate,
    Upgrade,
    Downgrade,
    Other,
}

impl RatingAction {
    /// Maps free-form upstream labels ("Upgrade", "Initiated", "Reiterated", "down", ...).
    pub fn from_label(label: &str) -> Self {
        let l = label.trim().to_lowercase();
        if l.starts_with("init") {
            Self::Initiate
        } else if l.starts_with("reit") || l.starts_with("main") {
            Self::Reiterate
        } else if l.starts_with("up") {
            Self::Upgrade
        } else if l.starts_with("down") {
            Self::Downgrade
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Reiterate => "reiterate",
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "initiate" => Ok(Self::Initiate),
            "reiterate" => Ok(Self::Reiterate),
            "upgrade" => Ok(Self::Upgrade),
            "downgrade" => Ok(Self::Downgrade),
            "other" => Ok(Self::Other),
            other => anyhow::bail!("unknown rating action: {other}"),
        }
    }
}

/// Canonical form of a firm name: case-folded with inner whitespace collapsed.
/// Upstream spells the same firm differently from day to day; storage keys
/// and score grouping use this form, the display name is kept as listed.
pub fn firm_key(firm: &str) -> String {
    firm.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Natural key of an analyst prediction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SnapshotKey {
    pub firm_key: String,
    pub ticker: String,
    pub snapshot_date: NaiveDate,
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.ticker, self.firm_key, self.snapshot_date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystSnapshot {
    pub firm: String,
    pub ticker: String,
    pub action: RatingAction,
    pub rating: String,
    pub price_target: f64,
    pub capture_price: f64,
    pub implied_return: f64,
    pub snapshot_date: NaiveDate,
    pub resolve_date: NaiveDate,
    pub status: PredictionStatus,
    pub source: String,
    /// Failed evaluation attempts after the grace window opened.
    pub eval_attempts: i32,
    pub realized_price: Option<f64>,
    pub error: Option<f64>,
    pub success: Option<bool>,
    pub directional_correct: Option<bool>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AnalystSnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            firm_key: firm_key(&self.firm),
            ticker: self.ticker.clone(),
            snapshot_date: self.snapshot_date,
        }
    }

    pub fn apply_outcome(&mut self, outcome: &Outcome, resolved_at: DateTime<Utc>) {
        self.status = PredictionStatus::Resolved;
        self.realized_price = Some(outcome.realized_price);
        self.error = Some(outcome.error);
        self.success = Some(outcome.success);
        self.directional_correct = Some(outcome.directional_correct);
        self.resolved_at = Some(resolved_at);
    }
}

/// Result of judging one prediction against its realized price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Outcome {
    pub realized_price: f64,
    pub error: f64,
    pub success: bool,
    pub directional_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSnapshot {
    pub ticker: String,
    pub snapshot_date: NaiveDate,
    pub mean_target: f64,
    pub contributor_count: i32,
    pub target_low: f64,
    pub target_high: f64,
    pub capture_price: Option<f64>,
    pub provider_mean_target: Option<f64>,
    pub provider_analyst_count: Option<i32>,
    pub resolve_date: NaiveDate,
    /// Set once, when the evaluation run finds a price for `resolve_date`.
    pub realized_price: Option<f64>,
    /// Whether the mean target called the direction of the move.
    /// None while unresolved, or when no capture price was recorded.
    pub directional_correct: Option<bool>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConsensusSnapshot {
    pub fn is_resolved(&self) -> bool {
        self.realized_price.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystScore {
    pub firm: String,
    /// None for the firm-wide score, Some for the firm's score on one ticker.
    pub ticker: Option<String>,
    pub resolved_count: i32,
    pub success_rate: Option<f64>,
    pub directional_rate: Option<f64>,
    pub mean_abs_error: Option<f64>,
    pub composite_score: Option<f64>,
    /// Tickers of the smallest and largest absolute error.
    pub best_call_ticker: Option<String>,
    pub worst_call_ticker: Option<String>,
    pub last_recomputed_at: DateTime<Utc>,
}

impl AnalystScore {
    /// Bitwise comparison of everything except the timestamp.
    pub fn same_metrics(&self, other: &AnalystScore) -> bool {
        fn bits(v: Option<f64>) -> Option<u64> {
            v.map(f64::to_bits)
        }
        self.firm == other.firm
            && self.ticker == other.ticker
            && self.best_call_ticker == other.best_call_ticker
            && self.worst_call_ticker == other.worst_call_ticker
            && self.resolved_count == other.resolved_count
            && bits(self.success_rate) == bits(other.success_rate)
            && bits(self.directional_rate) == bits(other.directional_rate)
            && bits(self.mean_abs_error) == bits(other.mean_abs_error)
            && bits(self.composite_score) == bits(other.composite_score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryPeriod {
    #[serde(rename = "1Y")]
    OneYear,
    #[serde(rename = "2Y")]
    TwoYears,
    #[serde(rename = "All")]
    All,
}

impl HistoryPeriod {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1Y" => Ok(Self::OneYear),
            "2Y" => Ok(Self::TwoYears),
            "ALL" => Ok(Self::All),
            other => anyhow::bail!("unknown history period: {other} (expected 1Y, 2Y or All)"),
        }
    }

    /// Inclusive lower bound on snapshot_date, or None for the full history.
    pub fn since(self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            Self::OneYear => Some(today - Duration::days(365)),
            Self::TwoYears => Some(today - Duration::days(730)),
            Self::All => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_upstream_action_labels() {
        assert_eq!(RatingAction::from_label("Upgrade"), RatingAction::Upgrade);
        assert_eq!(RatingAction::from_label("down"), RatingAction::Downgrade);
        assert_eq!(RatingAction::from_label("Initiated"), RatingAction::Initiate);
        assert_eq!(RatingAction::from_label("Reiterated"), RatingAction::Reiterate);
        assert_eq!(RatingAction::from_label("main"), RatingAction::Reiterate);
        assert_eq!(RatingAction::from_label("Target Raised"), RatingAction::Other);
    }

    #[test]
    fn periods_have_distinct_bounds() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let one = HistoryPeriod::parse("1y").unwrap().since(today).unwrap();
        let two = HistoryPeriod::parse("2Y").unwrap().since(today).unwrap();
        assert!(two < one);
        assert_eq!(HistoryPeriod::parse("All").unwrap().since(today), None);
        assert!(HistoryPeriod::parse("5Y").is_err());
    }

    #[test]
    fn firm_keys_ignore_case_and_spacing() {
        assert_eq!(firm_key("Goldman Sachs"), "goldman sachs");
        assert_eq!(firm_key("  GOLDMAN   sachs "), "goldman sachs");
        assert_ne!(firm_key("Goldman Sachs"), firm_key("GoldmanSachs"));
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!PredictionStatus::Pending.is_terminal());
        assert!(PredictionStatus::Resolved.is_terminal());
        assert!(PredictionStatus::Expired.is_terminal());
        assert_eq!(PredictionStatus::parse("expired").unwrap(), PredictionStatus::Expired);
    }
}
