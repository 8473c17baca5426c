pub mod cache;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod storage;
pub mod time;

pub mod config {
    use anyhow::Context;
    use chrono::{NaiveDate, NaiveTime};
    use std::str::FromStr;

    /// Upper bound for day counts; larger values overflow date arithmetic.
    pub const MAX_DAYS: i64 = 3650;
    pub const MAX_CACHE_TTL_SECS: i64 = 30 * 24 * 60 * 60;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub data_provider_base_url: Option<String>,
        pub data_provider_api_key: Option<String>,
        pub data_provider_timeout_secs: u64,
        pub data_provider_retries: u32,

        pub market_tz: chrono_tz::Tz,
        pub market_holidays: Vec<NaiveDate>,

        pub cache_ttl_quote_secs: i64,
        pub cache_ttl_ratings_secs: i64,
        pub cache_ttl_consensus_secs: i64,

        pub snapshot_times: Vec<NaiveTime>,
        pub evaluate_times: Vec<NaiveTime>,
        pub recompute_times: Vec<NaiveTime>,

        pub pipeline_concurrency: usize,
        pub prediction_horizon_days: i64,
        pub success_threshold: f64,
        pub min_resolved_for_score: usize,
        /// Unset means pending predictions are never expired.
        pub expiry_grace_days: Option<i64>,
        pub expiry_max_attempts: i32,
        pub tracked_tickers: Vec<String>,
        pub worker_tick_secs: u64,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                database_url: None,
                sentry_dsn: None,
                data_provider_base_url: None,
                data_provider_api_key: None,
                data_provider_timeout_secs: 30,
                data_provider_retries: 3,
                market_tz: chrono_tz::America::New_York,
                market_holidays: Vec::new(),
                cache_ttl_quote_secs: 5 * 60,
                cache_ttl_ratings_secs: 60 * 60,
                cache_ttl_consensus_secs: 60 * 60,
                snapshot_times: vec![hm(18, 0)],
                evaluate_times: vec![hm(18, 30)],
                recompute_times: vec![hm(19, 0)],
                pipeline_concurrency: 4,
                prediction_horizon_days: 365,
                success_threshold: 0.10,
                min_resolved_for_score: 5,
                expiry_grace_days: None,
                expiry_max_attempts: 3,
                tracked_tickers: Vec::new(),
                worker_tick_secs: 60,
            }
        }
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let d = Self::default();

            let market_tz = match std::env::var("MARKET_TZ") {
                Ok(s) => s
                    .trim()
                    .parse::<chrono_tz::Tz>()
                    .map_err(|e| anyhow::anyhow!("MARKET_TZ is not a valid timezone: {e}"))?,
                Err(_) => d.market_tz,
            };

            let market_holidays = match std::env::var("MARKET_HOLIDAYS") {
                Ok(s) => parse_list(&s, |p| NaiveDate::parse_from_str(p, "%Y-%m-%d"))
                    .context("MARKET_HOLIDAYS must be a comma-separated YYYY-MM-DD list")?,
                Err(_) => d.market_holidays,
            };

            let settings = Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                data_provider_base_url: std::env::var("DATA_PROVIDER_BASE_URL").ok(),
                data_provider_api_key: std::env::var("DATA_PROVIDER_API_KEY").ok(),
                data_provider_timeout_secs: env_or("DATA_PROVIDER_TIMEOUT_SECS", d.data_provider_timeout_secs)?,
                data_provider_retries: env_or("DATA_PROVIDER_RETRIES", d.data_provider_retries)?,
                market_tz,
                market_holidays,
                cache_ttl_quote_secs: env_or("CACHE_TTL_QUOTE_SECS", d.cache_ttl_quote_secs)?,
                cache_ttl_ratings_secs: env_or("CACHE_TTL_RATINGS_SECS", d.cache_ttl_ratings_secs)?,
                cache_ttl_consensus_secs: env_or("CACHE_TTL_CONSENSUS_SECS", d.cache_ttl_consensus_secs)?,
                snapshot_times: env_times("SNAPSHOT_TIMES", d.snapshot_times)?,
                evaluate_times: env_times("EVALUATE_TIMES", d.evaluate_times)?,
                recompute_times: env_times("RECOMPUTE_TIMES", d.recompute_times)?,
                pipeline_concurrency: env_or("PIPELINE_CONCURRENCY", d.pipeline_concurrency)?,
                prediction_horizon_days: env_or("PREDICTION_HORIZON_DAYS", d.prediction_horizon_days)?,
                success_threshold: env_or("SUCCESS_THRESHOLD", d.success_threshold)?,
                min_resolved_for_score: env_or("MIN_RESOLVED_FOR_SCORE", d.min_resolved_for_score)?,
                expiry_grace_days: match std::env::var("EXPIRY_GRACE_DAYS") {
                    Ok(s) => Some(
                        s.trim()
                            .parse::<i64>()
                            .context("EXPIRY_GRACE_DAYS must be an integer")?,
                    ),
                    Err(_) => None,
                },
                expiry_max_attempts: env_or("EXPIRY_MAX_ATTEMPTS", d.expiry_max_attempts)?,
                tracked_tickers: std::env::var("TRACKED_TICKERS")
                    .map(|s| {
                        s.split(',')
                            .map(|t| t.trim().to_uppercase())
                            .filter(|t| !t.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                worker_tick_secs: env_or("WORKER_TICK_SECS", d.worker_tick_secs)?,
            };

            settings.validate()?;
            Ok(settings)
        }

        pub fn validate(&self) -> anyhow::Result<()> {
            anyhow::ensure!(self.pipeline_concurrency >= 1, "PIPELINE_CONCURRENCY must be >= 1");
            anyhow::ensure!(
                (0..=MAX_DAYS).contains(&self.prediction_horizon_days),
                "PREDICTION_HORIZON_DAYS must be between 0 and {MAX_DAYS}"
            );
            anyhow::ensure!(
                self.success_threshold > 0.0 && self.success_threshold.is_finite(),
                "SUCCESS_THRESHOLD must be positive"
            );
            anyhow::ensure!(self.min_resolved_for_score >= 1, "MIN_RESOLVED_FOR_SCORE must be >= 1");
            anyhow::ensure!(self.expiry_max_attempts >= 1, "EXPIRY_MAX_ATTEMPTS must be >= 1");
            if let Some(grace) = self.expiry_grace_days {
                anyhow::ensure!(
                    (0..=MAX_DAYS).contains(&grace),
                    "EXPIRY_GRACE_DAYS must be between 0 and {MAX_DAYS}"
                );
            }
            for (key, ttl) in [
                ("CACHE_TTL_QUOTE_SECS", self.cache_ttl_quote_secs),
                ("CACHE_TTL_RATINGS_SECS", self.cache_ttl_ratings_secs),
                ("CACHE_TTL_CONSENSUS_SECS", self.cache_ttl_consensus_secs),
            ] {
                anyhow::ensure!(
                    (0..=MAX_CACHE_TTL_SECS).contains(&ttl),
                    "{key} must be between 0 and {MAX_CACHE_TTL_SECS}"
                );
            }
            anyhow::ensure!(self.worker_tick_secs >= 1, "WORKER_TICK_SECS must be >= 1");
            Ok(())
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_data_provider_base_url(&self) -> anyhow::Result<&str> {
            self.data_provider_base_url
                .as_deref()
                .context("DATA_PROVIDER_BASE_URL is required")
        }
    }

    fn hm(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
    }

    fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match std::env::var(key) {
            Ok(s) => s
                .trim()
                .parse::<T>()
                .with_context(|| format!("{key} has an invalid value: {s:?}")),
            Err(_) => Ok(default),
        }
    }

    fn env_times(key: &str, default: Vec<NaiveTime>) -> anyhow::Result<Vec<NaiveTime>> {
        let Ok(s) = std::env::var(key) else {
            return Ok(default);
        };
        let mut times = parse_times(&s).with_context(|| format!("{key} must be a comma-separated HH:MM list"))?;
        anyhow::ensure!(!times.is_empty(), "{key} must list at least one time");
        times.sort();
        times.dedup();
        Ok(times)
    }

    pub fn parse_times(s: &str) -> anyhow::Result<Vec<NaiveTime>> {
        Ok(parse_list(s, |p| NaiveTime::parse_from_str(p, "%H:%M"))?)
    }

    fn parse_list<T, E>(s: &str, parse: impl Fn(&str) -> Result<T, E>) -> Result<Vec<T>, E> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(parse)
            .collect()
    }

}
