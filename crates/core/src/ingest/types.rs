use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Quote,
    AnalystRatings,
    Consensus,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::AnalystRatings => "analyst_ratings",
            Self::Consensus => "consensus",
        }
    }
}

/// What to fetch for a kind: a ticker, optionally pinned to a historical date.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub ticker: String,
    pub on: Option<NaiveDate>,
}

impl FetchKey {
    pub fn current(ticker: &str) -> Self {
        Self {
            ticker: ticker.trim().to_uppercase(),
            on: None,
        }
    }

    pub fn on(ticker: &str, date: NaiveDate) -> Self {
        Self {
            ticker: ticker.trim().to_uppercase(),
            on: Some(date),
        }
    }
}

impl std::fmt::Display for FetchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.on {
            Some(d) => write!(f, "{}@{}", self.ticker, d),
            None => f.write_str(&self.ticker),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct Quote {
    pub price: Option<f64>,
    pub as_of: Option<NaiveDate>,
}

impl From<Map<String, Value>> for Quote {
    fn from(m: Map<String, Value>) -> Self {
        Self {
            price: pick_f64(&m, &["price", "close", "Close", "regularMarketPrice", "currentPrice"]),
            as_of: pick_str(&m, &["as_of", "date", "Date"])
                .and_then(|s| NaiveDate::parse_from_str(s.get(..10).unwrap_or(&s), "%Y-%m-%d").ok()),
        }
    }
}

/// One upstream analyst rating row after field-name normalization.
/// Values are still optional; dropping incomplete rows happens downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct RawRating {
    pub firm: Option<String>,
    pub action: Option<String>,
    pub rating: Option<String>,
    pub price_target: Option<f64>,
}

impl From<Map<String, Value>> for RawRating {
    fn from(m: Map<String, Value>) -> Self {
        Self {
            firm: pick_str(&m, &["firm", "Firm", "Analyst", "analyst", "analyst_name"]),
            action: pick_str(&m, &["action", "Action"]),
            rating: pick_str(&m, &["rating", "Rating", "To Grade", "toGrade", "to_grade"]),
            price_target: pick_f64(&m, &["price_target", "Price Target", "Price_Target", "priceTarget", "target"]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct ConsensusFigures {
    pub mean: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub median: Option<f64>,
    pub analyst_count: Option<i32>,
    pub rating: Option<String>,
}

impl From<Map<String, Value>> for ConsensusFigures {
    fn from(m: Map<String, Value>) -> Self {
        Self {
            mean: pick_f64(&m, &["mean", "avg", "targetMeanPrice"]),
            low: pick_f64(&m, &["low", "targetLowPrice"]),
            high: pick_f64(&m, &["high", "targetHighPrice"]),
            median: pick_f64(&m, &["median", "targetMedianPrice"]),
            analyst_count: pick_f64(&m, &["count", "numberOfAnalystOpinions", "analyst_count"])
                .filter(|n| *n >= 0.0 && n.fract() == 0.0 && *n <= i32::MAX as f64)
                .map(|n| n as i32),
            rating: pick_str(&m, &["consensus", "rating", "recommendationKey"]),
        }
    }
}

/// Days after a requested date in which a historical close may fall. Providers
/// answer a historical quote request with the first session close on or after
/// the date, which covers weekends and holidays.
pub const HISTORICAL_LOOKAHEAD_DAYS: i64 = 5;

/// Structural record every provider response is normalized into.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderData {
    Quote(Quote),
    Ratings(Vec<RawRating>),
    Consensus(ConsensusFigures),
}

impl ProviderData {
    /// Empty results are never cached as hits.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Quote(q) => q.price.is_none(),
            Self::Ratings(rows) => rows.is_empty(),
            Self::Consensus(c) => c.mean.is_none() && c.analyst_count.is_none(),
        }
    }

    pub fn quote_price(&self) -> Option<f64> {
        match self {
            Self::Quote(q) => q.price.filter(|p| p.is_finite() && *p > 0.0),
            _ => None,
        }
    }

    /// Close for a historical request on `on`. A quote dated outside
    /// `[on, on + HISTORICAL_LOOKAHEAD_DAYS)` is rejected; undated quotes are
    /// taken as answering the request.
    pub fn close_on_or_after(&self, on: NaiveDate) -> Option<f64> {
        let Self::Quote(q) = self else {
            return None;
        };
        if let Some(as_of) = q.as_of {
            if as_of < on || as_of >= on + Duration::days(HISTORICAL_LOOKAHEAD_DAYS) {
                return None;
            }
        }
        self.quote_price()
    }

    pub fn ratings(&self) -> Option<&[RawRating]> {
        match self {
            Self::Ratings(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn consensus(&self) -> Option<&ConsensusFigures> {
        match self {
            Self::Consensus(c) => Some(c),
            _ => None,
        }
    }
}

fn pick<'a>(m: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| m.get(*k))
        .find(|v| !v.is_null())
}

fn pick_str(m: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| m.get(*k))
        .filter_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .find(|s| !s.is_empty())
}

fn pick_f64(m: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    match pick(m, keys)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price(s),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// Accepts "$1,234.50"-style strings.
pub fn parse_price(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rating_field_variants_normalize() {
        let rows: Vec<RawRating> = serde_json::from_value(json!([
            {"Analyst": "Goldman Sachs", "Action": "Upgrade", "Rating": "Buy", "Price Target": "$1,210.50"},
            {"firm": "Morgan Stanley", "action": "main", "To Grade": "Overweight", "price_target": 200},
            {"analyst_name": "Citi", "Price_Target": null, "target": "190"},
            {"Firm": "", "Rating": "Hold"}
        ]))
        .unwrap();

        assert_eq!(rows[0].firm.as_deref(), Some("Goldman Sachs"));
        assert_eq!(rows[0].price_target, Some(1210.5));
        assert_eq!(rows[1].rating.as_deref(), Some("Overweight"));
        assert_eq!(rows[1].price_target, Some(200.0));
        assert_eq!(rows[2].price_target, Some(190.0));
        assert_eq!(rows[3].firm, None);
        assert_eq!(rows[3].price_target, None);
    }

    #[test]
    fn consensus_and_quote_variants_normalize() {
        let c: ConsensusFigures = serde_json::from_value(json!({
            "targetMeanPrice": 212.4, "low": "180", "numberOfAnalystOpinions": 31
        }))
        .unwrap();
        assert_eq!(c.mean, Some(212.4));
        assert_eq!(c.low, Some(180.0));
        assert_eq!(c.analyst_count, Some(31));

        let q: Quote = serde_json::from_value(json!({"Close": 205.0, "Date": "2026-01-05T00:00:00"})).unwrap();
        assert_eq!(q.price, Some(205.0));
        assert_eq!(q.as_of, NaiveDate::from_ymd_opt(2026, 1, 5));
    }

    #[test]
    fn emptiness_per_kind() {
        assert!(ProviderData::Ratings(vec![]).is_empty());
        assert!(ProviderData::Quote(Quote { price: None, as_of: None }).is_empty());
        assert!(ProviderData::Consensus(ConsensusFigures::default()).is_empty());
        assert!(!ProviderData::Quote(Quote { price: Some(1.0), as_of: None }).is_empty());
    }

    #[test]
    fn historical_close_must_fall_in_lookahead_window() {
        let saturday = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let dated = |d: u32| {
            ProviderData::Quote(Quote {
                price: Some(205.0),
                as_of: NaiveDate::from_ymd_opt(2026, 1, d),
            })
        };

        assert_eq!(dated(12).close_on_or_after(saturday), Some(205.0));
        assert_eq!(dated(10).close_on_or_after(saturday), Some(205.0));
        assert_eq!(dated(9).close_on_or_after(saturday), None);
        assert_eq!(dated(15).close_on_or_after(saturday), None);

        let undated = ProviderData::Quote(Quote { price: Some(1.0), as_of: None });
        assert_eq!(undated.close_on_or_after(saturday), Some(1.0));
    }

    #[test]
    fn non_positive_quote_is_not_usable() {
        let q = ProviderData::Quote(Quote { price: Some(0.0), as_of: None });
        assert_eq!(q.quote_price(), None);
    }
}
