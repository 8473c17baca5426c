use crate::domain::prediction::{firm_key, RatingAction};
use crate::error::PipelineError;
use crate::ingest::types::RawRating;
use std::collections::HashMap;

/// A rating row that carries everything a prediction needs.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRating {
    pub firm: String,
    pub action: RatingAction,
    pub rating: String,
    pub price_target: f64,
}

impl RawRating {
    pub fn validate_and_normalize(&self) -> Result<NormalizedRating, PipelineError> {
        let firm = self
            .firm
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::DataIncomplete("rating row has no firm".into()))?;

        let price_target = self
            .price_target
            .filter(|t| t.is_finite() && *t > 0.0)
            .ok_or_else(|| PipelineError::DataIncomplete(format!("rating row for {firm} has no price target")))?;

        let rating = self
            .rating
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("N/A")
            .to_string();

        Ok(NormalizedRating {
            firm: firm.to_string(),
            action: self
                .action
                .as_deref()
                .map(RatingAction::from_label)
                .unwrap_or(RatingAction::Other),
            rating,
            price_target,
        })
    }
}

/// Keeps one row per firm (matched on [`firm_key`]), the last one listed, at
/// the position where the firm first appeared.
pub fn dedupe_by_firm(rows: Vec<NormalizedRating>) -> Vec<NormalizedRating> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<NormalizedRating> = Vec::with_capacity(rows.len());

    for row in rows {
        let key = firm_key(&row.firm);
        match index.get(&key) {
            Some(&i) => out[i] = row,
            None => {
                index.insert(key, out.len());
                out.push(row);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(firm: Option<&str>, target: Option<f64>) -> RawRating {
        RawRating {
            firm: firm.map(str::to_string),
            action: Some("Upgrade".into()),
            rating: None,
            price_target: target,
        }
    }

    #[test]
    fn drops_rows_missing_firm_or_target() {
        assert!(matches!(
            raw(None, Some(10.0)).validate_and_normalize(),
            Err(PipelineError::DataIncomplete(_))
        ));
        assert!(matches!(
            raw(Some("  "), Some(10.0)).validate_and_normalize(),
            Err(PipelineError::DataIncomplete(_))
        ));
        assert!(raw(Some("Citi"), None).validate_and_normalize().is_err());
        assert!(raw(Some("Citi"), Some(-1.0)).validate_and_normalize().is_err());

        let ok = raw(Some(" Citi "), Some(10.0)).validate_and_normalize().unwrap();
        assert_eq!(ok.firm, "Citi");
        assert_eq!(ok.rating, "N/A");
        assert_eq!(ok.action, RatingAction::Upgrade);
    }

    #[test]
    fn last_listed_row_wins_per_firm() {
        let rows = vec![
            raw(Some("Goldman Sachs"), Some(200.0)),
            raw(Some("Citi"), Some(150.0)),
            raw(Some("goldman  sachs"), Some(210.0)),
        ]
        .into_iter()
        .map(|r| r.validate_and_normalize().unwrap())
        .collect();

        let out = dedupe_by_firm(rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].firm, "goldman  sachs");
        assert_eq!(out[0].price_target, 210.0);
        assert_eq!(out[1].firm, "Citi");
    }
}
