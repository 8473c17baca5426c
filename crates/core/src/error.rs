use crate::ingest::provider::ProviderError;
use serde::Serialize;

// SQLSTATE unique_violation.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Per-item failure taxonomy reported in run results. None of these abort a batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PipelineError {
    /// Transient upstream failure; the next cycle retries.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A required field was missing; the record is dropped.
    #[error("data incomplete: {0}")]
    DataIncomplete(String),

    #[error("duplicate key conflict: {0}")]
    DuplicateKeyConflict(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl PipelineError {
    pub fn from_storage(err: &anyhow::Error) -> Self {
        let is_unique_violation = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<sqlx::Error>(),
                Some(sqlx::Error::Database(db)) if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION)
            )
        });

        if is_unique_violation {
            Self::DuplicateKeyConflict(format!("{err:#}"))
        } else {
            Self::PersistenceFailure(format!("{err:#}"))
        }
    }
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Decode(_) => Self::DataIncomplete(err.to_string()),
            other => Self::ProviderUnavailable(other.to_string()),
        }
    }
}

/// One failed item (ticker, firm row, prediction) inside a batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub subject: String,
    pub error: PipelineError,
}

impl ItemFailure {
    pub fn new(subject: impl Into<String>, error: PipelineError) -> Self {
        Self {
            subject: subject.into(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn generic_storage_errors_are_persistence_failures() {
        let err = Err::<(), _>(std::io::Error::other("disk full"))
            .context("upsert analyst_snapshots failed")
            .unwrap_err();
        match PipelineError::from_storage(&err) {
            PipelineError::PersistenceFailure(detail) => {
                assert!(detail.contains("upsert analyst_snapshots failed"));
                assert!(detail.contains("disk full"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_errors_are_incomplete_data() {
        let e: PipelineError = ProviderError::Decode("missing price".into()).into();
        assert!(matches!(e, PipelineError::DataIncomplete(_)));

        let e: PipelineError = ProviderError::RateLimited.into();
        assert!(matches!(e, PipelineError::ProviderUnavailable(_)));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let v = serde_json::to_value(ItemFailure::new(
            "AAPL",
            PipelineError::ProviderUnavailable("timeout".into()),
        ))
        .unwrap();
        assert_eq!(v["subject"], "AAPL");
        assert_eq!(v["error"]["kind"], "provider_unavailable");
        assert_eq!(v["error"]["detail"], "timeout");
    }
}
