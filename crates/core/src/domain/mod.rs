pub mod contract;
pub mod prediction;

pub use contract::{dedupe_by_firm, NormalizedRating};
pub use prediction::{
    firm_key, AnalystScore, AnalystSnapshot, ConsensusSnapshot, HistoryPeriod, Outcome,
    PredictionStatus, RatingAction, SnapshotKey,
};
