pub mod batching;
pub mod job;
pub mod observer;
pub mod recompute;
pub mod scorer;

pub use batching::{BatchInfo, BatchPlan, DEFAULT_BATCH_SIZE};
pub use job::{Progress, SimilarityJob};
pub use observer::{
    PairOutcome, PairStatus, RecomputeObserver, RecomputeReport, RunId, SkipReason,
    TracingObserver,
};
pub use recompute::SimilarityCalculator;
