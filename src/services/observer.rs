use std::fmt;

use uuid::Uuid;

use crate::{
    error::AppError,
    models::SceneId,
    services::batching::BatchInfo,
};

/// Identifier attached to one recompute pass for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a pair was left out of a pass
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// One side of the pair could not be hydrated
    RelationshipLoad(String),
    /// The score came out non-finite
    ScoreComputation(String),
    /// The record could not be written
    Persistence(String),
}

impl SkipReason {
    /// Classifies a pair-level error
    pub fn from_error(err: &AppError) -> Self {
        match err {
            AppError::RelationshipLoad { .. } => SkipReason::RelationshipLoad(err.to_string()),
            AppError::ScoreComputation { .. } => SkipReason::ScoreComputation(err.to_string()),
            other => SkipReason::Persistence(other.to_string()),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::RelationshipLoad(reason) => write!(f, "relationship load: {}", reason),
            SkipReason::ScoreComputation(reason) => write!(f, "score computation: {}", reason),
            SkipReason::Persistence(reason) => write!(f, "persistence: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairStatus {
    Stored,
    BelowThreshold,
    Skipped(SkipReason),
}

/// Result of evaluating one scene pair
#[derive(Debug, Clone, PartialEq)]
pub struct PairOutcome {
    pub scene_id: SceneId,
    pub similar_scene_id: SceneId,
    /// Absent when the pair was skipped before scoring
    pub score: Option<f64>,
    pub status: PairStatus,
}

impl PairOutcome {
    pub fn stored(scene_id: SceneId, similar_scene_id: SceneId, score: f64) -> Self {
        Self {
            scene_id,
            similar_scene_id,
            score: Some(score),
            status: PairStatus::Stored,
        }
    }

    pub fn below_threshold(scene_id: SceneId, similar_scene_id: SceneId, score: f64) -> Self {
        Self {
            scene_id,
            similar_scene_id,
            score: Some(score),
            status: PairStatus::BelowThreshold,
        }
    }

    pub fn skipped(
        scene_id: SceneId,
        similar_scene_id: SceneId,
        score: Option<f64>,
        reason: SkipReason,
    ) -> Self {
        Self {
            scene_id,
            similar_scene_id,
            score,
            status: PairStatus::Skipped(reason),
        }
    }

    pub fn is_stored(&self) -> bool {
        self.status == PairStatus::Stored
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, PairStatus::Skipped(_))
    }
}

/// Tally of one recompute pass
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeReport {
    pub run_id: RunId,
    /// Scenes taking part in the pass
    pub scenes: usize,
    /// Pairs evaluated, whatever their outcome
    pub pairs_compared: usize,
    pub stored: usize,
    pub below_threshold: usize,
    /// Batches committed; zero for unbatched passes
    pub batches: usize,
    pub skipped: Vec<PairOutcome>,
}

impl RecomputeReport {
    pub fn new(run_id: RunId, scenes: usize) -> Self {
        Self {
            run_id,
            scenes,
            pairs_compared: 0,
            stored: 0,
            below_threshold: 0,
            batches: 0,
            skipped: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: PairOutcome) {
        self.pairs_compared += 1;
        match outcome.status {
            PairStatus::Stored => self.stored += 1,
            PairStatus::BelowThreshold => self.below_threshold += 1,
            PairStatus::Skipped(_) => self.skipped.push(outcome),
        }
    }

    /// Folds a committed batch into the pass totals
    pub fn absorb_batch(&mut self, batch: RecomputeReport) {
        self.pairs_compared += batch.pairs_compared;
        self.stored += batch.stored;
        self.below_threshold += batch.below_threshold;
        self.skipped.extend(batch.skipped);
        self.batches += 1;
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Hook notified as a recompute pass progresses
///
/// Every method defaults to doing nothing.
pub trait RecomputeObserver: Send + Sync {
    fn on_pair(&self, _run_id: RunId, _outcome: &PairOutcome) {}

    fn on_batch_start(&self, _run_id: RunId, _batch: &BatchInfo) {}

    fn on_batch_complete(&self, _run_id: RunId, _batch: &BatchInfo, _report: &RecomputeReport) {}

    fn on_batch_failed(&self, _run_id: RunId, _batch: &BatchInfo, _error: &AppError) {}

    fn on_pass_complete(&self, _report: &RecomputeReport) {}
}

/// Observer that logs through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RecomputeObserver for TracingObserver {
    fn on_pair(&self, run_id: RunId, outcome: &PairOutcome) {
        match &outcome.status {
            PairStatus::Stored => tracing::debug!(
                %run_id,
                scene_id = %outcome.scene_id,
                similar_scene_id = %outcome.similar_scene_id,
                score = outcome.score,
                "Stored similarity"
            ),
            PairStatus::BelowThreshold => tracing::trace!(
                %run_id,
                scene_id = %outcome.scene_id,
                similar_scene_id = %outcome.similar_scene_id,
                score = outcome.score,
                "Similarity below threshold"
            ),
            PairStatus::Skipped(reason) => tracing::warn!(
                %run_id,
                scene_id = %outcome.scene_id,
                similar_scene_id = %outcome.similar_scene_id,
                %reason,
                "Skipping scene pair"
            ),
        }
    }

    fn on_batch_start(&self, run_id: RunId, batch: &BatchInfo) {
        tracing::debug!(
            %run_id,
            batch = batch.index,
            start = batch.start,
            end = batch.end,
            "Processing batch"
        );
    }

    fn on_batch_complete(&self, run_id: RunId, batch: &BatchInfo, report: &RecomputeReport) {
        tracing::info!(
            %run_id,
            batch = batch.index,
            start = batch.start,
            end = batch.end,
            stored = report.stored,
            skipped = report.skipped_count(),
            "Committed batch"
        );
    }

    fn on_batch_failed(&self, run_id: RunId, batch: &BatchInfo, error: &AppError) {
        tracing::error!(
            %run_id,
            batch = batch.index,
            start = batch.start,
            end = batch.end,
            error = %error,
            "Batch rolled back"
        );
    }

    fn on_pass_complete(&self, report: &RecomputeReport) {
        tracing::info!(
            run_id = %report.run_id,
            scenes = report.scenes,
            pairs = report.pairs_compared,
            stored = report.stored,
            below_threshold = report.below_threshold,
            skipped = report.skipped_count(),
            batches = report.batches,
            "Similarity recompute finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
        let id = RunId::new();
        assert_eq!(id.to_string(), id.0.to_string());
    }

    #[test]
    fn test_skip_reason_classification() {
        let load = AppError::relationship_load(SceneId(1), "gone");
        assert!(matches!(
            SkipReason::from_error(&load),
            SkipReason::RelationshipLoad(_)
        ));

        let score = AppError::ScoreComputation {
            scene_id: SceneId(1),
            similar_scene_id: SceneId(2),
            reason: "NaN".to_string(),
        };
        assert!(matches!(
            SkipReason::from_error(&score),
            SkipReason::ScoreComputation(_)
        ));

        let write = AppError::Persistence("disk full".to_string());
        assert_eq!(
            SkipReason::from_error(&write),
            SkipReason::Persistence("Persistence error: disk full".to_string())
        );
    }

    #[test]
    fn test_report_tallies_outcomes() {
        let mut report = RecomputeReport::new(RunId::new(), 3);
        report.record(PairOutcome::stored(SceneId(1), SceneId(2), 0.5));
        report.record(PairOutcome::below_threshold(SceneId(1), SceneId(3), 0.01));
        report.record(PairOutcome::skipped(
            SceneId(2),
            SceneId(3),
            None,
            SkipReason::RelationshipLoad("timeout".to_string()),
        ));

        assert_eq!(report.pairs_compared, 3);
        assert_eq!(report.stored, 1);
        assert_eq!(report.below_threshold, 1);
        assert_eq!(report.skipped_count(), 1);
        assert!(report.skipped[0].is_skipped());
    }

    #[test]
    fn test_absorb_batch_counts_batches() {
        let run_id = RunId::new();
        let mut pass = RecomputeReport::new(run_id, 4);

        let mut batch = RecomputeReport::new(run_id, 2);
        batch.record(PairOutcome::stored(SceneId(1), SceneId(2), 0.9));
        pass.absorb_batch(batch);
        pass.absorb_batch(RecomputeReport::new(run_id, 2));

        assert_eq!(pass.batches, 2);
        assert_eq!(pass.stored, 1);
        assert_eq!(pass.pairs_compared, 1);
        assert_eq!(pass.scenes, 4);
    }
}
