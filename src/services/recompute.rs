//! Recompute passes that keep stored similarity records in step with scenes
//!
//! Every qualifying pair is written under both orderings, so
//! `find_similar(scene)` sees all of a scene's neighbours no matter which side
//! of the pair triggered the write.

use std::sync::Arc;

use tracing::instrument;

use crate::{
    db::{SceneProvider, SimilarityStore, Transaction, TransactionManager},
    error::{AppError, AppResult},
    models::{Scene, SceneId, ScoreBreakdown, SimilarityRecord, SimilarityWeights},
    services::{
        batching::BatchPlan,
        observer::{PairOutcome, RecomputeObserver, RecomputeReport, RunId, SkipReason, TracingObserver},
        scorer,
    },
};

/// Scores scene pairs and persists the ones that clear the threshold
pub struct SimilarityCalculator {
    scenes: Arc<dyn SceneProvider>,
    store: Arc<dyn SimilarityStore>,
    weights: SimilarityWeights,
    plan: BatchPlan,
    observer: Arc<dyn RecomputeObserver>,
}

impl SimilarityCalculator {
    pub fn new(
        scenes: Arc<dyn SceneProvider>,
        store: Arc<dyn SimilarityStore>,
        weights: SimilarityWeights,
    ) -> Self {
        Self {
            scenes,
            store,
            weights,
            plan: BatchPlan::default(),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_batch_plan(mut self, plan: BatchPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RecomputeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn weights(&self) -> &SimilarityWeights {
        &self.weights
    }

    pub fn batch_plan(&self) -> BatchPlan {
        self.plan
    }

    pub fn scenes(&self) -> &dyn SceneProvider {
        self.scenes.as_ref()
    }

    /// Scores a pair, rejecting breakdowns with a non-finite component
    pub fn evaluate(&self, a: &Scene, b: &Scene) -> AppResult<ScoreBreakdown> {
        let breakdown = scorer::breakdown(a, b, &self.weights);
        let components = [
            breakdown.performers,
            breakdown.groups,
            breakdown.tags,
            breakdown.studio,
            breakdown.total,
        ];

        if components.iter().all(|c| c.is_finite()) {
            Ok(breakdown)
        } else {
            Err(AppError::ScoreComputation {
                scene_id: a.id,
                similar_scene_id: b.id,
                reason: format!("non-finite score components {:?}", components),
            })
        }
    }

    /// Scores one pair and stores it when it clears the threshold
    ///
    /// Below-threshold pairs are reported without touching the store. Scoring
    /// and write failures are returned as errors.
    #[instrument(skip_all, fields(scene_id = %a.id, similar_scene_id = %b.id))]
    pub async fn compute_and_store(&self, a: &Scene, b: &Scene) -> AppResult<PairOutcome> {
        let breakdown = self.evaluate(a, b)?;

        if !self.weights.qualifies(breakdown.total) {
            return Ok(PairOutcome::below_threshold(a.id, b.id, breakdown.total));
        }

        self.store
            .upsert_symmetric(&SimilarityRecord::new(a.id, b.id, breakdown))
            .await?;

        Ok(PairOutcome::stored(a.id, b.id, breakdown.total))
    }

    /// Rebuilds every record involving `scene_id` against `candidates`
    ///
    /// Fails when the target is missing, cannot be hydrated, or its existing
    /// records cannot be removed. Candidates that fail to hydrate or store
    /// are reported as skipped.
    #[instrument(
        skip_all,
        fields(scene_id = %scene_id, candidates = candidates.len(), run_id = tracing::field::Empty)
    )]
    pub async fn recompute_for_scene(
        &self,
        scene_id: SceneId,
        candidates: Vec<Scene>,
    ) -> AppResult<RecomputeReport> {
        let run_id = RunId::new();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let mut target = self
            .scenes
            .find(scene_id)
            .await?
            .ok_or(AppError::NotFound(scene_id))?;
        target
            .load_relationships(self.scenes.as_ref())
            .await
            .map_err(|e| hydration_error(scene_id, e))?;

        self.store.delete_involving_scene(scene_id).await?;

        let others = candidates.iter().filter(|c| c.id != scene_id).count();
        let mut report = RecomputeReport::new(run_id, others + 1);

        for mut candidate in candidates {
            if candidate.id == scene_id {
                continue;
            }

            let outcome = match candidate.load_relationships(self.scenes.as_ref()).await {
                Ok(()) => {
                    self.evaluate_pair(self.store.as_ref(), &target, &candidate)
                        .await
                }
                Err(e) => PairOutcome::skipped(
                    scene_id,
                    candidate.id,
                    None,
                    SkipReason::from_error(&hydration_error(candidate.id, e)),
                ),
            };

            self.observer.on_pair(run_id, &outcome);
            report.record(outcome);
        }

        self.observer.on_pass_complete(&report);
        Ok(report)
    }

    /// Rebuilds records for every unordered pair in `scenes`
    ///
    /// Runs in one write transaction, so a failed delete leaves the stored
    /// records untouched. Scenes are expected to be hydrated already;
    /// unloaded relationships score as empty.
    #[instrument(skip_all, fields(scenes = scenes.len(), run_id = tracing::field::Empty))]
    pub async fn recompute_all(
        &self,
        transactions: &dyn TransactionManager,
        scenes: &[Scene],
    ) -> AppResult<RecomputeReport> {
        let run_id = RunId::new();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let unhydrated = scenes.iter().filter(|s| !s.is_hydrated()).count();
        if unhydrated > 0 {
            tracing::warn!(unhydrated, "Scoring scenes with unloaded relationships");
        }

        let report = self
            .compare_in_transaction(transactions, run_id, scenes)
            .await?;

        self.observer.on_pass_complete(&report);
        Ok(report)
    }

    /// Rebuilds all records batch by batch, one transaction per batch
    ///
    /// Loads every hydrated scene, then runs [`Self::recompute_batches`].
    pub async fn recompute_all_batched(
        &self,
        transactions: &dyn TransactionManager,
    ) -> AppResult<RecomputeReport> {
        let scenes = self.load_scenes(transactions).await?;
        self.recompute_batches(transactions, &scenes).await
    }

    /// Reads every hydrated scene in its own short transaction
    pub async fn load_scenes(&self, transactions: &dyn TransactionManager) -> AppResult<Vec<Scene>> {
        let txn = transactions.begin().await?;
        let result = txn.scenes().all_with_relationships().await;

        match result {
            Ok(scenes) => {
                txn.commit().await?;
                Ok(scenes)
            }
            Err(err) => {
                rollback_quietly(txn).await;
                Err(err)
            }
        }
    }

    /// Rebuilds records for pre-loaded scenes, one transaction per batch
    ///
    /// Only pairs within the same batch are compared. A batch whose
    /// transaction cannot begin, delete or commit is rolled back and ends the
    /// pass; batches committed before it stay applied.
    #[instrument(
        skip_all,
        fields(scenes = scenes.len(), batch_size = self.plan.batch_size(), run_id = tracing::field::Empty)
    )]
    pub async fn recompute_batches(
        &self,
        transactions: &dyn TransactionManager,
        scenes: &[Scene],
    ) -> AppResult<RecomputeReport> {
        let run_id = RunId::new();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let total = scenes.len();

        if !self.plan.covers_all_pairs(total) {
            tracing::warn!(
                scenes = total,
                batch_size = self.plan.batch_size(),
                compared_pairs = self.plan.compared_pairs(total),
                total_pairs = BatchPlan::total_pairs(total),
                "Cross-batch pairs will not be compared"
            );
        }

        let mut report = RecomputeReport::new(run_id, total);

        for batch in self.plan.batches(total) {
            self.observer.on_batch_start(run_id, &batch);

            match self
                .compare_in_transaction(transactions, run_id, &scenes[batch.range()])
                .await
            {
                Ok(batch_report) => {
                    self.observer
                        .on_batch_complete(run_id, &batch, &batch_report);
                    report.absorb_batch(batch_report);
                }
                Err(err) => {
                    self.observer.on_batch_failed(run_id, &batch, &err);
                    return Err(AppError::batch_failed(batch.start, batch.end, err));
                }
            }
        }

        self.observer.on_pass_complete(&report);
        Ok(report)
    }

    /// Commits when `compare_all` succeeds and rolls back when it fails
    async fn compare_in_transaction(
        &self,
        transactions: &dyn TransactionManager,
        run_id: RunId,
        scenes: &[Scene],
    ) -> AppResult<RecomputeReport> {
        let txn = transactions.begin().await?;
        let result = self.compare_all(txn.similarities(), run_id, scenes).await;

        match result {
            Ok(report) => {
                txn.commit().await?;
                Ok(report)
            }
            Err(err) => {
                rollback_quietly(txn).await;
                Err(err)
            }
        }
    }

    /// Clears records led by each scene, then evaluates every pair i < j
    async fn compare_all(
        &self,
        store: &dyn SimilarityStore,
        run_id: RunId,
        scenes: &[Scene],
    ) -> AppResult<RecomputeReport> {
        for scene in scenes {
            store.delete_by_scene(scene.id).await?;
        }

        let mut report = RecomputeReport::new(run_id, scenes.len());

        for (i, a) in scenes.iter().enumerate() {
            for b in &scenes[i + 1..] {
                if a.id == b.id {
                    continue;
                }

                let outcome = self.evaluate_pair(store, a, b).await;
                self.observer.on_pair(run_id, &outcome);
                report.record(outcome);
            }
        }

        Ok(report)
    }

    /// Like `compute_and_store`, but folds failures into the outcome
    async fn evaluate_pair(&self, store: &dyn SimilarityStore, a: &Scene, b: &Scene) -> PairOutcome {
        let breakdown = match self.evaluate(a, b) {
            Ok(breakdown) => breakdown,
            Err(e) => return PairOutcome::skipped(a.id, b.id, None, SkipReason::from_error(&e)),
        };

        if !self.weights.qualifies(breakdown.total) {
            return PairOutcome::below_threshold(a.id, b.id, breakdown.total);
        }

        match store
            .upsert_symmetric(&SimilarityRecord::new(a.id, b.id, breakdown))
            .await
        {
            Ok(()) => PairOutcome::stored(a.id, b.id, breakdown.total),
            Err(e) => PairOutcome::skipped(
                a.id,
                b.id,
                Some(breakdown.total),
                SkipReason::from_error(&e),
            ),
        }
    }
}

async fn rollback_quietly(txn: Box<dyn Transaction>) {
    if let Err(e) = txn.rollback().await {
        tracing::warn!(error = %e, "Rollback failed");
    }
}

fn hydration_error(scene_id: SceneId, err: AppError) -> AppError {
    match err {
        AppError::RelationshipLoad { .. } => err,
        other => AppError::relationship_load(scene_id, other),
    }
}
