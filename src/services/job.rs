use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    db::TransactionManager,
    error::AppResult,
    models::SceneId,
    services::{observer::RecomputeReport, recompute::SimilarityCalculator},
};

/// Processed and total counters for a running job
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicUsize,
    processed: AtomicUsize,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn set_processed(&self, processed: usize) {
        self.processed.store(processed, Ordering::Relaxed);
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    /// Completed share in [0, 1]; zero until a total is known
    pub fn fraction(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.processed() as f64 / total as f64).min(1.0),
        }
    }
}

/// Recomputes similarities for one scene, or for every scene when no id is given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimilarityJob {
    scene_id: Option<SceneId>,
}

impl SimilarityJob {
    pub fn new(scene_id: Option<SceneId>) -> Self {
        Self { scene_id }
    }

    pub fn for_scene(scene_id: SceneId) -> Self {
        Self::new(Some(scene_id))
    }

    pub fn for_all() -> Self {
        Self::new(None)
    }

    pub fn scene_id(&self) -> Option<SceneId> {
        self.scene_id
    }

    pub fn description(&self) -> String {
        match self.scene_id {
            Some(id) => format!("Recalculating similarities for scene {}", id),
            None => "Recalculating all scene similarities".to_string(),
        }
    }

    /// Runs the job to completion
    ///
    /// Returns `None` when the requested scene no longer exists.
    pub async fn execute(
        &self,
        calculator: &SimilarityCalculator,
        transactions: &dyn TransactionManager,
        progress: &Progress,
    ) -> AppResult<Option<RecomputeReport>> {
        match self.scene_id {
            Some(scene_id) => self.execute_for_scene(calculator, scene_id, progress).await,
            None => {
                tracing::info!("Recalculating all scene similarities");
                progress.set_processed(0);

                let scenes = calculator.load_scenes(transactions).await?;
                progress.set_total(scenes.len());

                let report = calculator.recompute_batches(transactions, &scenes).await?;

                progress.set_processed(report.scenes);
                tracing::info!(
                    scenes = report.scenes,
                    stored = report.stored,
                    "Completed similarity recalculation for all scenes"
                );
                Ok(Some(report))
            }
        }
    }

    async fn execute_for_scene(
        &self,
        calculator: &SimilarityCalculator,
        scene_id: SceneId,
        progress: &Progress,
    ) -> AppResult<Option<RecomputeReport>> {
        tracing::info!(scene_id = %scene_id, "Recalculating similarities for scene");
        progress.set_total(1);
        progress.set_processed(0);

        if calculator.scenes().find(scene_id).await?.is_none() {
            tracing::warn!(scene_id = %scene_id, "Scene not found, skipping similarity recalculation");
            progress.set_processed(1);
            return Ok(None);
        }

        let candidates = calculator.scenes().all().await?;
        let report = calculator.recompute_for_scene(scene_id, candidates).await?;

        progress.set_processed(1);
        tracing::info!(
            scene_id = %scene_id,
            stored = report.stored,
            "Completed similarity recalculation for scene"
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{InMemoryDatabase, SimilarityStore, Transaction},
        error::AppError,
        models::{Scene, SimilarityWeights},
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Serves the first transaction, then refuses to open more
    struct SingleUse {
        db: InMemoryDatabase,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl TransactionManager for SingleUse {
        async fn begin(&self) -> AppResult<Box<dyn Transaction>> {
            if self.opened.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(AppError::Persistence("pool exhausted".to_string()));
            }
            self.db.begin().await
        }
    }

    async fn seeded() -> (InMemoryDatabase, SimilarityCalculator) {
        let db = InMemoryDatabase::new();
        db.insert_scenes([
            Scene::new(1).with_performers([1, 2]).with_tags([10, 20, 30]).with_studio(5),
            Scene::new(2).with_performers([2, 3]).with_tags([10, 20]).with_studio(5),
            Scene::new(3).with_performers([9]).with_tags([90]).with_studio(7),
        ])
        .await;

        let calc = SimilarityCalculator::new(
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            SimilarityWeights::default(),
        );
        (db, calc)
    }

    #[test]
    fn test_description() {
        assert_eq!(
            SimilarityJob::for_scene(SceneId(4)).description(),
            "Recalculating similarities for scene 4"
        );
        assert_eq!(
            SimilarityJob::for_all().description(),
            "Recalculating all scene similarities"
        );
    }

    #[test]
    fn test_progress_fraction() {
        let progress = Progress::new();
        assert_eq!(progress.fraction(), 0.0);

        progress.set_total(4);
        progress.set_processed(1);
        assert_eq!(progress.fraction(), 0.25);
    }

    #[tokio::test]
    async fn test_missing_scene_finishes_without_work() {
        let (db, calc) = seeded().await;
        let progress = Progress::new();

        let report = SimilarityJob::for_scene(SceneId(99))
            .execute(&calc, &db, &progress)
            .await
            .unwrap();

        assert!(report.is_none());
        assert_eq!(progress.processed(), 1);
        assert_eq!(db.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scene_job_recomputes_one_scene() {
        let (db, calc) = seeded().await;
        let progress = Progress::new();

        let report = SimilarityJob::for_scene(SceneId(2))
            .execute(&calc, &db, &progress)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.pairs_compared, 2);
        assert_eq!(report.stored, 1);
        assert_eq!(progress.fraction(), 1.0);

        let similar = db.find_similar(SceneId(2), 0).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].similar_scene_id, SceneId(1));
    }

    #[tokio::test]
    async fn test_full_job_runs_batched_pass() {
        let (db, calc) = seeded().await;
        let progress = Progress::new();

        let report = SimilarityJob::for_all()
            .execute(&calc, &db, &progress)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.scenes, 3);
        assert_eq!(report.batches, 1);
        assert_eq!(progress.total(), 3);
        assert_eq!(db.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_full_job_knows_total_before_writing() {
        let (db, calc) = seeded().await;
        let progress = Progress::new();
        let transactions = SingleUse {
            db: db.clone(),
            opened: AtomicUsize::new(0),
        };

        let result = SimilarityJob::for_all()
            .execute(&calc, &transactions, &progress)
            .await;

        assert!(matches!(result, Err(AppError::BatchFailed { start: 0, end: 3, .. })));
        assert_eq!(progress.total(), 3);
        assert_eq!(progress.processed(), 0);
        assert_eq!(progress.fraction(), 0.0);
    }
}
