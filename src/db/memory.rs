//! In-process implementation of the storage contracts
//!
//! Scenes and similarity records live in ordered maps behind a
//! `tokio::sync::RwLock`. Transactions stage their writes and apply them to the
//! shared maps in one step on commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{RelationshipLoader, SceneProvider, SimilarityStore, Transaction, TransactionManager};
use crate::{
    error::{AppError, AppResult},
    models::{GroupAssociation, PerformerId, Related, Scene, SceneId, SimilarityRecord, TagId},
};

type RecordMap = BTreeMap<(SceneId, SceneId), SimilarityRecord>;

#[derive(Default)]
struct MemoryState {
    scenes: BTreeMap<SceneId, Scene>,
    similarities: RecordMap,
}

/// Shared in-memory database holding scenes and similarity records
///
/// Cloning is cheap and every clone sees the same data.
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    inner: Arc<RwLock<MemoryState>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a scene, treating any unloaded relationship as empty
    pub async fn insert_scene(&self, scene: Scene) {
        let scene = scene.hydrated();
        self.inner.write().await.scenes.insert(scene.id, scene);
    }

    pub async fn insert_scenes(&self, scenes: impl IntoIterator<Item = Scene>) {
        let mut state = self.inner.write().await;
        for scene in scenes {
            let scene = scene.hydrated();
            state.scenes.insert(scene.id, scene);
        }
    }

    /// Every stored similarity record in pair order
    pub async fn records(&self) -> Vec<SimilarityRecord> {
        self.inner.read().await.similarities.values().cloned().collect()
    }

    async fn stored_scene<T>(
        &self,
        scene_id: SceneId,
        extract: impl FnOnce(&Scene) -> T,
    ) -> AppResult<T> {
        let state = self.inner.read().await;
        state
            .scenes
            .get(&scene_id)
            .map(extract)
            .ok_or_else(|| AppError::relationship_load(scene_id, "scene does not exist"))
    }
}

fn unloaded(scene: &Scene) -> Scene {
    Scene {
        performer_ids: Related::Unloaded,
        tag_ids: Related::Unloaded,
        groups: Related::Unloaded,
        ..scene.clone()
    }
}

fn upsert_into(records: &mut RecordMap, record: &SimilarityRecord) {
    match records.get_mut(&record.key()) {
        Some(existing) => {
            existing.score = record.score;
            existing.score_data = record.score_data;
            existing.updated_at = record.updated_at;
        }
        None => {
            records.insert(record.key(), record.clone());
        }
    }
}

fn similar_to(records: &RecordMap, scene_id: SceneId, limit: usize) -> Vec<SimilarityRecord> {
    let mut found: Vec<SimilarityRecord> = records
        .values()
        .filter(|r| r.scene_id == scene_id)
        .cloned()
        .collect();
    found.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if limit > 0 {
        found.truncate(limit);
    }
    found
}

#[async_trait]
impl RelationshipLoader for InMemoryDatabase {
    async fn performer_ids(&self, scene_id: SceneId) -> AppResult<Vec<PerformerId>> {
        self.stored_scene(scene_id, |s| s.performers().iter().copied().collect())
            .await
    }

    async fn tag_ids(&self, scene_id: SceneId) -> AppResult<Vec<TagId>> {
        self.stored_scene(scene_id, |s| s.tags().iter().copied().collect())
            .await
    }

    async fn groups(&self, scene_id: SceneId) -> AppResult<Vec<GroupAssociation>> {
        self.stored_scene(scene_id, |s| s.groups.loaded().cloned().unwrap_or_default())
            .await
    }
}

#[async_trait]
impl SceneProvider for InMemoryDatabase {
    async fn find(&self, scene_id: SceneId) -> AppResult<Option<Scene>> {
        Ok(self.inner.read().await.scenes.get(&scene_id).map(unloaded))
    }

    async fn all(&self) -> AppResult<Vec<Scene>> {
        Ok(self.inner.read().await.scenes.values().map(unloaded).collect())
    }

    async fn all_with_relationships(&self) -> AppResult<Vec<Scene>> {
        Ok(self.inner.read().await.scenes.values().cloned().collect())
    }
}

#[async_trait]
impl SimilarityStore for InMemoryDatabase {
    async fn upsert(&self, record: &SimilarityRecord) -> AppResult<()> {
        upsert_into(&mut self.inner.write().await.similarities, record);
        Ok(())
    }

    async fn upsert_symmetric(&self, record: &SimilarityRecord) -> AppResult<()> {
        let mut state = self.inner.write().await;
        upsert_into(&mut state.similarities, record);
        upsert_into(&mut state.similarities, &record.mirrored());
        Ok(())
    }

    async fn delete_pair(&self, scene_id: SceneId, similar_scene_id: SceneId) -> AppResult<()> {
        self.inner
            .write()
            .await
            .similarities
            .remove(&(scene_id, similar_scene_id));
        Ok(())
    }

    async fn delete_by_scene(&self, scene_id: SceneId) -> AppResult<()> {
        self.inner
            .write()
            .await
            .similarities
            .retain(|(first, _), _| *first != scene_id);
        Ok(())
    }

    async fn delete_involving_scene(&self, scene_id: SceneId) -> AppResult<()> {
        self.inner
            .write()
            .await
            .similarities
            .retain(|(first, second), _| *first != scene_id && *second != scene_id);
        Ok(())
    }

    async fn find_by_pair(
        &self,
        scene_id: SceneId,
        similar_scene_id: SceneId,
    ) -> AppResult<Option<SimilarityRecord>> {
        let state = self.inner.read().await;
        Ok(state.similarities.get(&(scene_id, similar_scene_id)).cloned())
    }

    async fn find_similar(
        &self,
        scene_id: SceneId,
        limit: usize,
    ) -> AppResult<Vec<SimilarityRecord>> {
        let state = self.inner.read().await;
        Ok(similar_to(&state.similarities, scene_id, limit))
    }

    async fn count(&self) -> AppResult<usize> {
        Ok(self.inner.read().await.similarities.len())
    }
}

#[async_trait]
impl TransactionManager for InMemoryDatabase {
    async fn begin(&self) -> AppResult<Box<dyn Transaction>> {
        Ok(Box::new(InMemoryTransaction {
            db: self.clone(),
            staged: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Upsert(SimilarityRecord),
    DeletePair(SceneId, SceneId),
    DeleteByScene(SceneId),
    DeleteInvolving(SceneId),
}

impl StagedWrite {
    fn apply(&self, records: &mut RecordMap) {
        match self {
            StagedWrite::Upsert(record) => upsert_into(records, record),
            StagedWrite::DeletePair(a, b) => {
                records.remove(&(*a, *b));
            }
            StagedWrite::DeleteByScene(id) => records.retain(|(first, _), _| first != id),
            StagedWrite::DeleteInvolving(id) => {
                records.retain(|(first, second), _| first != id && second != id)
            }
        }
    }
}

/// Transaction over an [`InMemoryDatabase`]
///
/// Writes are staged until commit. Reads through the transaction see the
/// committed records with the staged writes applied on top.
pub struct InMemoryTransaction {
    db: InMemoryDatabase,
    staged: Mutex<Vec<StagedWrite>>,
}

impl InMemoryTransaction {
    async fn stage(&self, write: StagedWrite) {
        self.staged.lock().await.push(write);
    }

    async fn view(&self) -> RecordMap {
        let mut records = self.db.inner.read().await.similarities.clone();
        for write in self.staged.lock().await.iter() {
            write.apply(&mut records);
        }
        records
    }
}

#[async_trait]
impl SimilarityStore for InMemoryTransaction {
    async fn upsert(&self, record: &SimilarityRecord) -> AppResult<()> {
        self.stage(StagedWrite::Upsert(record.clone())).await;
        Ok(())
    }

    async fn upsert_symmetric(&self, record: &SimilarityRecord) -> AppResult<()> {
        let mut staged = self.staged.lock().await;
        staged.push(StagedWrite::Upsert(record.clone()));
        staged.push(StagedWrite::Upsert(record.mirrored()));
        Ok(())
    }

    async fn delete_pair(&self, scene_id: SceneId, similar_scene_id: SceneId) -> AppResult<()> {
        self.stage(StagedWrite::DeletePair(scene_id, similar_scene_id))
            .await;
        Ok(())
    }

    async fn delete_by_scene(&self, scene_id: SceneId) -> AppResult<()> {
        self.stage(StagedWrite::DeleteByScene(scene_id)).await;
        Ok(())
    }

    async fn delete_involving_scene(&self, scene_id: SceneId) -> AppResult<()> {
        self.stage(StagedWrite::DeleteInvolving(scene_id)).await;
        Ok(())
    }

    async fn find_by_pair(
        &self,
        scene_id: SceneId,
        similar_scene_id: SceneId,
    ) -> AppResult<Option<SimilarityRecord>> {
        Ok(self.view().await.remove(&(scene_id, similar_scene_id)))
    }

    async fn find_similar(
        &self,
        scene_id: SceneId,
        limit: usize,
    ) -> AppResult<Vec<SimilarityRecord>> {
        Ok(similar_to(&self.view().await, scene_id, limit))
    }

    async fn count(&self) -> AppResult<usize> {
        Ok(self.view().await.len())
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn scenes(&self) -> &dyn SceneProvider {
        &self.db
    }

    fn similarities(&self) -> &dyn SimilarityStore {
        self
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let this = *self;
        let staged = this.staged.into_inner();
        let mut state = this.db.inner.write().await;
        for write in &staged {
            write.apply(&mut state.similarities);
        }
        tracing::debug!(writes = staged.len(), "In-memory transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        let discarded = self.staged.into_inner().len();
        tracing::debug!(discarded, "In-memory transaction rolled back");
        Ok(())
    }
}
