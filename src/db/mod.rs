//! Storage contracts for scenes and similarity records
//!
//! The recompute engine only talks to these traits. `postgres` implements them
//! over a connection pool, `memory` implements them over in-process maps for
//! tests and embedding.

use async_trait::async_trait;

use crate::{
    error::AppResult,
    models::{GroupAssociation, PerformerId, Scene, SceneId, SimilarityRecord, TagId},
};

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryDatabase, InMemoryTransaction};
pub use postgres::{create_pool, run_migrations, PgDatabase, PgTransaction};

/// Loads the join-table relationships of a single scene
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelationshipLoader: Send + Sync {
    async fn performer_ids(&self, scene_id: SceneId) -> AppResult<Vec<PerformerId>>;

    async fn tag_ids(&self, scene_id: SceneId) -> AppResult<Vec<TagId>>;

    async fn groups(&self, scene_id: SceneId) -> AppResult<Vec<GroupAssociation>>;
}

/// Source of scene snapshots
///
/// Scenes returned by `find` and `all` carry unloaded relationships; callers
/// hydrate them with [`Scene::load_relationships`]. `all_with_relationships`
/// returns fully hydrated scenes in one pass.
#[async_trait]
pub trait SceneProvider: RelationshipLoader {
    async fn find(&self, scene_id: SceneId) -> AppResult<Option<Scene>>;

    async fn all(&self) -> AppResult<Vec<Scene>>;

    async fn all_with_relationships(&self) -> AppResult<Vec<Scene>>;
}

#[cfg(test)]
mockall::mock! {
    pub SceneProvider {}

    #[async_trait]
    impl RelationshipLoader for SceneProvider {
        async fn performer_ids(&self, scene_id: SceneId) -> AppResult<Vec<PerformerId>>;
        async fn tag_ids(&self, scene_id: SceneId) -> AppResult<Vec<TagId>>;
        async fn groups(&self, scene_id: SceneId) -> AppResult<Vec<GroupAssociation>>;
    }

    #[async_trait]
    impl SceneProvider for SceneProvider {
        async fn find(&self, scene_id: SceneId) -> AppResult<Option<Scene>>;
        async fn all(&self) -> AppResult<Vec<Scene>>;
        async fn all_with_relationships(&self) -> AppResult<Vec<Scene>>;
    }
}

/// Persistence for similarity records, keyed by the ordered scene pair
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// Creates or replaces the record for `(scene_id, similar_scene_id)`
    ///
    /// Replacing keeps the original `created_at` and takes the new score,
    /// score data and `updated_at`.
    async fn upsert(&self, record: &SimilarityRecord) -> AppResult<()>;

    /// Upserts `record` and its mirror so that either both land or neither does
    ///
    /// Backends override this with an atomic write. The fallback removes the
    /// forward row again when the mirror cannot be written.
    async fn upsert_symmetric(&self, record: &SimilarityRecord) -> AppResult<()> {
        self.upsert(record).await?;

        if record.scene_id == record.similar_scene_id {
            return Ok(());
        }

        if let Err(err) = self.upsert(&record.mirrored()).await {
            if let Err(undo) = self
                .delete_pair(record.scene_id, record.similar_scene_id)
                .await
            {
                tracing::warn!(
                    scene_id = %record.scene_id,
                    similar_scene_id = %record.similar_scene_id,
                    error = %undo,
                    "Failed to remove half-written similarity"
                );
            }
            return Err(err);
        }

        Ok(())
    }

    /// Removes the record for exactly `(scene_id, similar_scene_id)`
    async fn delete_pair(&self, scene_id: SceneId, similar_scene_id: SceneId) -> AppResult<()>;

    /// Removes records whose first element is `scene_id`
    async fn delete_by_scene(&self, scene_id: SceneId) -> AppResult<()>;

    /// Removes records where `scene_id` is either element of the pair
    async fn delete_involving_scene(&self, scene_id: SceneId) -> AppResult<()>;

    async fn find_by_pair(
        &self,
        scene_id: SceneId,
        similar_scene_id: SceneId,
    ) -> AppResult<Option<SimilarityRecord>>;

    /// Records whose first element is `scene_id`, highest score first
    ///
    /// A `limit` of zero returns every record.
    async fn find_similar(&self, scene_id: SceneId, limit: usize)
        -> AppResult<Vec<SimilarityRecord>>;

    async fn count(&self) -> AppResult<usize>;
}

/// A unit of work bound to one database transaction
///
/// Reads and writes made through `scenes` and `similarities` become visible to
/// other readers only after `commit`. Dropping a transaction without
/// committing discards its writes.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn scenes(&self) -> &dyn SceneProvider;

    fn similarities(&self) -> &dyn SimilarityStore;

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}

/// Opens transactions against the backing datastore
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn Transaction>>;
}
