use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Acquire, PgConnection, PgPool, Postgres};
use tokio::sync::Mutex;

use super::{RelationshipLoader, SceneProvider, SimilarityStore, Transaction, TransactionManager};
use crate::{
    error::{AppError, AppResult},
    models::{
        GroupAssociation, PerformerId, Related, Scene, SceneId, ScoreBreakdown, SimilarityRecord,
        TagId,
    },
};

/// Creates a PostgreSQL connection pool
///
/// Establishes a pool of database connections for efficient reuse.
/// The pool automatically manages connection lifecycle and limits.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Applies the `scene_similarities` migrations
pub async fn run_migrations(pool: &PgPool) -> AppResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

type SceneRow = (i32, Option<String>, Option<i32>);
type SimilarityRow = (i32, i32, f64, Option<String>, DateTime<Utc>, DateTime<Utc>);

const SIMILARITY_COLUMNS: &str = "scene_id, similar_scene_id, similarity_score, \
     similarity_score_data, created_at, updated_at";

fn scene_from_row((id, title, studio_id): SceneRow) -> Scene {
    Scene {
        id: SceneId(id),
        title,
        studio_id,
        performer_ids: Related::Unloaded,
        tag_ids: Related::Unloaded,
        groups: Related::Unloaded,
    }
}

fn record_from_row(row: SimilarityRow) -> AppResult<SimilarityRecord> {
    let (scene_id, similar_scene_id, score, score_data, created_at, updated_at) = row;
    let score_data = match score_data {
        Some(data) => ScoreBreakdown::from_json(&data)?,
        None => None,
    };

    Ok(SimilarityRecord {
        scene_id: SceneId(scene_id),
        similar_scene_id: SceneId(similar_scene_id),
        score,
        score_data,
        created_at,
        updated_at,
    })
}

/// SQL shared by the pool-backed and transaction-backed implementations
mod queries {
    use super::*;

    pub async fn performer_ids(
        conn: &mut PgConnection,
        scene_id: SceneId,
    ) -> AppResult<Vec<PerformerId>> {
        let ids = sqlx::query_scalar::<_, i32>(
            "SELECT performer_id FROM performers_scenes WHERE scene_id = $1 ORDER BY performer_id",
        )
        .bind(scene_id.0)
        .fetch_all(conn)
        .await?;
        Ok(ids)
    }

    pub async fn tag_ids(conn: &mut PgConnection, scene_id: SceneId) -> AppResult<Vec<TagId>> {
        let ids = sqlx::query_scalar::<_, i32>(
            "SELECT tag_id FROM scenes_tags WHERE scene_id = $1 ORDER BY tag_id",
        )
        .bind(scene_id.0)
        .fetch_all(conn)
        .await?;
        Ok(ids)
    }

    pub async fn groups(
        conn: &mut PgConnection,
        scene_id: SceneId,
    ) -> AppResult<Vec<GroupAssociation>> {
        let rows = sqlx::query_as::<_, (i32, Option<i32>)>(
            "SELECT group_id, scene_index FROM groups_scenes WHERE scene_id = $1 \
             ORDER BY scene_index, group_id",
        )
        .bind(scene_id.0)
        .fetch_all(conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(group_id, scene_index)| GroupAssociation {
                group_id,
                scene_index,
            })
            .collect())
    }

    pub async fn find_scene(conn: &mut PgConnection, scene_id: SceneId) -> AppResult<Option<Scene>> {
        let row = sqlx::query_as::<_, SceneRow>("SELECT id, title, studio_id FROM scenes WHERE id = $1")
            .bind(scene_id.0)
            .fetch_optional(conn)
            .await?;
        Ok(row.map(scene_from_row))
    }

    pub async fn all_scenes(conn: &mut PgConnection) -> AppResult<Vec<Scene>> {
        let rows = sqlx::query_as::<_, SceneRow>("SELECT id, title, studio_id FROM scenes ORDER BY id")
            .fetch_all(conn)
            .await?;
        Ok(rows.into_iter().map(scene_from_row).collect())
    }

    /// Loads every scene and its join tables with four queries in total
    pub async fn all_scenes_with_relationships(conn: &mut PgConnection) -> AppResult<Vec<Scene>> {
        let scenes = all_scenes(&mut *conn).await?;

        let mut performers: HashMap<i32, BTreeSet<PerformerId>> = HashMap::new();
        for (scene_id, performer_id) in sqlx::query_as::<_, (i32, i32)>(
            "SELECT scene_id, performer_id FROM performers_scenes",
        )
        .fetch_all(&mut *conn)
        .await?
        {
            performers.entry(scene_id).or_default().insert(performer_id);
        }

        let mut tags: HashMap<i32, BTreeSet<TagId>> = HashMap::new();
        for (scene_id, tag_id) in
            sqlx::query_as::<_, (i32, i32)>("SELECT scene_id, tag_id FROM scenes_tags")
                .fetch_all(&mut *conn)
                .await?
        {
            tags.entry(scene_id).or_default().insert(tag_id);
        }

        let mut groups: HashMap<i32, Vec<GroupAssociation>> = HashMap::new();
        for (scene_id, group_id, scene_index) in sqlx::query_as::<_, (i32, i32, Option<i32>)>(
            "SELECT scene_id, group_id, scene_index FROM groups_scenes \
             ORDER BY scene_id, scene_index, group_id",
        )
        .fetch_all(&mut *conn)
        .await?
        {
            groups.entry(scene_id).or_default().push(GroupAssociation {
                group_id,
                scene_index,
            });
        }

        Ok(scenes
            .into_iter()
            .map(|mut scene| {
                let id = scene.id.0;
                scene.performer_ids = Related::Loaded(performers.remove(&id).unwrap_or_default());
                scene.tag_ids = Related::Loaded(tags.remove(&id).unwrap_or_default());
                scene.groups = Related::Loaded(groups.remove(&id).unwrap_or_default());
                scene
            })
            .collect())
    }

    pub async fn upsert(conn: &mut PgConnection, record: &SimilarityRecord) -> AppResult<()> {
        let score_data = record
            .score_data
            .as_ref()
            .map(ScoreBreakdown::to_json)
            .transpose()?;

        sqlx::query(&format!(
            "INSERT INTO scene_similarities ({}) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (scene_id, similar_scene_id) DO UPDATE SET \
             similarity_score = EXCLUDED.similarity_score, \
             similarity_score_data = EXCLUDED.similarity_score_data, \
             updated_at = EXCLUDED.updated_at",
            SIMILARITY_COLUMNS
        ))
        .bind(record.scene_id.0)
        .bind(record.similar_scene_id.0)
        .bind(record.score)
        .bind(score_data)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(conn)
        .await
        .map_err(|e| AppError::Persistence(format!("upserting scene similarity: {}", e)))?;

        Ok(())
    }

    /// Both directions of a pair; callers supply the enclosing transaction
    pub async fn upsert_symmetric(
        conn: &mut PgConnection,
        record: &SimilarityRecord,
    ) -> AppResult<()> {
        upsert(&mut *conn, record).await?;
        if record.scene_id != record.similar_scene_id {
            upsert(&mut *conn, &record.mirrored()).await?;
        }
        Ok(())
    }

    pub async fn delete_pair(
        conn: &mut PgConnection,
        scene_id: SceneId,
        similar_scene_id: SceneId,
    ) -> AppResult<()> {
        sqlx::query("DELETE FROM scene_similarities WHERE scene_id = $1 AND similar_scene_id = $2")
            .bind(scene_id.0)
            .bind(similar_scene_id.0)
            .execute(conn)
            .await
            .map_err(|e| {
                AppError::Persistence(format!(
                    "deleting scene similarity {}-{}: {}",
                    scene_id, similar_scene_id, e
                ))
            })?;
        Ok(())
    }

    pub async fn delete_by_scene(conn: &mut PgConnection, scene_id: SceneId) -> AppResult<()> {
        sqlx::query("DELETE FROM scene_similarities WHERE scene_id = $1")
            .bind(scene_id.0)
            .execute(conn)
            .await
            .map_err(|e| {
                AppError::Persistence(format!(
                    "deleting scene similarities for scene {}: {}",
                    scene_id, e
                ))
            })?;
        Ok(())
    }

    pub async fn delete_involving_scene(
        conn: &mut PgConnection,
        scene_id: SceneId,
    ) -> AppResult<()> {
        sqlx::query("DELETE FROM scene_similarities WHERE scene_id = $1 OR similar_scene_id = $1")
            .bind(scene_id.0)
            .execute(conn)
            .await
            .map_err(|e| {
                AppError::Persistence(format!(
                    "deleting scene similarities involving scene {}: {}",
                    scene_id, e
                ))
            })?;
        Ok(())
    }

    pub async fn find_by_pair(
        conn: &mut PgConnection,
        scene_id: SceneId,
        similar_scene_id: SceneId,
    ) -> AppResult<Option<SimilarityRecord>> {
        let row = sqlx::query_as::<_, SimilarityRow>(&format!(
            "SELECT {} FROM scene_similarities WHERE scene_id = $1 AND similar_scene_id = $2",
            SIMILARITY_COLUMNS
        ))
        .bind(scene_id.0)
        .bind(similar_scene_id.0)
        .fetch_optional(conn)
        .await?;

        row.map(record_from_row).transpose()
    }

    pub async fn find_similar(
        conn: &mut PgConnection,
        scene_id: SceneId,
        limit: usize,
    ) -> AppResult<Vec<SimilarityRecord>> {
        // LIMIT NULL means no limit in PostgreSQL
        let limit = (limit > 0).then_some(limit as i64);
        let rows = sqlx::query_as::<_, SimilarityRow>(&format!(
            "SELECT {} FROM scene_similarities WHERE scene_id = $1 \
             ORDER BY similarity_score DESC, similar_scene_id LIMIT $2",
            SIMILARITY_COLUMNS
        ))
        .bind(scene_id.0)
        .bind(limit)
        .fetch_all(conn)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn count(conn: &mut PgConnection) -> AppResult<usize> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM scene_similarities")
            .fetch_one(conn)
            .await?;
        Ok(count as usize)
    }
}

/// Pool-backed storage; each call runs on its own pooled connection
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RelationshipLoader for PgDatabase {
    async fn performer_ids(&self, scene_id: SceneId) -> AppResult<Vec<PerformerId>> {
        let mut conn = self.pool.acquire().await?;
        queries::performer_ids(&mut conn, scene_id).await
    }

    async fn tag_ids(&self, scene_id: SceneId) -> AppResult<Vec<TagId>> {
        let mut conn = self.pool.acquire().await?;
        queries::tag_ids(&mut conn, scene_id).await
    }

    async fn groups(&self, scene_id: SceneId) -> AppResult<Vec<GroupAssociation>> {
        let mut conn = self.pool.acquire().await?;
        queries::groups(&mut conn, scene_id).await
    }
}

#[async_trait]
impl SceneProvider for PgDatabase {
    async fn find(&self, scene_id: SceneId) -> AppResult<Option<Scene>> {
        let mut conn = self.pool.acquire().await?;
        queries::find_scene(&mut conn, scene_id).await
    }

    async fn all(&self) -> AppResult<Vec<Scene>> {
        let mut conn = self.pool.acquire().await?;
        queries::all_scenes(&mut conn).await
    }

    async fn all_with_relationships(&self) -> AppResult<Vec<Scene>> {
        let mut conn = self.pool.acquire().await?;
        queries::all_scenes_with_relationships(&mut conn).await
    }
}

#[async_trait]
impl SimilarityStore for PgDatabase {
    async fn upsert(&self, record: &SimilarityRecord) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        queries::upsert(&mut conn, record).await
    }

    /// Writes both directions in one short transaction
    async fn upsert_symmetric(&self, record: &SimilarityRecord) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        queries::upsert_symmetric(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_pair(&self, scene_id: SceneId, similar_scene_id: SceneId) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        queries::delete_pair(&mut conn, scene_id, similar_scene_id).await
    }

    async fn delete_by_scene(&self, scene_id: SceneId) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        queries::delete_by_scene(&mut conn, scene_id).await
    }

    async fn delete_involving_scene(&self, scene_id: SceneId) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        queries::delete_involving_scene(&mut conn, scene_id).await
    }

    async fn find_by_pair(
        &self,
        scene_id: SceneId,
        similar_scene_id: SceneId,
    ) -> AppResult<Option<SimilarityRecord>> {
        let mut conn = self.pool.acquire().await?;
        queries::find_by_pair(&mut conn, scene_id, similar_scene_id).await
    }

    async fn find_similar(
        &self,
        scene_id: SceneId,
        limit: usize,
    ) -> AppResult<Vec<SimilarityRecord>> {
        let mut conn = self.pool.acquire().await?;
        queries::find_similar(&mut conn, scene_id, limit).await
    }

    async fn count(&self) -> AppResult<usize> {
        let mut conn = self.pool.acquire().await?;
        queries::count(&mut conn).await
    }
}

#[async_trait]
impl TransactionManager for PgDatabase {
    async fn begin(&self) -> AppResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction {
            tx: Mutex::new(tx),
            aborted: AtomicBool::new(false),
        }))
    }
}

/// A PostgreSQL transaction exposing the storage contracts
///
/// Statements are serialized through a mutex because the underlying connection
/// can only run one query at a time. A failed statement leaves a PostgreSQL
/// transaction aborted, so any failure outside a savepoint is remembered and
/// turns the eventual commit into an error.
pub struct PgTransaction {
    tx: Mutex<sqlx::Transaction<'static, Postgres>>,
    aborted: AtomicBool,
}

impl PgTransaction {
    fn track<T>(&self, result: AppResult<T>) -> AppResult<T> {
        if result.is_err() {
            self.aborted.store(true, Ordering::SeqCst);
        }
        result
    }
}

#[async_trait]
impl RelationshipLoader for PgTransaction {
    async fn performer_ids(&self, scene_id: SceneId) -> AppResult<Vec<PerformerId>> {
        let mut tx = self.tx.lock().await;
        self.track(queries::performer_ids(&mut tx, scene_id).await)
    }

    async fn tag_ids(&self, scene_id: SceneId) -> AppResult<Vec<TagId>> {
        let mut tx = self.tx.lock().await;
        self.track(queries::tag_ids(&mut tx, scene_id).await)
    }

    async fn groups(&self, scene_id: SceneId) -> AppResult<Vec<GroupAssociation>> {
        let mut tx = self.tx.lock().await;
        self.track(queries::groups(&mut tx, scene_id).await)
    }
}

#[async_trait]
impl SceneProvider for PgTransaction {
    async fn find(&self, scene_id: SceneId) -> AppResult<Option<Scene>> {
        let mut tx = self.tx.lock().await;
        self.track(queries::find_scene(&mut tx, scene_id).await)
    }

    async fn all(&self) -> AppResult<Vec<Scene>> {
        let mut tx = self.tx.lock().await;
        self.track(queries::all_scenes(&mut tx).await)
    }

    async fn all_with_relationships(&self) -> AppResult<Vec<Scene>> {
        let mut tx = self.tx.lock().await;
        self.track(queries::all_scenes_with_relationships(&mut tx).await)
    }
}

#[async_trait]
impl SimilarityStore for PgTransaction {
    async fn upsert(&self, record: &SimilarityRecord) -> AppResult<()> {
        let mut tx = self.tx.lock().await;
        self.track(queries::upsert(&mut tx, record).await)
    }

    /// Writes both directions under a savepoint
    ///
    /// A failed write rolls back to the savepoint, leaving the enclosing
    /// transaction usable for the rest of the batch.
    async fn upsert_symmetric(&self, record: &SimilarityRecord) -> AppResult<()> {
        let mut tx = self.tx.lock().await;
        let mut savepoint = self.track(Acquire::begin(&mut *tx).await.map_err(AppError::from))?;

        match queries::upsert_symmetric(&mut savepoint, record).await {
            Ok(()) => self.track(savepoint.commit().await.map_err(AppError::from)),
            Err(err) => {
                self.track(savepoint.rollback().await.map_err(AppError::from))?;
                Err(err)
            }
        }
    }

    async fn delete_pair(&self, scene_id: SceneId, similar_scene_id: SceneId) -> AppResult<()> {
        let mut tx = self.tx.lock().await;
        self.track(queries::delete_pair(&mut tx, scene_id, similar_scene_id).await)
    }

    async fn delete_by_scene(&self, scene_id: SceneId) -> AppResult<()> {
        let mut tx = self.tx.lock().await;
        self.track(queries::delete_by_scene(&mut tx, scene_id).await)
    }

    async fn delete_involving_scene(&self, scene_id: SceneId) -> AppResult<()> {
        let mut tx = self.tx.lock().await;
        self.track(queries::delete_involving_scene(&mut tx, scene_id).await)
    }

    async fn find_by_pair(
        &self,
        scene_id: SceneId,
        similar_scene_id: SceneId,
    ) -> AppResult<Option<SimilarityRecord>> {
        let mut tx = self.tx.lock().await;
        self.track(queries::find_by_pair(&mut tx, scene_id, similar_scene_id).await)
    }

    async fn find_similar(
        &self,
        scene_id: SceneId,
        limit: usize,
    ) -> AppResult<Vec<SimilarityRecord>> {
        let mut tx = self.tx.lock().await;
        self.track(queries::find_similar(&mut tx, scene_id, limit).await)
    }

    async fn count(&self) -> AppResult<usize> {
        let mut tx = self.tx.lock().await;
        self.track(queries::count(&mut tx).await)
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    fn scenes(&self) -> &dyn SceneProvider {
        self
    }

    fn similarities(&self) -> &dyn SimilarityStore {
        self
    }

    /// Commits, unless an earlier statement aborted the transaction
    ///
    /// PostgreSQL answers `COMMIT` on an aborted transaction with a silent
    /// rollback, so that case is rolled back here and reported as an error.
    async fn commit(self: Box<Self>) -> AppResult<()> {
        let this = *self;
        let tx = this.tx.into_inner();

        if this.aborted.load(Ordering::SeqCst) {
            tx.rollback().await?;
            return Err(AppError::Persistence(
                "transaction aborted by an earlier failed statement".to_string(),
            ));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        let this = *self;
        this.tx.into_inner().rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_from_row_is_unloaded() {
        let scene = scene_from_row((4, Some("Opening".to_string()), Some(2)));
        assert_eq!(scene.id, SceneId(4));
        assert_eq!(scene.studio_id, Some(2));
        assert!(!scene.is_hydrated());
    }

    #[test]
    fn test_record_from_row_parses_score_data() {
        let now = Utc::now();
        let breakdown = ScoreBreakdown {
            performers: 0.1,
            tags: 0.32,
            studio: 0.1,
            total: 0.52,
            ..Default::default()
        };
        let row = (1, 2, 0.52, Some(breakdown.to_json().unwrap()), now, now);

        let record = record_from_row(row).unwrap();
        assert_eq!(record.key(), (SceneId(1), SceneId(2)));
        assert_eq!(record.score_data, Some(breakdown));
    }

    #[test]
    fn test_record_from_row_without_score_data() {
        let now = Utc::now();
        let record = record_from_row((1, 2, 0.3, None, now, now)).unwrap();
        assert_eq!(record.score_data, None);
    }

    #[test]
    fn test_record_from_row_rejects_corrupt_score_data() {
        let now = Utc::now();
        let result = record_from_row((1, 2, 0.3, Some("[".to_string()), now, now));
        assert!(result.is_err());
    }
}
