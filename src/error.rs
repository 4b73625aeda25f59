use crate::models::SceneId;

/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Scene not found: {0}")]
    NotFound(SceneId),

    #[error("Failed to load relationships for scene {scene_id}: {reason}")]
    RelationshipLoad { scene_id: SceneId, reason: String },

    #[error("Failed to score scenes {scene_id} and {similar_scene_id}: {reason}")]
    ScoreComputation {
        scene_id: SceneId,
        similar_scene_id: SceneId,
        reason: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Processing batch {start}-{end} failed: {source}")]
    BatchFailed {
        start: usize,
        end: usize,
        #[source]
        source: Box<AppError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wraps a lower-level error raised while hydrating a scene
    pub fn relationship_load(scene_id: SceneId, err: impl std::fmt::Display) -> Self {
        AppError::RelationshipLoad {
            scene_id,
            reason: err.to_string(),
        }
    }

    /// Attaches the failing batch range to an error raised while processing it
    pub fn batch_failed(start: usize, end: usize, err: AppError) -> Self {
        AppError::BatchFailed {
            start,
            end,
            source: Box::new(err),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
