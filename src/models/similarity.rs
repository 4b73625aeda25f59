use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SceneId;
use crate::error::{AppError, AppResult};

/// Weighted contribution of each factor to a similarity score
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub performers: f64,
    pub groups: f64,
    pub tags: f64,
    pub studio: f64,
    /// Sum of the contributions, capped at 1.0
    pub total: f64,
}

impl ScoreBreakdown {
    /// Breakdown for a scene compared with itself
    pub fn identical() -> Self {
        Self {
            total: 1.0,
            ..Default::default()
        }
    }

    /// Serializes the breakdown for the `similarity_score_data` column
    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("Score data serialization error: {}", e)))
    }

    /// Parses a stored breakdown; empty strings mean no breakdown was stored
    pub fn from_json(data: &str) -> AppResult<Option<Self>> {
        if data.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(data)
            .map(Some)
            .map_err(|e| AppError::Internal(format!("Score data deserialization error: {}", e)))
    }
}

/// A persisted similarity between an ordered pair of scenes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRecord {
    pub scene_id: SceneId,
    pub similar_scene_id: SceneId,
    pub score: f64,
    pub score_data: Option<ScoreBreakdown>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SimilarityRecord {
    /// Creates a record stamped with the current time
    pub fn new(scene_id: SceneId, similar_scene_id: SceneId, breakdown: ScoreBreakdown) -> Self {
        let now = Utc::now();
        Self {
            scene_id,
            similar_scene_id,
            score: breakdown.total,
            score_data: Some(breakdown),
            created_at: now,
            updated_at: now,
        }
    }

    /// The same similarity stored under the reversed pair
    pub fn mirrored(&self) -> Self {
        Self {
            scene_id: self.similar_scene_id,
            similar_scene_id: self.scene_id,
            ..self.clone()
        }
    }

    pub fn key(&self) -> (SceneId, SceneId) {
        (self.scene_id, self.similar_scene_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakdown() -> ScoreBreakdown {
        ScoreBreakdown {
            performers: 0.1,
            groups: 0.0,
            tags: 0.32,
            studio: 0.1,
            total: 0.52,
        }
    }

    #[test]
    fn test_new_record_takes_score_from_breakdown() {
        let record = SimilarityRecord::new(SceneId(1), SceneId(2), breakdown());
        assert_eq!(record.score, 0.52);
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(record.key(), (SceneId(1), SceneId(2)));
    }

    #[test]
    fn test_mirrored_swaps_pair_only() {
        let record = SimilarityRecord::new(SceneId(1), SceneId(2), breakdown());
        let mirror = record.mirrored();
        assert_eq!(mirror.key(), (SceneId(2), SceneId(1)));
        assert_eq!(mirror.score, record.score);
        assert_eq!(mirror.created_at, record.created_at);
    }

    #[test]
    fn test_score_data_json_field_names() {
        let json = breakdown().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["tags"], 0.32);
        assert_eq!(value["total"], 0.52);
    }

    #[test]
    fn test_score_data_from_empty_string() {
        assert_eq!(ScoreBreakdown::from_json("").unwrap(), None);
    }

    #[test]
    fn test_score_data_from_invalid_json() {
        let err = ScoreBreakdown::from_json("{not json").unwrap_err();
        assert!(err.to_string().contains("deserialization"));
    }
}
