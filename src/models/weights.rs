use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Weights for each similarity factor plus the persistence threshold
///
/// Weights need not sum to 1.0; the final score is capped at 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    /// Weight for shared performers (default: 0.3)
    pub performers: f64,
    /// Weight for shared groups (default: 0.2)
    pub groups: f64,
    /// Weight for shared tags (default: 0.4)
    pub tags: f64,
    /// Weight for a shared studio (default: 0.1)
    pub studio: f64,
    /// Minimum score a pair needs to be stored (default: 0.1)
    pub min_score: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            performers: 0.3,
            groups: 0.2,
            tags: 0.4,
            studio: 0.1,
            min_score: 0.1,
        }
    }
}

impl SimilarityWeights {
    /// Rejects negative or non-finite values
    pub fn validate(&self) -> AppResult<()> {
        let fields = [
            ("performers", self.performers),
            ("groups", self.groups),
            ("tags", self.tags),
            ("studio", self.studio),
            ("min_score", self.min_score),
        ];

        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::InvalidConfig(format!(
                    "weight '{}' must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }

    /// Whether a score is high enough to be persisted
    pub fn qualifies(&self, score: f64) -> bool {
        score >= self.min_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights() {
        let weights = SimilarityWeights::default();
        assert_eq!(weights.performers, 0.3);
        assert_eq!(weights.groups, 0.2);
        assert_eq!(weights.tags, 0.4);
        assert_eq!(weights.studio, 0.1);
        assert_eq!(weights.min_score, 0.1);
        assert!(weights.validate().is_ok());
    }

    #[test]
    fn test_weights_may_sum_above_one() {
        let weights = SimilarityWeights {
            performers: 1.0,
            groups: 1.0,
            tags: 1.0,
            studio: 1.0,
            min_score: 0.5,
        };
        assert!(weights.validate().is_ok());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let weights = SimilarityWeights {
            tags: -0.1,
            ..Default::default()
        };
        let err = weights.validate().unwrap_err();
        assert!(err.to_string().contains("'tags'"));
    }

    #[test]
    fn test_nan_threshold_rejected() {
        let weights = SimilarityWeights {
            min_score: f64::NAN,
            ..Default::default()
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_qualifies_is_inclusive() {
        let weights = SimilarityWeights::default();
        assert!(weights.qualifies(0.1));
        assert!(!weights.qualifies(0.099));
    }
}
