//! Pure similarity scoring between two scene snapshots
//!
//! Each factor produces a component in [0, 1] (the tag component may reach 2.0
//! before weighting), components are multiplied by their weight and summed,
//! and the sum is capped at 1.0.

use std::collections::BTreeSet;

use crate::models::{Scene, ScoreBreakdown, SimilarityWeights};

/// Bonus per shared tag beyond the first
const TAG_BOOST_STEP: f64 = 0.2;
/// Largest bonus the tag multiplier can add (2x from six shared tags on)
const TAG_BOOST_CAP: f64 = 1.0;

/// Jaccard index of two sets with the number of shared elements
///
/// Returns `(0.0, 0)` when both sets are empty.
fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> (f64, usize) {
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;

    if union == 0 {
        return (0.0, 0);
    }

    (shared as f64 / union as f64, shared)
}

/// Multiplier applied to the tag Jaccard index for `shared` common tags
pub fn tag_boost(shared: usize) -> f64 {
    if shared == 0 {
        return 0.0;
    }
    1.0 + ((shared - 1) as f64 * TAG_BOOST_STEP).min(TAG_BOOST_CAP)
}

pub fn performer_similarity(a: &Scene, b: &Scene) -> f64 {
    jaccard(a.performers(), b.performers()).0
}

pub fn group_similarity(a: &Scene, b: &Scene) -> f64 {
    jaccard(&a.group_ids(), &b.group_ids()).0
}

/// Tag Jaccard index boosted by the number of shared tags
pub fn tag_similarity(a: &Scene, b: &Scene) -> f64 {
    let (index, shared) = jaccard(a.tags(), b.tags());
    index * tag_boost(shared)
}

pub fn studio_similarity(a: &Scene, b: &Scene) -> f64 {
    match (a.studio_id, b.studio_id) {
        (Some(x), Some(y)) if x == y => 1.0,
        _ => 0.0,
    }
}

/// Weighted contribution of each factor and the capped total
///
/// Unloaded relationships count as empty. A scene compared with itself scores
/// 1.0 without any component being computed.
pub fn breakdown(a: &Scene, b: &Scene, weights: &SimilarityWeights) -> ScoreBreakdown {
    if a.id == b.id {
        return ScoreBreakdown::identical();
    }

    let performers = performer_similarity(a, b) * weights.performers;
    let groups = group_similarity(a, b) * weights.groups;
    let tags = tag_similarity(a, b) * weights.tags;
    let studio = studio_similarity(a, b) * weights.studio;

    ScoreBreakdown {
        performers,
        groups,
        tags,
        studio,
        total: (performers + groups + tags + studio).min(1.0),
    }
}

/// Similarity score in [0, 1] between two scenes
pub fn score(a: &Scene, b: &Scene, weights: &SimilarityWeights) -> f64 {
    breakdown(a, b, weights).total
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < EPSILON,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    fn scene_a() -> Scene {
        Scene::new(1)
            .with_performers([1, 2])
            .with_tags([10, 20, 30])
            .with_studio(5)
            .hydrated()
    }

    fn scene_b() -> Scene {
        Scene::new(2)
            .with_performers([2, 3])
            .with_tags([10, 20])
            .with_studio(5)
            .hydrated()
    }

    #[test]
    fn test_identical_scene_scores_one() {
        let scene = scene_a();
        assert_eq!(score(&scene, &scene, &SimilarityWeights::default()), 1.0);

        // Identity is by id, even for an empty snapshot
        let empty = Scene::new(7);
        assert_eq!(score(&empty, &empty, &SimilarityWeights::default()), 1.0);
    }

    #[test]
    fn test_reference_pair_scores_point_five_two() {
        let weights = SimilarityWeights::default();
        let result = breakdown(&scene_a(), &scene_b(), &weights);

        assert_close(result.performers, 0.3 / 3.0);
        assert_close(result.groups, 0.0);
        assert_close(result.tags, 0.4 * 0.8);
        assert_close(result.studio, 0.1);
        assert_close(result.total, 0.52);
        assert!(weights.qualifies(result.total));
    }

    #[test]
    fn test_score_is_symmetric() {
        let weights = SimilarityWeights::default();
        assert_close(
            score(&scene_a(), &scene_b(), &weights),
            score(&scene_b(), &scene_a(), &weights),
        );
    }

    #[test]
    fn test_disjoint_scenes_score_zero() {
        let a = Scene::new(1)
            .with_performers([1])
            .with_tags([10])
            .with_groups([100])
            .with_studio(1);
        let b = Scene::new(2)
            .with_performers([2])
            .with_tags([20])
            .with_groups([200])
            .with_studio(2);

        assert_eq!(score(&a, &b, &SimilarityWeights::default()), 0.0);
    }

    #[test]
    fn test_empty_sets_contribute_nothing() {
        let a = Scene::new(1).hydrated();
        let b = Scene::new(2).hydrated();

        assert_eq!(performer_similarity(&a, &b), 0.0);
        assert_eq!(group_similarity(&a, &b), 0.0);
        assert_eq!(tag_similarity(&a, &b), 0.0);
        assert_eq!(score(&a, &b, &SimilarityWeights::default()), 0.0);
    }

    #[test]
    fn test_unloaded_relationships_score_as_empty() {
        let hydrated = scene_a();
        let unloaded = Scene::new(2).with_studio(5);

        let result = breakdown(&hydrated, &unloaded, &SimilarityWeights::default());
        assert_eq!(result.performers, 0.0);
        assert_eq!(result.tags, 0.0);
        assert_close(result.total, 0.1);
    }

    #[test]
    fn test_missing_studio_never_matches() {
        let a = Scene::new(1).hydrated();
        let b = Scene::new(2).hydrated();
        assert_eq!(studio_similarity(&a, &b), 0.0);

        let c = Scene::new(3).hydrated().with_studio(4);
        assert_eq!(studio_similarity(&a, &c), 0.0);
        assert_eq!(studio_similarity(&c, &a), 0.0);
    }

    #[test]
    fn test_group_similarity_uses_group_ids() {
        let a = Scene::new(1).with_groups([1, 2]);
        let b = Scene::new(2).with_groups([2, 3, 4]);
        assert_close(group_similarity(&a, &b), 0.25);
    }

    #[test]
    fn test_tag_boost_formula() {
        assert_eq!(tag_boost(0), 0.0);
        assert_close(tag_boost(1), 1.0);
        assert_close(tag_boost(2), 1.2);
        assert_close(tag_boost(3), 1.4);
        assert_close(tag_boost(5), 1.8);
        assert_close(tag_boost(6), 2.0);
        assert_close(tag_boost(12), 2.0);
    }

    #[test]
    fn test_tag_similarity_matches_boosted_jaccard() {
        // shared = 3, union = 5
        let a = Scene::new(1).with_tags([1, 2, 3, 4]);
        let b = Scene::new(2).with_tags([2, 3, 4, 5]);
        assert_close(tag_similarity(&a, &b), (3.0 / 5.0) * 1.4);

        // No shared tags means no contribution regardless of boost
        let c = Scene::new(3).with_tags([9]);
        assert_eq!(tag_similarity(&a, &c), 0.0);
    }

    #[test]
    fn test_score_capped_at_one() {
        let weights = SimilarityWeights {
            performers: 1.0,
            groups: 1.0,
            tags: 1.0,
            studio: 1.0,
            min_score: 0.1,
        };
        let tags = [1, 2, 3, 4, 5, 6];
        let a = Scene::new(1)
            .with_performers([1])
            .with_tags(tags)
            .with_groups([1])
            .with_studio(1);
        let b = Scene::new(2)
            .with_performers([1])
            .with_tags(tags)
            .with_groups([1])
            .with_studio(1);

        let result = breakdown(&a, &b, &weights);
        assert_close(result.tags, 2.0);
        assert_eq!(result.total, 1.0);
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let weights = [
            SimilarityWeights::default(),
            SimilarityWeights {
                performers: 0.9,
                groups: 0.9,
                tags: 0.9,
                studio: 0.9,
                min_score: 0.0,
            },
            SimilarityWeights {
                performers: 0.0,
                groups: 0.0,
                tags: 0.0,
                studio: 0.0,
                min_score: 0.0,
            },
        ];

        // Deterministic spread of overlapping and disjoint attribute sets
        let scenes: Vec<Scene> = (0..24)
            .map(|i: i32| {
                Scene::new(i)
                    .with_performers((0..(i % 4)).map(|p| p + i % 3))
                    .with_tags((0..(i % 7)).map(|t| t * (1 + i % 2)))
                    .with_groups((0..(i % 3)).map(|g| g + i % 5))
                    .with_studio(i % 3)
            })
            .collect();

        for w in &weights {
            for a in &scenes {
                for b in &scenes {
                    let s = score(a, b, w);
                    assert!((0.0..=1.0).contains(&s), "score {} out of range", s);
                }
            }
        }
    }
}
