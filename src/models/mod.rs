pub mod scene;
pub mod similarity;
pub mod weights;

pub use scene::{
    GroupAssociation, GroupId, PerformerId, Related, Scene, SceneId, StudioId, TagId,
};
pub use similarity::{ScoreBreakdown, SimilarityRecord};
pub use weights::SimilarityWeights;
