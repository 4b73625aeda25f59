use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt::Display};

use crate::{db::RelationshipLoader, error::AppResult};

pub type PerformerId = i32;
pub type TagId = i32;
pub type GroupId = i32;
pub type StudioId = i32;

static NO_IDS: BTreeSet<i32> = BTreeSet::new();

/// Identifier of a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneId(pub i32);

impl Display for SceneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for SceneId {
    fn from(id: i32) -> Self {
        SceneId(id)
    }
}

/// Membership of a scene in a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAssociation {
    pub group_id: GroupId,
    /// Position of the scene within the group, when the group is ordered
    pub scene_index: Option<i32>,
}

impl GroupAssociation {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            scene_index: None,
        }
    }
}

/// A relationship that is only populated once explicitly loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Related<T> {
    Unloaded,
    Loaded(T),
}

impl<T> Default for Related<T> {
    fn default() -> Self {
        Related::Unloaded
    }
}

impl<T> Related<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Related::Loaded(_))
    }

    pub fn loaded(&self) -> Option<&T> {
        match self {
            Related::Loaded(value) => Some(value),
            Related::Unloaded => None,
        }
    }
}

/// Snapshot of a scene and the attributes similarity is computed from
///
/// Studio is a column of the scene itself and is always present in a snapshot.
/// Performers, tags and groups live in join tables and start out unloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub id: SceneId,
    pub title: Option<String>,
    pub studio_id: Option<StudioId>,
    pub performer_ids: Related<BTreeSet<PerformerId>>,
    pub tag_ids: Related<BTreeSet<TagId>>,
    pub groups: Related<Vec<GroupAssociation>>,
}

impl Scene {
    /// Creates a scene snapshot with no relationships loaded
    pub fn new(id: impl Into<SceneId>) -> Self {
        Self {
            id: id.into(),
            title: None,
            studio_id: None,
            performer_ids: Related::Unloaded,
            tag_ids: Related::Unloaded,
            groups: Related::Unloaded,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_studio(mut self, studio_id: StudioId) -> Self {
        self.studio_id = Some(studio_id);
        self
    }

    pub fn with_performers(mut self, ids: impl IntoIterator<Item = PerformerId>) -> Self {
        self.performer_ids = Related::Loaded(ids.into_iter().collect());
        self
    }

    pub fn with_tags(mut self, ids: impl IntoIterator<Item = TagId>) -> Self {
        self.tag_ids = Related::Loaded(ids.into_iter().collect());
        self
    }

    pub fn with_groups(mut self, ids: impl IntoIterator<Item = GroupId>) -> Self {
        self.groups = Related::Loaded(ids.into_iter().map(GroupAssociation::new).collect());
        self
    }

    /// Marks every relationship as loaded, leaving missing ones empty
    pub fn hydrated(mut self) -> Self {
        if !self.performer_ids.is_loaded() {
            self.performer_ids = Related::Loaded(BTreeSet::new());
        }
        if !self.tag_ids.is_loaded() {
            self.tag_ids = Related::Loaded(BTreeSet::new());
        }
        if !self.groups.is_loaded() {
            self.groups = Related::Loaded(Vec::new());
        }
        self
    }

    /// Whether every relationship needed for scoring has been loaded
    pub fn is_hydrated(&self) -> bool {
        self.performer_ids.is_loaded() && self.tag_ids.is_loaded() && self.groups.is_loaded()
    }

    /// Performer ids, empty when not loaded
    pub fn performers(&self) -> &BTreeSet<PerformerId> {
        self.performer_ids.loaded().unwrap_or(&NO_IDS)
    }

    /// Tag ids, empty when not loaded
    pub fn tags(&self) -> &BTreeSet<TagId> {
        self.tag_ids.loaded().unwrap_or(&NO_IDS)
    }

    /// Distinct group ids across all group associations
    pub fn group_ids(&self) -> BTreeSet<GroupId> {
        self.groups
            .loaded()
            .map(|groups| groups.iter().map(|g| g.group_id).collect())
            .unwrap_or_default()
    }

    /// Loads every relationship that is not yet populated
    ///
    /// Already-loaded relationships are left untouched, so calling this on a
    /// pre-hydrated scene performs no lookups.
    pub async fn load_relationships<L>(&mut self, loader: &L) -> AppResult<()>
    where
        L: RelationshipLoader + ?Sized,
    {
        if !self.performer_ids.is_loaded() {
            let ids = loader.performer_ids(self.id).await?;
            self.performer_ids = Related::Loaded(ids.into_iter().collect());
        }

        if !self.tag_ids.is_loaded() {
            let ids = loader.tag_ids(self.id).await?;
            self.tag_ids = Related::Loaded(ids.into_iter().collect());
        }

        if !self.groups.is_loaded() {
            let groups = loader.groups(self.id).await?;
            self.groups = Related::Loaded(groups);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockRelationshipLoader;

    #[test]
    fn test_new_scene_is_unloaded() {
        let scene = Scene::new(1);
        assert!(!scene.is_hydrated());
        assert!(scene.performers().is_empty());
        assert!(scene.tags().is_empty());
        assert!(scene.group_ids().is_empty());
    }

    #[test]
    fn test_loaded_empty_differs_from_unloaded() {
        let scene = Scene::new(1).with_tags(Vec::<TagId>::new());
        assert!(scene.tag_ids.is_loaded());
        assert!(!scene.performer_ids.is_loaded());
    }

    #[test]
    fn test_group_ids_collapse_duplicates() {
        let mut scene = Scene::new(3);
        scene.groups = Related::Loaded(vec![
            GroupAssociation {
                group_id: 9,
                scene_index: Some(1),
            },
            GroupAssociation {
                group_id: 9,
                scene_index: Some(2),
            },
            GroupAssociation::new(4),
        ]);

        assert_eq!(scene.group_ids(), BTreeSet::from([4, 9]));
    }

    #[test]
    fn test_scene_id_display() {
        assert_eq!(format!("{}", SceneId(12)), "12");
    }

    #[tokio::test]
    async fn test_load_relationships_fills_unloaded_only() {
        let mut loader = MockRelationshipLoader::new();
        loader
            .expect_performer_ids()
            .times(1)
            .returning(|_| Ok(vec![1, 2, 2]));
        loader.expect_tag_ids().never();
        loader
            .expect_groups()
            .times(1)
            .returning(|_| Ok(vec![GroupAssociation::new(5)]));

        let mut scene = Scene::new(1).with_tags([10]);
        scene.load_relationships(&loader).await.unwrap();

        assert!(scene.is_hydrated());
        assert_eq!(scene.performers(), &BTreeSet::from([1, 2]));
        assert_eq!(scene.tags(), &BTreeSet::from([10]));
        assert_eq!(scene.group_ids(), BTreeSet::from([5]));
    }

    #[tokio::test]
    async fn test_load_relationships_propagates_failure() {
        let mut loader = MockRelationshipLoader::new();
        loader
            .expect_performer_ids()
            .returning(|id| Err(crate::error::AppError::relationship_load(id, "timeout")));

        let mut scene = Scene::new(8);
        let result = scene.load_relationships(&loader).await;

        assert!(result.is_err());
        assert!(!scene.performer_ids.is_loaded());
    }
}
