//! Links between processed frames.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::RelationshipConfig;
use crate::eid::Eid;
use crate::models::{Frame, FrameRelationship, RelationType, META_RELATIONSHIPS};
use crate::store::{FrameStore, StoreError};
use crate::vector::{IndexError, SearchResult, VectorIndex};

#[derive(Debug, thiserror::Error)]
pub enum RelationshipError {
    #[error("frame {0} has no vector")]
    MissingVector(Eid),

    #[error("similarity lookup failed: {0}")]
    Index(#[from] IndexError),

    #[error("relationship store error: {0}")]
    Store(#[from] StoreError),
}

/// Lookup results for one frame. Disabled types stay `None`.
#[derive(Debug, Default)]
pub struct Relationships {
    pub similar: Option<Vec<SearchResult>>,
    /// Neighbour ids with their frame numbers, in frame order.
    pub sequential: Option<Vec<(Eid, u32)>>,
    pub scene: Option<Vec<Eid>>,
}

impl Relationships {
    pub fn types(&self) -> Vec<RelationType> {
        let mut types = Vec::new();
        if self.similar.is_some() {
            types.push(RelationType::Similar);
        }
        if self.sequential.is_some() {
            types.push(RelationType::Sequential);
        }
        if self.scene.is_some() {
            types.push(RelationType::Scene);
        }
        types
    }

    pub fn len(&self) -> usize {
        self.similar.as_ref().map_or(0, Vec::len)
            + self.sequential.as_ref().map_or(0, Vec::len)
            + self.scene.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge patch writing the id lists under `relationships`.
    pub fn to_patch(&self) -> Value {
        let mut lists = Map::new();
        if let Some(similar) = &self.similar {
            let ids: Vec<&str> = similar.iter().map(|r| r.id.as_str()).collect();
            lists.insert(RelationType::Similar.as_str().to_string(), json!(ids));
        }
        if let Some(sequential) = &self.sequential {
            let ids: Vec<&str> = sequential.iter().map(|(id, _)| id.as_str()).collect();
            lists.insert(RelationType::Sequential.as_str().to_string(), json!(ids));
        }
        if let Some(scene) = &self.scene {
            let ids: Vec<&str> = scene.iter().map(Eid::as_str).collect();
            lists.insert(RelationType::Scene.as_str().to_string(), json!(ids));
        }
        json!({ META_RELATIONSHIPS: lists })
    }

    /// Typed rows for `frame`, which sits at frame number `number`.
    pub fn to_rows(&self, frame: &Eid, number: u32) -> Vec<FrameRelationship> {
        let row = |kind, related: &Eid, strength| FrameRelationship {
            frame_id: frame.clone(),
            relation_type: kind,
            related_frame: related.clone(),
            strength,
            metadata: None,
        };

        let mut rows = Vec::with_capacity(self.len());
        for result in self.similar.iter().flatten() {
            rows.push(row(RelationType::Similar, &result.id, result.score as f64));
        }
        for (id, other) in self.sequential.iter().flatten() {
            let distance = (*other as i64 - number as i64).unsigned_abs() as f64;
            rows.push(row(RelationType::Sequential, id, 1.0 / (1.0 + distance)));
        }
        for id in self.scene.iter().flatten() {
            rows.push(row(RelationType::Scene, id, 1.0));
        }
        rows
    }
}

pub struct RelationshipTracker {
    index: Arc<VectorIndex>,
    store: FrameStore,
    config: RelationshipConfig,
}

impl RelationshipTracker {
    pub fn new(index: Arc<VectorIndex>, store: FrameStore, config: RelationshipConfig) -> Self {
        Self {
            index,
            store,
            config,
        }
    }

    /// Compute and persist the relationships of an already stored frame.
    ///
    /// The enabled lookups run concurrently. If any of them fails nothing is
    /// written. On success the metadata patch and relationship rows are
    /// committed together and the same patch is applied to `frame`.
    pub async fn track_relationships(
        &self,
        frame: &mut Frame,
    ) -> Result<Relationships, RelationshipError> {
        let (similar, sequential, scene) = futures::try_join!(
            self.similar(frame),
            self.sequential(frame),
            self.scene(frame),
        )?;
        let relationships = Relationships {
            similar,
            sequential,
            scene,
        };

        let patch = relationships.to_patch();
        let rows = relationships.to_rows(&frame.id, frame.number);
        self.store
            .record_relationships(&frame.id, &patch, &relationships.types(), &rows)
            .await?;
        frame.patch_metadata(&patch);

        log::debug!(
            "frame {}: {} relationships recorded",
            frame.id,
            relationships.len()
        );
        Ok(relationships)
    }

    async fn similar(&self, frame: &Frame) -> Result<Option<Vec<SearchResult>>, RelationshipError> {
        if !self.config.is_enabled(RelationType::Similar) {
            return Ok(None);
        }

        let vector = match &frame.vector {
            Some(vector) => vector.clone(),
            None => self
                .index
                .get(&frame.id)
                .await?
                .ok_or_else(|| RelationshipError::MissingVector(frame.id.clone()))?,
        };

        // one extra since the frame finds itself
        let limit = self.config.max_similar_frames;
        let mut results = self.index.find_similar_scored(&vector, limit + 1).await?;
        results.retain(|result| result.id != frame.id);
        results.truncate(limit);
        Ok(Some(results))
    }

    async fn sequential(&self, frame: &Frame) -> Result<Option<Vec<(Eid, u32)>>, RelationshipError> {
        if !self.config.is_enabled(RelationType::Sequential) {
            return Ok(None);
        }
        let neighbours = self
            .store
            .sequential_neighbours(
                &frame.video_id,
                frame.number,
                self.config.temporal_window,
                &frame.id,
            )
            .await?;
        Ok(Some(neighbours))
    }

    async fn scene(&self, frame: &Frame) -> Result<Option<Vec<Eid>>, RelationshipError> {
        if !self.config.is_enabled(RelationType::Scene) {
            return Ok(None);
        }
        Ok(Some(self.store.scene_peers(&frame.id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Relationships {
        Relationships {
            similar: Some(vec![SearchResult {
                id: Eid::from("b"),
                score: 0.5,
            }]),
            sequential: Some(vec![(Eid::from("c"), 8), (Eid::from("d"), 11)]),
            scene: None,
        }
    }

    #[test]
    fn test_patch_contains_enabled_types_only() {
        let patch = sample().to_patch();
        assert_eq!(
            patch,
            json!({"relationships": {"similar": ["b"], "sequential": ["c", "d"]}})
        );
    }

    #[test]
    fn test_rows_strengths() {
        let rows = sample().to_rows(&Eid::from("a"), 10);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].relation_type, RelationType::Similar);
        assert_eq!(rows[0].strength, 0.5);
        assert!((rows[1].strength - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(rows[2].strength, 0.5);
        assert!(rows.iter().all(|row| row.frame_id == Eid::from("a")));
    }

    #[test]
    fn test_types_and_len() {
        let relationships = sample();
        assert_eq!(
            relationships.types(),
            vec![RelationType::Similar, RelationType::Sequential]
        );
        assert_eq!(relationships.len(), 3);
        assert!(Relationships::default().is_empty());
    }
}
