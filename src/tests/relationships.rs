use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map};

use super::test_store;
use crate::config::{IndexConfig, RelationshipConfig};
use crate::eid::Eid;
use crate::frame::relationship::{RelationshipError, RelationshipTracker};
use crate::models::{Frame, RelationType};
use crate::store::FrameStore;
use crate::vector::{VectorEntry, VectorIndex};

struct Fixture {
    _dir: tempfile::TempDir,
    store: FrameStore,
    index: Arc<VectorIndex>,
    frames: Vec<Frame>,
}

/// Four frames of one video; 0 and 1 point the same way, 0 and 2 share a scene.
async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = test_store(dir.path()).await;
    let index = Arc::new(VectorIndex::new(
        Arc::new(store.clone()),
        3,
        &IndexConfig::default(),
    ));

    let video_id = Eid::new();
    let vectors = [
        vec![1.0, 0.0, 0.0],
        vec![0.9, 0.1, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![0.0, 0.0, 1.0],
    ];

    let mut frames = Vec::new();
    for (number, vector) in vectors.into_iter().enumerate() {
        let mut frame = Frame::new(
            video_id.clone(),
            number as u32,
            number as f64,
            PathBuf::from(format!("frame-{number}.jpg")),
        );
        frame.vector = Some(vector.clone());
        store.save_frame(&frame).await.unwrap();
        index
            .insert(VectorEntry {
                id: frame.id.clone(),
                vector,
                metadata: Map::new(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        frames.push(frame);
    }
    index.flush().await.unwrap();

    store.assign_scene(&frames[0].id, "v:beach").await.unwrap();
    store.assign_scene(&frames[2].id, "v:beach").await.unwrap();
    store.assign_scene(&frames[3].id, "v:forest").await.unwrap();

    Fixture {
        _dir: dir,
        store,
        index,
        frames,
    }
}

fn config(max_similar_frames: usize, temporal_window: u32, types: &[RelationType]) -> RelationshipConfig {
    RelationshipConfig {
        max_similar_frames,
        temporal_window,
        enabled_types: types.to_vec(),
    }
}

#[tokio::test]
async fn test_track_all_relationship_types() {
    let mut fx = fixture().await;
    let tracker = RelationshipTracker::new(
        fx.index.clone(),
        fx.store.clone(),
        config(
            2,
            1,
            &[RelationType::Similar, RelationType::Sequential, RelationType::Scene],
        ),
    );
    let ids: Vec<Eid> = fx.frames.iter().map(|f| f.id.clone()).collect();

    let frame = &mut fx.frames[0];
    let relationships = tracker.track_relationships(frame).await.unwrap();

    let similar: Vec<Eid> = relationships
        .similar
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(similar, vec![ids[1].clone(), ids[2].clone()]);
    assert_eq!(relationships.sequential.unwrap(), vec![(ids[1].clone(), 1)]);
    assert_eq!(relationships.scene.unwrap(), vec![ids[2].clone()]);

    let expected = json!({
        "similar": [ids[1].as_str(), ids[2].as_str()],
        "sequential": [ids[1].as_str()],
        "scene": [ids[2].as_str()],
    });
    assert_eq!(frame.metadata["relationships"], expected);

    let stored = fx.store.get_frame(&ids[0]).await.unwrap().unwrap();
    assert_eq!(stored.metadata["relationships"], expected);

    let rows = fx.store.related_frames(&ids[0], None).await.unwrap();
    assert_eq!(rows.len(), 4);
    let scene = fx
        .store
        .related_frames(&ids[0], Some(RelationType::Scene))
        .await
        .unwrap();
    assert_eq!(scene[0].strength, 1.0);
    let sequential = fx
        .store
        .related_frames(&ids[0], Some(RelationType::Sequential))
        .await
        .unwrap();
    assert_eq!(sequential[0].strength, 0.5);
}

#[tokio::test]
async fn test_only_enabled_types_are_written() {
    let mut fx = fixture().await;
    let tracker = RelationshipTracker::new(
        fx.index.clone(),
        fx.store.clone(),
        config(5, 5, &[RelationType::Sequential]),
    );

    let frame = &mut fx.frames[3];
    let relationships = tracker.track_relationships(frame).await.unwrap();
    assert!(relationships.similar.is_none());
    assert!(relationships.scene.is_none());
    assert_eq!(relationships.sequential.unwrap().len(), 3);

    let written = frame.metadata["relationships"].as_object().unwrap();
    assert_eq!(written.keys().collect::<Vec<_>>(), vec!["sequential"]);
}

#[tokio::test]
async fn test_failed_lookup_writes_nothing() {
    let fx = fixture().await;
    let tracker = RelationshipTracker::new(
        fx.index.clone(),
        fx.store.clone(),
        RelationshipConfig::default(),
    );

    // stored frame whose vector never reached the index
    let mut orphan = Frame::new(
        fx.frames[0].video_id.clone(),
        1,
        1.0,
        PathBuf::from("frame-orphan.jpg"),
    );
    fx.store.save_frame(&orphan).await.unwrap();

    let err = tracker.track_relationships(&mut orphan).await.unwrap_err();
    assert!(matches!(err, RelationshipError::MissingVector(_)));
    assert!(!orphan.metadata.contains_key("relationships"));

    let stored = fx.store.get_frame(&orphan.id).await.unwrap().unwrap();
    assert!(!stored.metadata.contains_key("relationships"));
    assert!(fx
        .store
        .related_frames(&orphan.id, None)
        .await
        .unwrap()
        .is_empty());
}
