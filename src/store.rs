//! Relational store for videos, frames, vectors and relationships (SQLite).
//!
//! Every statement is parameterized. Multi-row writes run inside a single
//! transaction that rolls back when dropped without a commit.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::eid::Eid;
use crate::models::{
    Frame, FrameRelationship, QualityMetrics, RelationType, Resolution, Video, VideoMetadata,
    VideoStatus,
};
use crate::vector::{bytes_to_vector, vector_to_bytes, CodecError, VectorEntry, VectorStore};

const SCHEMA: [&str; 7] = [
    "CREATE TABLE IF NOT EXISTS videos (
        id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        status TEXT NOT NULL,
        metadata TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS frames (
        id TEXT PRIMARY KEY,
        video_id TEXT NOT NULL,
        frame_number INTEGER NOT NULL,
        timestamp REAL NOT NULL,
        path TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        quality TEXT NOT NULL,
        metadata TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_frames_video_number ON frames (video_id, frame_number)",
    "CREATE TABLE IF NOT EXISTS frame_vectors (
        frame_id TEXT PRIMARY KEY,
        vector BLOB NOT NULL,
        metadata TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS frame_scenes (
        frame_id TEXT PRIMARY KEY,
        scene_id TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_frame_scenes_scene ON frame_scenes (scene_id)",
    "CREATE TABLE IF NOT EXISTS frame_relationships (
        frame_id TEXT NOT NULL,
        relation_type TEXT NOT NULL,
        related_frame TEXT NOT NULL,
        strength REAL NOT NULL,
        metadata TEXT,
        PRIMARY KEY (frame_id, relation_type, related_frame)
    )",
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("could not connect after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("stored vector is corrupt: {0}")]
    Codec(#[from] CodecError),

    #[error("stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Clone, Debug)]
pub struct FrameStore {
    pool: SqlitePool,
}

impl FrameStore {
    /// Open the database, retrying with a fixed backoff, and create the
    /// schema if it is missing.
    pub async fn connect(url: &str, attempts: u32, backoff: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let attempts = attempts.max(1);
        let mut attempt = 0;
        let pool = loop {
            attempt += 1;
            match SqlitePoolOptions::new()
                .max_connections(8)
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => break pool,
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "database connection attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(source) => return Err(StoreError::Connect { attempts, source }),
            }
        };

        let store = Self { pool };
        store.ensure_schema().await?;
        log::info!("connected to {}", url);

        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn save_video(&self, video: &Video) -> Result<(), StoreError> {
        let metadata = video
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO videos (id, source, status, metadata, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                status = excluded.status,
                metadata = excluded.metadata,
                error = excluded.error,
                updated_at = excluded.updated_at",
        )
        .bind(video.id.as_str())
        .bind(video.source.to_string_lossy().to_string())
        .bind(video.status.as_str())
        .bind(metadata)
        .bind(video.error.as_deref())
        .bind(video.created_at)
        .bind(video.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_video(&self, id: &Eid) -> Result<Option<Video>, StoreError> {
        let row = sqlx::query(
            "SELECT id, source, status, metadata, error, created_at, updated_at
             FROM videos WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let metadata: Option<String> = row.try_get("metadata")?;
        Ok(Some(Video {
            id: Eid::from(row.try_get::<String, _>("id")?),
            source: PathBuf::from(row.try_get::<String, _>("source")?),
            status: VideoStatus::from_str(&status).map_err(StoreError::Invalid)?,
            metadata: metadata
                .map(|m| serde_json::from_str::<VideoMetadata>(&m))
                .transpose()?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    pub async fn set_video_status(
        &self,
        id: &Eid,
        status: VideoStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE videos SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4")
                .bind(status.as_str())
                .bind(error)
                .bind(Utc::now())
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("video {}", id)));
        }
        Ok(())
    }

    pub async fn set_video_metadata(
        &self,
        id: &Eid,
        metadata: &VideoMetadata,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE videos SET metadata = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(serde_json::to_string(metadata)?)
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("video {}", id)));
        }
        Ok(())
    }

    /// Insert or replace a frame record. The vector is persisted separately
    /// through the vector index.
    pub async fn save_frame(&self, frame: &Frame) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO frames
                (id, video_id, frame_number, timestamp, path, width, height, quality, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                frame_number = excluded.frame_number,
                timestamp = excluded.timestamp,
                path = excluded.path,
                width = excluded.width,
                height = excluded.height,
                quality = excluded.quality,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
        )
        .bind(frame.id.as_str())
        .bind(frame.video_id.as_str())
        .bind(frame.number as i64)
        .bind(frame.timestamp)
        .bind(frame.path.to_string_lossy().to_string())
        .bind(frame.resolution.width as i64)
        .bind(frame.resolution.height as i64)
        .bind(serde_json::to_string(&frame.quality)?)
        .bind(serde_json::to_string(&frame.metadata)?)
        .bind(frame.created_at)
        .bind(frame.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_frame(&self, id: &Eid) -> Result<Option<Frame>, StoreError> {
        let row = sqlx::query(
            "SELECT f.*, v.vector AS vector FROM frames f
             LEFT JOIN frame_vectors v ON v.frame_id = f.id
             WHERE f.id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| frame_from_row(&row)).transpose()
    }

    pub async fn frames_by_video(&self, video_id: &Eid) -> Result<Vec<Frame>, StoreError> {
        let rows = sqlx::query(
            "SELECT f.*, v.vector AS vector FROM frames f
             LEFT JOIN frame_vectors v ON v.frame_id = f.id
             WHERE f.video_id = ?1
             ORDER BY f.frame_number",
        )
        .bind(video_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(frame_from_row).collect()
    }

    /// Frames of the same video whose number lies within `window` of
    /// `number` (inclusive), excluding `exclude`, ordered by frame number.
    pub async fn sequential_neighbours(
        &self,
        video_id: &Eid,
        number: u32,
        window: u32,
        exclude: &Eid,
    ) -> Result<Vec<(Eid, u32)>, StoreError> {
        let low = number as i64 - window as i64;
        let high = number as i64 + window as i64;

        let rows = sqlx::query(
            "SELECT id, frame_number FROM frames
             WHERE video_id = ?1 AND frame_number BETWEEN ?2 AND ?3 AND id != ?4
             ORDER BY frame_number",
        )
        .bind(video_id.as_str())
        .bind(low)
        .bind(high)
        .bind(exclude.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<_, StoreError> {
                let id: String = row.try_get("id")?;
                let number: i64 = row.try_get("frame_number")?;
                Ok((Eid::from(id), number as u32))
            })
            .collect()
    }

    /// Other frames sharing this frame's scene.
    pub async fn scene_peers(&self, frame_id: &Eid) -> Result<Vec<Eid>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT peer.frame_id FROM frame_scenes own
             JOIN frame_scenes peer ON peer.scene_id = own.scene_id
             WHERE own.frame_id = ?1 AND peer.frame_id != ?1
             ORDER BY peer.rowid",
        )
        .bind(frame_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(Eid::from).collect())
    }

    pub async fn assign_scene(&self, frame_id: &Eid, scene_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO frame_scenes (frame_id, scene_id) VALUES (?1, ?2)
             ON CONFLICT(frame_id) DO UPDATE SET scene_id = excluded.scene_id",
        )
        .bind(frame_id.as_str())
        .bind(scene_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Merge `patch` into the frame's metadata (RFC 7396) and replace its
    /// relationship rows of the given types, in one transaction.
    pub async fn record_relationships(
        &self,
        frame_id: &Eid,
        patch: &Value,
        types: &[RelationType],
        relationships: &[FrameRelationship],
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE frames
             SET metadata = json_patch(COALESCE(metadata, '{}'), ?1), updated_at = ?2
             WHERE id = ?3",
        )
        .bind(serde_json::to_string(patch)?)
        .bind(now)
        .bind(frame_id.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(format!("frame {}", frame_id)));
        }

        for kind in types {
            sqlx::query("DELETE FROM frame_relationships WHERE frame_id = ?1 AND relation_type = ?2")
                .bind(frame_id.as_str())
                .bind(kind.as_str())
                .execute(&mut *tx)
                .await?;
        }

        for rel in relationships {
            sqlx::query(
                "INSERT INTO frame_relationships (frame_id, relation_type, related_frame, strength, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(frame_id, relation_type, related_frame) DO UPDATE SET
                    strength = excluded.strength,
                    metadata = excluded.metadata",
            )
            .bind(rel.frame_id.as_str())
            .bind(rel.relation_type.as_str())
            .bind(rel.related_frame.as_str())
            .bind(rel.strength)
            .bind(rel.metadata.as_ref().map(serde_json::to_string).transpose()?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Stored relationships of a frame, strongest first.
    pub async fn related_frames(
        &self,
        frame_id: &Eid,
        relation_type: Option<RelationType>,
    ) -> Result<Vec<FrameRelationship>, StoreError> {
        let rows = sqlx::query(
            "SELECT frame_id, relation_type, related_frame, strength, metadata
             FROM frame_relationships
             WHERE frame_id = ?1 AND (?2 IS NULL OR relation_type = ?2)
             ORDER BY strength DESC",
        )
        .bind(frame_id.as_str())
        .bind(relation_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<_, StoreError> {
                let kind: String = row.try_get("relation_type")?;
                let metadata: Option<String> = row.try_get("metadata")?;
                Ok(FrameRelationship {
                    frame_id: Eid::from(row.try_get::<String, _>("frame_id")?),
                    relation_type: RelationType::from_str(&kind).map_err(StoreError::Invalid)?,
                    related_frame: Eid::from(row.try_get::<String, _>("related_frame")?),
                    strength: row.try_get("strength")?,
                    metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
                })
            })
            .collect()
    }
}

fn frame_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Frame, StoreError> {
    let quality: String = row.try_get("quality")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let vector: Option<Vec<u8>> = row.try_get("vector")?;
    let number: i64 = row.try_get("frame_number")?;
    let width: i64 = row.try_get("width")?;
    let height: i64 = row.try_get("height")?;

    Ok(Frame {
        id: Eid::from(row.try_get::<String, _>("id")?),
        video_id: Eid::from(row.try_get::<String, _>("video_id")?),
        number: number as u32,
        timestamp: row.try_get("timestamp")?,
        path: PathBuf::from(row.try_get::<String, _>("path")?),
        resolution: Resolution {
            width: width as u32,
            height: height as u32,
        },
        quality: serde_json::from_str::<QualityMetrics>(&quality)?,
        vector: vector.map(|bytes| bytes_to_vector(&bytes)).transpose()?,
        metadata: match metadata {
            Some(m) => serde_json::from_str::<Map<String, Value>>(&m)?,
            None => Map::new(),
        },
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl VectorStore for FrameStore {
    async fn upsert_vectors(&self, batch: &[VectorEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for entry in batch {
            sqlx::query(
                "INSERT INTO frame_vectors (frame_id, vector, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(frame_id) DO UPDATE SET
                    vector = excluded.vector,
                    metadata = excluded.metadata",
            )
            .bind(entry.id.as_str())
            .bind(vector_to_bytes(&entry.vector))
            .bind(serde_json::to_string(&entry.metadata)?)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        // dropping `tx` on an early return above rolls back
        tx.commit().await?;
        Ok(())
    }

    async fn load_vector(&self, id: &Eid) -> Result<Option<Vec<f32>>, StoreError> {
        let bytes: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT vector FROM frame_vectors WHERE frame_id = ?1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(bytes.map(|b| bytes_to_vector(&b)).transpose()?)
    }

    async fn scan_vectors(&self) -> Result<Vec<(Eid, Vec<f32>)>, StoreError> {
        let rows = sqlx::query("SELECT frame_id, vector FROM frame_vectors ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<_, StoreError> {
                let id: String = row.try_get("frame_id")?;
                let bytes: Vec<u8> = row.try_get("vector")?;
                Ok((Eid::from(id), bytes_to_vector(&bytes)?))
            })
            .collect()
    }
}
