//! Scene Store.
//!
//! `SceneStore` is the narrow write seam the pipeline depends on. `SqliteSceneStore`
//! implements it on SQLite and adds the read and administrative operations.
//!
//! Each handle owns one connection. Handles are `Send` but not shared: every worker
//! or request opens its own. Every mutating call runs in its own IMMEDIATE
//! transaction, so concurrent writers serialize on the database lock (bounded by
//! the busy timeout) instead of failing mid-transaction.

use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::StoreError;
use crate::scene::{
    format_timestamp, parse_timestamp, BoundingBox, Detection, DetectionFilter, DetectionId,
    DetectionUpdate, NewScene, Scene, SceneFilter, SceneId, SceneUpdate, StoredDetection,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Writes the ingestion pipeline performs.
pub trait SceneStore {
    /// Persist a new Scene and return its freshly assigned identifier.
    fn create_scene(&mut self, scene: &NewScene) -> StoreResult<SceneId>;

    /// Persist one batch atomically. Returns the number of rows written.
    ///
    /// Fails with `StoreError::MissingScene` when `scene_id` does not exist; in that
    /// case nothing is written.
    fn append_detections(&mut self, scene_id: SceneId, detections: &[Detection])
        -> StoreResult<usize>;
}

pub struct SqliteSceneStore {
    conn: Connection,
}

impl SqliteSceneStore {
    /// Open (and create if needed) the store at `db_path`.
    ///
    /// `":memory:"` opens a private in-memory database. To share an in-memory
    /// database between handles, pass the same `shared_memory_uri()` to each.
    pub fn open(db_path: &str, busy_timeout: Duration) -> StoreResult<Self> {
        let db_path = if db_path == ":memory:" {
            crate::shared_memory_uri()
        } else {
            db_path.to_string()
        };
        let conn = crate::open_db_connection(&db_path)?;
        conn.busy_timeout(busy_timeout)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> StoreResult<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS scenes (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp TEXT NOT NULL,
              latitude REAL CHECK (latitude IS NULL OR latitude BETWEEN -90.0 AND 90.0),
              longitude REAL CHECK (longitude IS NULL OR longitude BETWEEN -180.0 AND 180.0),
              resolution TEXT,
              camera_id TEXT NOT NULL,
              media_path TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              scene_id INTEGER NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
              class TEXT NOT NULL,
              confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
              x_min REAL NOT NULL,
              y_min REAL NOT NULL,
              x_max REAL NOT NULL,
              y_max REAL NOT NULL,
              CHECK (x_min < x_max AND y_min < y_max)
            );

            CREATE INDEX IF NOT EXISTS idx_scenes_timestamp ON scenes(timestamp);
            CREATE INDEX IF NOT EXISTS idx_scenes_camera ON scenes(camera_id);
            CREATE INDEX IF NOT EXISTS idx_detections_scene ON detections(scene_id);
            CREATE INDEX IF NOT EXISTS idx_detections_class ON detections(class);
            "#,
        )?;
        Ok(())
    }

    pub fn get_scene(&self, scene_id: SceneId) -> StoreResult<Option<Scene>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, timestamp, camera_id, media_path, resolution, latitude, longitude \
                 FROM scenes WHERE id = ?1",
                params![scene_id],
                read_scene_row,
            )
            .optional()?;
        raw.map(RawScene::into_scene).transpose()
    }

    /// Scenes matching every supplied filter field, ordered by id.
    pub fn list_scenes(&self, filter: &SceneFilter) -> StoreResult<Vec<Scene>> {
        let mut sql = String::from(
            "SELECT id, timestamp, camera_id, media_path, resolution, latitude, longitude \
             FROM scenes WHERE 1=1",
        );
        let mut values: Vec<Value> = Vec::new();
        if let Some(since) = &filter.since {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Text(format_timestamp(since)));
        }
        if let Some(until) = &filter.until {
            sql.push_str(" AND timestamp <= ?");
            values.push(Value::Text(format_timestamp(until)));
        }
        if let Some(camera_id) = &filter.camera_id {
            sql.push_str(" AND camera_id = ?");
            values.push(Value::Text(camera_id.clone()));
        }
        sql.push_str(" ORDER BY id ASC");
        push_limit(&mut sql, &mut values, filter.limit);

        let raws = {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), read_scene_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raws.into_iter().map(RawScene::into_scene).collect()
    }

    /// Detections matching every supplied filter field, ordered by id.
    pub fn list_detections(&self, filter: &DetectionFilter) -> StoreResult<Vec<StoredDetection>> {
        let mut sql = String::from(
            "SELECT id, scene_id, class, confidence, x_min, y_min, x_max, y_max \
             FROM detections WHERE 1=1",
        );
        let mut values: Vec<Value> = Vec::new();
        if let Some(scene_id) = filter.scene_id {
            sql.push_str(" AND scene_id = ?");
            values.push(Value::Integer(scene_id));
        }
        if let Some(class_label) = &filter.class_label {
            sql.push_str(" AND class = ?");
            values.push(Value::Text(class_label.clone()));
        }
        if let Some(min_confidence) = filter.min_confidence {
            sql.push_str(" AND confidence >= ?");
            values.push(Value::Real(min_confidence));
        }
        sql.push_str(" ORDER BY id ASC");
        push_limit(&mut sql, &mut values, filter.limit);

        let raws = {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), read_detection_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raws.into_iter().map(RawDetection::into_detection).collect()
    }

    /// All detections of one scene in insertion (frame-arrival) order.
    pub fn scene_detections(&self, scene_id: SceneId) -> StoreResult<Vec<StoredDetection>> {
        self.list_detections(&DetectionFilter {
            scene_id: Some(scene_id),
            ..DetectionFilter::default()
        })
    }

    pub fn count_detections(&self, scene_id: SceneId) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections WHERE scene_id = ?1",
            params![scene_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Apply the supplied fields only. Returns false when the scene does not exist.
    pub fn update_scene(&mut self, scene_id: SceneId, update: &SceneUpdate) -> StoreResult<bool> {
        update.validate()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = scene_exists(&tx, scene_id)?;
        if exists && !update.is_empty() {
            tx.execute(
                "UPDATE scenes SET \
                   resolution = COALESCE(?1, resolution), \
                   latitude = COALESCE(?2, latitude), \
                   longitude = COALESCE(?3, longitude) \
                 WHERE id = ?4",
                params![update.resolution, update.latitude, update.longitude, scene_id],
            )?;
        }
        tx.commit()?;
        Ok(exists)
    }

    /// Delete a scene and its detections in one transaction.
    pub fn delete_scene(&mut self, scene_id: SceneId) -> StoreResult<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed_detections =
            tx.execute("DELETE FROM detections WHERE scene_id = ?1", params![scene_id])?;
        let removed = tx.execute("DELETE FROM scenes WHERE id = ?1", params![scene_id])?;
        tx.commit()?;
        if removed > 0 {
            log::info!(
                "deleted scene {} with {} detections",
                scene_id,
                removed_detections
            );
        }
        Ok(removed > 0)
    }

    /// Merge `update` into the stored detection and re-validate the result.
    pub fn update_detection(
        &mut self,
        detection_id: DetectionId,
        update: &DetectionUpdate,
    ) -> StoreResult<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                "SELECT id, scene_id, class, confidence, x_min, y_min, x_max, y_max \
                 FROM detections WHERE id = ?1",
                params![detection_id],
                read_detection_row,
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };
        let current = current.into_detection()?;
        let merged = update.apply(&current.detection)?;
        let [x_min, y_min, x_max, y_max] = merged.bbox().as_array();
        tx.execute(
            "UPDATE detections SET class = ?1, confidence = ?2, \
               x_min = ?3, y_min = ?4, x_max = ?5, y_max = ?6 \
             WHERE id = ?7",
            params![
                merged.label(),
                merged.confidence(),
                x_min,
                y_min,
                x_max,
                y_max,
                detection_id
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Import several scenes together with their detections.
    ///
    /// Each scene and its detections commit in one IMMEDIATE transaction, so an
    /// imported scene is never visible without its detections. Import stops at the
    /// first failure; scenes committed before it stay.
    pub fn import_scenes(
        &mut self,
        scenes: &[(NewScene, Vec<Detection>)],
    ) -> StoreResult<Vec<SceneId>> {
        let mut ids = Vec::with_capacity(scenes.len());
        for (scene, detections) in scenes {
            scene.validate()?;
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let scene_id = insert_scene(&tx, scene)?;
            insert_detections(&tx, scene_id, detections)?;
            tx.commit()?;
            ids.push(scene_id);
        }
        log::info!("imported {} scenes", ids.len());
        Ok(ids)
    }

    pub fn delete_detection(&mut self, detection_id: DetectionId) -> StoreResult<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM detections WHERE id = ?1", params![detection_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

impl SceneStore for SqliteSceneStore {
    fn create_scene(&mut self, scene: &NewScene) -> StoreResult<SceneId> {
        scene.validate()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let scene_id = insert_scene(&tx, scene)?;
        tx.commit()?;
        Ok(scene_id)
    }

    fn append_detections(
        &mut self,
        scene_id: SceneId,
        detections: &[Detection],
    ) -> StoreResult<usize> {
        if detections.is_empty() {
            return Ok(0);
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !scene_exists(&tx, scene_id)? {
            return Err(StoreError::MissingScene(scene_id));
        }
        insert_detections(&tx, scene_id, detections)?;
        // Dropping an uncommitted transaction rolls the whole batch back.
        tx.commit()?;
        Ok(detections.len())
    }
}

fn insert_scene(conn: &Connection, scene: &NewScene) -> StoreResult<SceneId> {
    conn.execute(
        r#"
        INSERT INTO scenes(timestamp, latitude, longitude, resolution, camera_id, media_path)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            format_timestamp(&scene.timestamp),
            scene.latitude,
            scene.longitude,
            scene.resolution,
            scene.camera_id,
            scene.media_path
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_detections(
    conn: &Connection,
    scene_id: SceneId,
    detections: &[Detection],
) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO detections(scene_id, class, confidence, x_min, y_min, x_max, y_max)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )?;
    for detection in detections {
        let [x_min, y_min, x_max, y_max] = detection.bbox().as_array();
        stmt.execute(params![
            scene_id,
            detection.label(),
            detection.confidence(),
            x_min,
            y_min,
            x_max,
            y_max
        ])?;
    }
    Ok(())
}

fn scene_exists(conn: &Connection, scene_id: SceneId) -> StoreResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM scenes WHERE id = ?1",
            params![scene_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn push_limit(sql: &mut String, values: &mut Vec<Value>, limit: Option<usize>) {
    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    }
}

// Rows are read into plain structs first; domain checks happen outside the
// rusqlite row callback so they can report `StoreError::Corrupt`.

struct RawScene {
    id: SceneId,
    timestamp: String,
    camera_id: String,
    media_path: String,
    resolution: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl RawScene {
    fn into_scene(self) -> StoreResult<Scene> {
        let timestamp = parse_timestamp(&self.timestamp)
            .map_err(|e| StoreError::Corrupt(format!("scene {}: {}", self.id, e)))?;
        Ok(Scene {
            id: self.id,
            timestamp,
            camera_id: self.camera_id,
            media_path: self.media_path,
            resolution: self.resolution,
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }
}

fn read_scene_row(row: &Row<'_>) -> rusqlite::Result<RawScene> {
    Ok(RawScene {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        camera_id: row.get(2)?,
        media_path: row.get(3)?,
        resolution: row.get(4)?,
        latitude: row.get(5)?,
        longitude: row.get(6)?,
    })
}

struct RawDetection {
    id: DetectionId,
    scene_id: SceneId,
    label: String,
    confidence: f64,
    corners: [f64; 4],
}

impl RawDetection {
    fn into_detection(self) -> StoreResult<StoredDetection> {
        let [x_min, y_min, x_max, y_max] = self.corners;
        let detection = BoundingBox::new(x_min, y_min, x_max, y_max)
            .and_then(|bbox| Detection::new(self.label, self.confidence, bbox))
            .map_err(|e| StoreError::Corrupt(format!("detection {}: {}", self.id, e)))?;
        Ok(StoredDetection {
            id: self.id,
            scene_id: self.scene_id,
            detection,
        })
    }
}

fn read_detection_row(row: &Row<'_>) -> rusqlite::Result<RawDetection> {
    Ok(RawDetection {
        id: row.get(0)?,
        scene_id: row.get(1)?,
        label: row.get(2)?,
        confidence: row.get(3)?,
        corners: [row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?],
    })
}

// -------------------- In-memory store --------------------

/// Process-local store with the same write semantics as `SqliteSceneStore`.
///
/// Used by pipeline tests, including fault injection on batch writes.
#[derive(Clone, Debug, Default)]
pub struct InMemorySceneStore {
    scenes: Vec<Scene>,
    detections: Vec<StoredDetection>,
    next_detection_id: DetectionId,
    fail_appends_after: Option<usize>,
    appends: usize,
}

impl InMemorySceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `append_detections` call after the first `batches` fails.
    pub fn failing_appends_after(mut self, batches: usize) -> Self {
        self.fail_appends_after = Some(batches);
        self
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn detections(&self) -> &[StoredDetection] {
        &self.detections
    }
}

impl SceneStore for InMemorySceneStore {
    fn create_scene(&mut self, scene: &NewScene) -> StoreResult<SceneId> {
        scene.validate()?;
        let id = self.scenes.last().map_or(1, |last| last.id + 1);
        self.scenes.push(Scene {
            id,
            timestamp: scene.timestamp,
            camera_id: scene.camera_id.clone(),
            media_path: scene.media_path.clone(),
            resolution: scene.resolution.clone(),
            latitude: scene.latitude,
            longitude: scene.longitude,
        });
        Ok(id)
    }

    fn append_detections(
        &mut self,
        scene_id: SceneId,
        detections: &[Detection],
    ) -> StoreResult<usize> {
        if detections.is_empty() {
            return Ok(0);
        }
        if let Some(limit) = self.fail_appends_after {
            if self.appends >= limit {
                return Err(StoreError::Corrupt("injected write failure".to_string()));
            }
        }
        if !self.scenes.iter().any(|scene| scene.id == scene_id) {
            return Err(StoreError::MissingScene(scene_id));
        }
        self.appends += 1;
        for detection in detections {
            self.next_detection_id += 1;
            self.detections.push(StoredDetection {
                id: self.next_detection_id,
                scene_id,
                detection: detection.clone(),
            });
        }
        Ok(detections.len())
    }
}
