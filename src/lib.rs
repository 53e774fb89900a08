//! Scene ingestion
//!
//! This crate turns media into persisted scenes: it reads frames from a capture
//! source, hands each frame to an object detector, and records the session and
//! its detections in a SQLite scene store.
//!
//! # Architecture
//!
//! Every request runs through one `IngestPipeline`:
//!
//! 1. **INIT**: parameters are validated before anything is opened.
//! 2. **OPENING**: the capture source is opened, then the Scene row is created.
//! 3. **STREAMING**: frames are read and detected; each frame's detections are
//!    committed as one atomic batch. Live sources stop at a wall-clock bound.
//! 4. **FINALIZING**: the source is released and a summary is returned.
//!
//! A failure after OPENING leaves the Scene and its committed batches in place.
//!
//! # Module Structure
//!
//! - `ingest`: capture sources (image, video, camera, network stream)
//! - `detect`: the detector seam and its backends
//! - `storage`: the scene store
//! - `pipeline`: the per-request state machine
//! - `pool`, `service`: concurrent execution and the request surface

use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod pool;
pub mod scene;
pub mod service;
pub mod storage;

pub use config::{CaptureSettings, DetectorKind, DetectorSettings, IngestConfig};
pub use detect::{backend_from_settings, factory_from_settings, DetectorBackend, DetectorFactory, StubBackend};
pub use error::{ErrorKind, IngestError, PipelineError, StoreError, ValidationError};
pub use frame::Frame;
pub use ingest::{CaptureSource, SourceDescriptor, SourceKind, SourceStats};
pub use pipeline::{CancelToken, IngestPipeline, IngestRequest, IngestSummary, PipelineState, Termination};
pub use pool::{IngestJob, IngestPool};
pub use scene::{
    BoundingBox, Detection, DetectionFilter, DetectionId, DetectionUpdate, NewScene, Scene,
    SceneFilter, SceneId, SceneMetadata, SceneUpdate, StoredDetection,
};
pub use service::{
    ContinuousIngestResponse, ContinuousSource, ImageIngestResponse, IngestService,
    VideoIngestResponse,
};
pub use storage::{InMemorySceneStore, SceneStore, SqliteSceneStore};

/// URI of a fresh in-memory database that several connections in this process can share.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:scene_ingest_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> rusqlite::Result<Connection> {
    if db_path.starts_with("file:") {
        return Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        );
    }
    Connection::open(db_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn shared_memory_uri_is_unique() {
        let a = shared_memory_uri();
        let b = shared_memory_uri();
        assert!(a.starts_with("file:scene_ingest_"));
        assert!(a.ends_with("?mode=memory&cache=shared"));
        assert_ne!(a, b);
    }

    #[test]
    fn handles_on_one_shared_uri_see_each_other() -> anyhow::Result<()> {
        let uri = shared_memory_uri();
        let mut writer = SqliteSceneStore::open(&uri, Duration::from_secs(1))?;
        let reader = SqliteSceneStore::open(&uri, Duration::from_secs(1))?;
        let id = writer.create_scene(&NewScene::new("webcam", "tag"))?;
        assert!(reader.get_scene(id)?.is_some());
        Ok(())
    }
}
