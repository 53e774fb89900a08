//! Request surface for ingestion.
//!
//! These are the three calls a transport layer exposes. Each call opens its own
//! store handle and detector, runs one pipeline on the calling thread, and
//! returns a serializable response.

use serde::Serialize;

use crate::config::IngestConfig;
use crate::detect::DetectorFactory;
use crate::error::{IngestError, PipelineError};
use crate::ingest::{SourceDescriptor, SourceKind};
use crate::pipeline::{CancelToken, IngestPipeline, IngestRequest, IngestSummary, PipelineState};
use crate::pool::build_detector;
use crate::scene::{SceneId, SceneMetadata, StoredDetection};
use crate::storage::SqliteSceneStore;

pub const IMAGE_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/jpg"];
pub const VIDEO_CONTENT_TYPES: &[&str] = &["video/mp4", "video/avi", "video/mpeg"];

#[derive(Clone, Debug, Serialize)]
pub struct ImageIngestResponse {
    pub scene_id: SceneId,
    pub detections: Vec<StoredDetection>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VideoIngestResponse {
    pub scene_id: SceneId,
    pub total_detections: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ContinuousIngestResponse {
    pub scene_id: SceneId,
    pub message: String,
}

/// Live source for `ingest_continuous`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContinuousSource {
    /// The configured camera device.
    Camera,
    Stream { url: String },
}

pub struct IngestService {
    config: IngestConfig,
    detectors: DetectorFactory,
    cancel: CancelToken,
}

impl IngestService {
    pub fn new(config: IngestConfig, detectors: DetectorFactory) -> Self {
        Self {
            config,
            detectors,
            cancel: CancelToken::new(),
        }
    }

    /// Stop continuous ingestion early when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ingest_image(
        &self,
        path: &str,
        content_type: Option<&str>,
        metadata: SceneMetadata,
    ) -> Result<ImageIngestResponse, PipelineError> {
        check_content_type(content_type, IMAGE_CONTENT_TYPES).map_err(at_init)?;
        let descriptor = file_descriptor(path, SourceKind::Image).map_err(at_init)?;
        let (summary, store) = self.execute(IngestRequest::new(descriptor).with_metadata(metadata))?;
        let detections = store
            .scene_detections(summary.scene_id)
            .map_err(|err| PipelineError {
                phase: PipelineState::Finalizing,
                scene_id: Some(summary.scene_id),
                persisted_detections: summary.persisted_detections,
                source: err.into(),
            })?;
        Ok(ImageIngestResponse {
            scene_id: summary.scene_id,
            detections,
        })
    }

    pub fn ingest_video(
        &self,
        path: &str,
        content_type: Option<&str>,
        metadata: SceneMetadata,
    ) -> Result<VideoIngestResponse, PipelineError> {
        check_content_type(content_type, VIDEO_CONTENT_TYPES).map_err(at_init)?;
        let descriptor = file_descriptor(path, SourceKind::Video).map_err(at_init)?;
        let (summary, _) = self.execute(IngestRequest::new(descriptor).with_metadata(metadata))?;
        Ok(VideoIngestResponse {
            scene_id: summary.scene_id,
            total_detections: summary.persisted_detections,
        })
    }

    pub fn ingest_continuous(
        &self,
        source: ContinuousSource,
        duration_secs: u64,
        metadata: SceneMetadata,
    ) -> Result<ContinuousIngestResponse, PipelineError> {
        let (descriptor, label) = match &source {
            ContinuousSource::Camera => (
                SourceDescriptor::camera(&self.config.capture.camera.device),
                "Webcam",
            ),
            ContinuousSource::Stream { url } => (SourceDescriptor::stream(url), stream_label(url)),
        };
        let descriptor = descriptor.map_err(|err| at_init(err.into()))?;
        let request = IngestRequest::new(descriptor)
            .with_duration(duration_secs)
            .with_metadata(metadata);
        let (summary, _) = self.execute(request)?;
        Ok(ContinuousIngestResponse {
            scene_id: summary.scene_id,
            message: format!("{} detection completed for {} seconds", label, duration_secs),
        })
    }

    fn execute(
        &self,
        request: IngestRequest,
    ) -> Result<(IngestSummary, SqliteSceneStore), PipelineError> {
        request.validate().map_err(at_init)?;
        let mut store = SqliteSceneStore::open(&self.config.db_path, self.config.busy_timeout)
            .map_err(|err| PipelineError::before_scene(PipelineState::Opening, err.into()))?;
        let mut detector = build_detector(&self.detectors)
            .map_err(|err| PipelineError::before_scene(PipelineState::Opening, err))?;
        let summary = IngestPipeline::new(&mut store, detector.as_mut(), &self.config.capture)
            .with_cancel(self.cancel.clone())
            .run(&request)?;
        Ok((summary, store))
    }
}

fn at_init(err: IngestError) -> PipelineError {
    PipelineError::before_scene(PipelineState::Init, err)
}

fn stream_label(url: &str) -> &'static str {
    let scheme = url.split("://").next().unwrap_or_default().to_ascii_lowercase();
    match scheme.as_str() {
        "http" | "https" => "MJPEG stream",
        _ => "RTSP stream",
    }
}

fn check_content_type(content_type: Option<&str>, allowed: &[&str]) -> Result<(), IngestError> {
    let Some(content_type) = content_type else {
        return Ok(());
    };
    // Parameters such as "; charset=..." are not part of the media type.
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    if allowed.contains(&media_type.as_str()) {
        Ok(())
    } else {
        Err(IngestError::validation(format!(
            "content type '{}' is not allowed, expected one of {}",
            content_type,
            allowed.join(", ")
        )))
    }
}

fn file_descriptor(path: &str, expected: SourceKind) -> Result<SourceDescriptor, IngestError> {
    let descriptor = SourceDescriptor::from_path(path)?;
    if descriptor.kind() != expected {
        return Err(IngestError::validation(format!(
            "'{}' is not a {} file",
            path, expected
        )));
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn content_type_allowlist() {
        assert!(check_content_type(None, IMAGE_CONTENT_TYPES).is_ok());
        assert!(check_content_type(Some("image/png"), IMAGE_CONTENT_TYPES).is_ok());
        assert!(check_content_type(Some("Image/JPEG; q=1"), IMAGE_CONTENT_TYPES).is_ok());
        assert!(check_content_type(Some("image/gif"), IMAGE_CONTENT_TYPES).is_err());
        assert!(check_content_type(Some("video/webm"), VIDEO_CONTENT_TYPES).is_err());
    }

    #[test]
    fn stream_label_follows_scheme() {
        assert_eq!(stream_label("rtsp://10.0.0.5/live"), "RTSP stream");
        assert_eq!(stream_label("http://cam.local/mjpeg"), "MJPEG stream");
        assert_eq!(stream_label("HTTPS://cam.local/mjpeg"), "MJPEG stream");
        assert_eq!(stream_label("stub://lobby"), "RTSP stream");
    }

    #[test]
    fn file_kind_must_match_call() {
        assert!(file_descriptor("a.png", SourceKind::Image).is_ok());
        let err = file_descriptor("a.mp4", SourceKind::Image).err().map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::Validation));
    }
}
