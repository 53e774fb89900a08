//! Ingestion pipeline.
//!
//! One `IngestPipeline::run` call drives one request through
//! `INIT -> OPENING -> STREAMING -> FINALIZING -> DONE`, or into `FAILED` from
//! `INIT`, `OPENING` or `STREAMING`.
//!
//! The Scene row is created only after the source opened, and every frame's
//! detections are committed as one batch before the next frame is read. A failure
//! in `STREAMING` therefore leaves the Scene and every earlier batch in place.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::CaptureSettings;
use crate::detect::DetectorBackend;
use crate::error::{ErrorKind, IngestError, PipelineError};
use crate::ingest::{CaptureSource, SourceDescriptor, SourceKind};
use crate::scene::{NewScene, SceneId, SceneMetadata};
use crate::storage::SceneStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Init,
    Opening,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Init => "INIT",
            PipelineState::Opening => "OPENING",
            PipelineState::Streaming => "STREAMING",
            PipelineState::Finalizing => "FINALIZING",
            PipelineState::Done => "DONE",
            PipelineState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative stop signal, checked at the same point as the duration bound.
///
/// It cannot interrupt a frame read or a detector call that is already running.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IngestRequest {
    pub descriptor: SourceDescriptor,
    /// Wall-clock bound in seconds. Required for cameras and streams, ignored otherwise.
    pub duration_secs: Option<u64>,
    pub metadata: SceneMetadata,
}

impl IngestRequest {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        Self {
            descriptor,
            duration_secs: None,
            metadata: SceneMetadata::default(),
        }
    }

    pub fn with_duration(mut self, duration_secs: u64) -> Self {
        self.duration_secs = Some(duration_secs);
        self
    }

    pub fn with_metadata(mut self, metadata: SceneMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check parameters and return the duration bound, if the kind takes one.
    pub fn validate(&self) -> Result<Option<Duration>, IngestError> {
        self.metadata.validate()?;
        let kind = self.descriptor.kind();
        if !kind.is_continuous() {
            if let Some(secs) = self.duration_secs {
                log::debug!("ignoring duration {}s for {} source", secs, kind);
            }
            return Ok(None);
        }
        match self.duration_secs {
            Some(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
            Some(_) => Err(IngestError::validation(
                "duration must be a positive integer",
            )),
            None => Err(IngestError::validation(format!(
                "duration is required for {} sources",
                kind
            ))),
        }
    }
}

/// Why the streaming loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    EndOfStream,
    DurationElapsed,
    SingleFrame,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct IngestSummary {
    pub scene_id: SceneId,
    pub kind: SourceKind,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub batches_persisted: u64,
    pub persisted_detections: u64,
    pub elapsed: Duration,
    pub termination: Termination,
    /// False when the source reported a fault before it was released.
    pub source_healthy: bool,
}

#[derive(Default)]
struct Progress {
    frames_processed: u64,
    frames_skipped: u64,
    batches_persisted: u64,
    persisted_detections: u64,
}

/// Runs ingestion requests against a borrowed store and detector.
///
/// The pipeline owns nothing shared: each caller passes in its own store handle and
/// detector, and the capture source opened for a request is dropped before `run`
/// returns.
pub struct IngestPipeline<'a> {
    store: &'a mut dyn SceneStore,
    detector: &'a mut dyn DetectorBackend,
    settings: &'a CaptureSettings,
    cancel: CancelToken,
    state: PipelineState,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(
        store: &'a mut dyn SceneStore,
        detector: &'a mut dyn DetectorBackend,
        settings: &'a CaptureSettings,
    ) -> Self {
        Self {
            store,
            detector,
            settings,
            cancel: CancelToken::new(),
            state: PipelineState::Init,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn run(&mut self, request: &IngestRequest) -> Result<IngestSummary, PipelineError> {
        self.transition(PipelineState::Init);
        let bound = match request.validate() {
            Ok(bound) => bound,
            Err(err) => return Err(self.fail_before_scene(err)),
        };

        self.transition(PipelineState::Opening);
        let mut source = match CaptureSource::open(&request.descriptor, self.settings) {
            Ok(source) => source,
            Err(err) => return Err(self.fail_before_scene(err)),
        };
        let kind = source.kind();
        let new_scene = scene_for(request, source.resolution());
        let scene_id = match self.store.create_scene(&new_scene) {
            Ok(id) => id,
            Err(err) => {
                source.close();
                return Err(self.fail_before_scene(err.into()));
            }
        };
        log::info!(
            "created scene {} for {} source {} (camera {})",
            scene_id,
            kind,
            request.descriptor.location(),
            new_scene.camera_id
        );

        self.transition(PipelineState::Streaming);
        let started = Instant::now();
        let mut progress = Progress::default();
        let outcome = self.stream(&mut source, scene_id, bound, started, &mut progress);
        let elapsed = started.elapsed();

        let source_healthy = source.is_healthy();
        if !source_healthy {
            let stats = source.stats();
            log::warn!(
                "{} source {} unhealthy after {} frames",
                kind,
                stats.location,
                stats.frames_captured
            );
        }
        // Released on every exit from the loop, including errors.
        source.close();

        match outcome {
            Ok(termination) => {
                self.transition(PipelineState::Finalizing);
                let summary = IngestSummary {
                    scene_id,
                    kind,
                    frames_processed: progress.frames_processed,
                    frames_skipped: progress.frames_skipped,
                    batches_persisted: progress.batches_persisted,
                    persisted_detections: progress.persisted_detections,
                    elapsed,
                    termination,
                    source_healthy,
                };
                log::info!(
                    "scene {} done ({:?}): {} frames, {} skipped, {} detections in {:.2}s",
                    scene_id,
                    termination,
                    summary.frames_processed,
                    summary.frames_skipped,
                    summary.persisted_detections,
                    elapsed.as_secs_f64()
                );
                self.transition(PipelineState::Done);
                Ok(summary)
            }
            Err(err) => {
                log::warn!(
                    "scene {} failed after {} frames with {} detections kept: {}",
                    scene_id,
                    progress.frames_processed,
                    progress.persisted_detections,
                    err
                );
                self.transition(PipelineState::Failed);
                Err(PipelineError {
                    phase: PipelineState::Streaming,
                    scene_id: Some(scene_id),
                    persisted_detections: progress.persisted_detections,
                    source: err,
                })
            }
        }
    }

    fn stream(
        &mut self,
        source: &mut CaptureSource,
        scene_id: SceneId,
        bound: Option<Duration>,
        started: Instant,
        progress: &mut Progress,
    ) -> Result<Termination, IngestError> {
        let one_shot = source.kind().is_one_shot();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Termination::Cancelled);
            }
            if let Some(bound) = bound {
                if started.elapsed() >= bound {
                    return Ok(Termination::DurationElapsed);
                }
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) if one_shot => return Ok(Termination::SingleFrame),
                Ok(None) => return Ok(Termination::EndOfStream),
                Err(err) if err.kind() == ErrorKind::Decode && !one_shot => {
                    progress.frames_skipped += 1;
                    log::warn!("scene {}: skipped frame: {}", scene_id, err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let detections = self
                .detector
                .detect(&frame)
                .map_err(|err| IngestError::Detector(format!("{:#}", err)))?;
            drop(frame);
            progress.frames_processed += 1;

            if !detections.is_empty() {
                let written = self.store.append_detections(scene_id, &detections)?;
                progress.batches_persisted += 1;
                progress.persisted_detections += written as u64;
            }

            if one_shot {
                return Ok(Termination::SingleFrame);
            }
        }
    }

    fn fail_before_scene(&mut self, err: IngestError) -> PipelineError {
        let phase = self.state;
        log::warn!("ingestion failed during {}: {}", phase, err);
        self.transition(PipelineState::Failed);
        PipelineError::before_scene(phase, err)
    }

    fn transition(&mut self, next: PipelineState) {
        log::debug!("pipeline {} -> {}", self.state, next);
        self.state = next;
    }
}

fn scene_for(request: &IngestRequest, source_resolution: Option<String>) -> NewScene {
    let kind = request.descriptor.kind();
    let camera_id = request
        .metadata
        .camera_id
        .clone()
        .unwrap_or_else(|| kind.default_camera_id().to_string());
    let mut scene = NewScene::new(camera_id, media_reference(&request.descriptor));
    scene.resolution = request.metadata.resolution.clone().or(source_resolution);
    scene.latitude = request.metadata.latitude;
    scene.longitude = request.metadata.longitude;
    scene
}

/// File path, stream URL, or a fresh tag for live cameras.
fn media_reference(descriptor: &SourceDescriptor) -> String {
    match descriptor {
        SourceDescriptor::Camera { .. } => format!("webcam_stream_{:016x}", rand::random::<u64>()),
        other => other.location().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use crate::scene::{BoundingBox, Detection};
    use crate::storage::InMemorySceneStore;

    fn object() -> Detection {
        Detection::new(
            "object",
            0.9,
            BoundingBox::new(30.0, 30.0, 70.0, 70.0).expect("valid box"),
        )
        .expect("valid detection")
    }

    fn run(
        store: &mut InMemorySceneStore,
        detector: &mut StubBackend,
        request: &IngestRequest,
    ) -> Result<IngestSummary, PipelineError> {
        let settings = CaptureSettings::default();
        IngestPipeline::new(store, detector, &settings).run(request)
    }

    #[test]
    fn continuous_sources_require_positive_duration() {
        let camera = SourceDescriptor::camera("stub://webcam").expect("descriptor");
        let mut store = InMemorySceneStore::new();
        let mut detector = StubBackend::new();

        for request in [
            IngestRequest::new(camera.clone()),
            IngestRequest::new(camera.clone()).with_duration(0),
        ] {
            let err = run(&mut store, &mut detector, &request).expect_err("must fail");
            assert!(err.is_validation());
            assert_eq!(err.phase, PipelineState::Init);
        }
        assert!(store.scenes().is_empty());
        assert_eq!(detector.calls(), 0);
    }

    #[test]
    fn invalid_metadata_fails_before_opening() {
        let request = IngestRequest::new(
            SourceDescriptor::from_path("stub://clip.mp4?frames=2").expect("descriptor"),
        )
        .with_metadata(SceneMetadata {
            latitude: Some(120.0),
            ..SceneMetadata::default()
        });
        let mut store = InMemorySceneStore::new();
        let err = run(&mut store, &mut StubBackend::new(), &request).expect_err("must fail");
        assert!(err.is_validation());
        assert!(store.scenes().is_empty());
    }

    #[test]
    fn unopenable_source_creates_no_scene() {
        let request = IngestRequest::new(SourceDescriptor::Video {
            path: "/nonexistent/clip.mp4".to_string(),
        });
        let mut store = InMemorySceneStore::new();
        let settings = CaptureSettings::default();
        let mut detector = StubBackend::new();
        let mut pipeline = IngestPipeline::new(&mut store, &mut detector, &settings);
        let err = pipeline.run(&request).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
        assert_eq!(err.phase, PipelineState::Opening);
        assert!(!err.is_partial());
        assert_eq!(pipeline.state(), PipelineState::Failed);
        drop(pipeline);
        assert!(store.scenes().is_empty());
    }

    #[test]
    fn video_persists_one_batch_per_frame_with_detections() -> anyhow::Result<()> {
        let request = IngestRequest::new(SourceDescriptor::from_path(
            "stub://clip.mp4?frames=4&width=8&height=8",
        )?)
        .with_duration(99);
        let mut store = InMemorySceneStore::new();
        let mut detector =
            StubBackend::scripted(vec![vec![object()], vec![], vec![object(), object()]]);
        let summary = run(&mut store, &mut detector, &request)?;

        assert_eq!(summary.termination, Termination::EndOfStream);
        assert_eq!(summary.frames_processed, 4);
        assert_eq!(summary.batches_persisted, 2);
        assert_eq!(summary.persisted_detections, 3);
        assert_eq!(store.detections().len(), 3);
        let scene = &store.scenes()[0];
        assert_eq!(scene.camera_id, "video_upload");
        assert_eq!(scene.media_path, "stub://clip.mp4?frames=4&width=8&height=8");
        assert_eq!(scene.resolution.as_deref(), Some("8x8"));
        Ok(())
    }

    #[test]
    fn corrupt_video_frames_are_skipped() -> anyhow::Result<()> {
        let request = IngestRequest::new(SourceDescriptor::from_path(
            "stub://clip.mp4?frames=6&width=4&height=4&corrupt_every=3",
        )?);
        let mut store = InMemorySceneStore::new();
        let mut detector = StubBackend::returning(vec![object()]);
        let summary = run(&mut store, &mut detector, &request)?;
        assert_eq!(summary.frames_skipped, 2);
        assert_eq!(summary.frames_processed, 4);
        assert_eq!(store.detections().len(), 4);
        Ok(())
    }

    #[test]
    fn camera_stops_at_duration_bound() -> anyhow::Result<()> {
        let request = IngestRequest::new(SourceDescriptor::camera(
            "stub://webcam?fps=20&width=4&height=4",
        )?)
        .with_duration(1);
        let mut store = InMemorySceneStore::new();
        let mut detector = StubBackend::new();
        let summary = run(&mut store, &mut detector, &request)?;

        assert_eq!(summary.termination, Termination::DurationElapsed);
        assert!(summary.source_healthy);
        assert!(summary.elapsed >= Duration::from_secs(1));
        assert!(summary.elapsed < Duration::from_secs(3));
        assert!(summary.frames_processed > 0);
        assert_eq!(summary.persisted_detections, 0);
        assert_eq!(store.scenes().len(), 1);
        assert!(store.scenes()[0].media_path.starts_with("webcam_stream_"));
        assert_eq!(store.scenes()[0].camera_id, "webcam");
        Ok(())
    }

    #[test]
    fn dropped_stream_keeps_earlier_batches() -> anyhow::Result<()> {
        let request = IngestRequest::new(SourceDescriptor::stream(
            "stub://lobby?fps=200&fail_after=3&width=4&height=4",
        )?)
        .with_duration(30);
        let mut store = InMemorySceneStore::new();
        let mut detector = StubBackend::returning(vec![object()]);
        let summary = run(&mut store, &mut detector, &request)?;
        assert_eq!(summary.termination, Termination::EndOfStream);
        assert_eq!(summary.persisted_detections, 3);
        assert!(!summary.source_healthy);
        assert_eq!(store.scenes()[0].camera_id, "rtsp_stream");
        Ok(())
    }

    #[test]
    fn storage_failure_is_partial() -> anyhow::Result<()> {
        let request = IngestRequest::new(SourceDescriptor::from_path(
            "stub://clip.mp4?frames=5&width=4&height=4",
        )?);
        let mut store = InMemorySceneStore::new().failing_appends_after(2);
        let mut detector = StubBackend::returning(vec![object()]);
        let err = run(&mut store, &mut detector, &request).expect_err("third batch fails");

        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.phase, PipelineState::Streaming);
        assert!(err.is_partial());
        assert_eq!(err.persisted_detections, 2);
        assert_eq!(err.scene_id, Some(store.scenes()[0].id));
        assert_eq!(store.detections().len(), 2);
        Ok(())
    }

    #[test]
    fn detector_failure_keeps_scene() -> anyhow::Result<()> {
        let request = IngestRequest::new(SourceDescriptor::from_path(
            "stub://clip.mp4?frames=5&width=4&height=4",
        )?);
        let mut store = InMemorySceneStore::new();
        let mut detector = StubBackend::returning(vec![object()]).failing_after(1);
        let err = run(&mut store, &mut detector, &request).expect_err("detector fails");
        assert_eq!(err.kind(), ErrorKind::Detector);
        assert!(err.is_partial());
        assert_eq!(store.detections().len(), 1);
        Ok(())
    }

    #[test]
    fn cancelled_pipeline_stops_before_reading() -> anyhow::Result<()> {
        let request =
            IngestRequest::new(SourceDescriptor::camera("stub://webcam")?).with_duration(60);
        let mut store = InMemorySceneStore::new();
        let mut detector = StubBackend::new();
        let settings = CaptureSettings::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let summary = IngestPipeline::new(&mut store, &mut detector, &settings)
            .with_cancel(cancel)
            .run(&request)?;
        assert_eq!(summary.termination, Termination::Cancelled);
        assert_eq!(summary.frames_processed, 0);
        assert_eq!(store.scenes().len(), 1);
        Ok(())
    }

    #[test]
    fn metadata_overrides_defaults() -> anyhow::Result<()> {
        let request = IngestRequest::new(SourceDescriptor::from_path(
            "stub://clip.mp4?frames=1&width=4&height=4",
        )?)
        .with_metadata(SceneMetadata {
            camera_id: Some("cam_007".to_string()),
            latitude: Some(51.5),
            longitude: Some(-0.12),
            resolution: Some("1920x1080".to_string()),
        });
        let mut store = InMemorySceneStore::new();
        run(&mut store, &mut StubBackend::new(), &request)?;
        let scene = &store.scenes()[0];
        assert_eq!(scene.camera_id, "cam_007");
        assert_eq!(scene.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(scene.latitude, Some(51.5));
        assert_eq!(scene.longitude, Some(-0.12));
        Ok(())
    }
}
