//! Frame ingestion sources.
//!
//! This module provides the four capture kinds a Scene can come from:
//! - Still images (JPEG/PNG)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Live cameras (feature: ingest-v4l2)
//! - Network streams: RTSP (feature: rtsp-gstreamer), HTTP MJPEG (feature: stream-mjpeg)
//!
//! Every kind also accepts `stub://` locations that synthesise frames, used by tests.
//!
//! `SourceDescriptor` names what to open; `CaptureSource` is the opened source.
//! The kind is resolved once at open and dispatched by match afterwards.
//!
//! Sources hand frames over as RGB24 and never write pixels to disk.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod image;
#[cfg(feature = "stream-mjpeg")]
pub(crate) mod mjpeg;
pub(crate) mod normalize;
pub mod rtsp;
pub(crate) mod synthetic;
pub mod v4l2;

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::config::CaptureSettings;
use crate::error::{IngestError, ValidationError};
use crate::frame::Frame;

pub use file::{FileConfig, FileSource};
pub use self::image::{ImageConfig, ImageSource};
pub use rtsp::{StreamConfig, StreamSource};
pub use v4l2::{CameraConfig, CameraSource};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mpeg", "mpg", "mov", "mkv", "webm"];
const STREAM_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https"];

/// The four capture kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Image,
    Video,
    Camera,
    Stream,
}

impl SourceKind {
    /// Live sources that only end when the caller stops reading.
    pub fn is_continuous(self) -> bool {
        matches!(self, SourceKind::Camera | SourceKind::Stream)
    }

    /// Sources that deliver exactly one frame.
    pub fn is_one_shot(self) -> bool {
        self == SourceKind::Image
    }

    /// Camera id recorded on the Scene when the request does not name one.
    pub fn default_camera_id(self) -> &'static str {
        match self {
            SourceKind::Image => "image_upload",
            SourceKind::Video => "video_upload",
            SourceKind::Camera => "webcam",
            SourceKind::Stream => "rtsp_stream",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Image => "image",
            SourceKind::Video => "video",
            SourceKind::Camera => "camera",
            SourceKind::Stream => "stream",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    Image { path: String },
    Video { path: String },
    Camera { device: String },
    Stream { url: String },
}

impl SourceDescriptor {
    /// Pick image or video from a file path's extension.
    pub fn from_path(path: &str) -> Result<Self, ValidationError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::new("media path must not be empty"));
        }
        let ext = file_extension(trimmed)
            .ok_or_else(|| ValidationError::new(format!("'{}' has no file extension", trimmed)))?;
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Ok(SourceDescriptor::Image {
                path: trimmed.to_string(),
            })
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Ok(SourceDescriptor::Video {
                path: trimmed.to_string(),
            })
        } else {
            Err(ValidationError::new(format!(
                "unsupported media extension '.{}'",
                ext
            )))
        }
    }

    /// A camera by device path, `stub://` location, or bare index (`0` -> `/dev/video0`).
    pub fn camera(selector: &str) -> Result<Self, ValidationError> {
        let trimmed = selector.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::new("camera device must not be empty"));
        }
        let device = match trimmed.parse::<u32>() {
            Ok(index) => format!("/dev/video{}", index),
            Err(_) => trimmed.to_string(),
        };
        Ok(SourceDescriptor::Camera { device })
    }

    pub fn stream(url: &str) -> Result<Self, ValidationError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::new("stream url must not be empty"));
        }
        if synthetic::is_stub(trimmed) {
            return Ok(SourceDescriptor::Stream {
                url: trimmed.to_string(),
            });
        }
        let parsed = url::Url::parse(trimmed)
            .map_err(|err| ValidationError::new(format!("invalid stream url '{}': {}", trimmed, err)))?;
        if !STREAM_SCHEMES.contains(&parsed.scheme()) {
            return Err(ValidationError::new(format!(
                "unsupported stream scheme '{}'",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ValidationError::new(format!(
                "stream url '{}' has no host",
                trimmed
            )));
        }
        Ok(SourceDescriptor::Stream {
            url: trimmed.to_string(),
        })
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDescriptor::Image { .. } => SourceKind::Image,
            SourceDescriptor::Video { .. } => SourceKind::Video,
            SourceDescriptor::Camera { .. } => SourceKind::Camera,
            SourceDescriptor::Stream { .. } => SourceKind::Stream,
        }
    }

    /// Path, device, or URL.
    pub fn location(&self) -> &str {
        match self {
            SourceDescriptor::Image { path } | SourceDescriptor::Video { path } => path,
            SourceDescriptor::Camera { device } => device,
            SourceDescriptor::Stream { url } => url,
        }
    }
}

fn file_extension(path: &str) -> Option<String> {
    // Synthetic locations may carry a query string after the file name.
    let path = if synthetic::is_stub(path) {
        path.split('?').next().unwrap_or(path)
    } else {
        path
    };
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Statistics shared by every source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub location: String,
}

/// An opened capture source.
///
/// Reads are classified into the `IngestError` taxonomy here so the pipeline
/// only sees `Ok(Some(frame))`, `Ok(None)` at end of stream, or a classified error.
pub struct CaptureSource {
    backend: CaptureBackend,
    ended: bool,
    released: bool,
}

enum CaptureBackend {
    Image(ImageSource),
    Video(FileSource),
    Camera(CameraSource),
    Stream(StreamSource),
}

impl CaptureSource {
    /// Open the source. Any failure here is `SourceUnavailable`.
    pub fn open(
        descriptor: &SourceDescriptor,
        settings: &CaptureSettings,
    ) -> Result<Self, IngestError> {
        let backend = open_backend(descriptor, settings)
            .map_err(|err| IngestError::source_unavailable(&err))?;
        Ok(Self {
            backend,
            ended: false,
            released: false,
        })
    }

    pub fn kind(&self) -> SourceKind {
        match &self.backend {
            CaptureBackend::Image(_) => SourceKind::Image,
            CaptureBackend::Video(_) => SourceKind::Video,
            CaptureBackend::Camera(_) => SourceKind::Camera,
            CaptureBackend::Stream(_) => SourceKind::Stream,
        }
    }

    /// `WxH` as reported by the source before the first frame, if it knows.
    pub fn resolution(&self) -> Option<String> {
        match &self.backend {
            CaptureBackend::Image(source) => Some(source.resolution()),
            CaptureBackend::Video(source) => source.resolution(),
            CaptureBackend::Camera(source) => source.resolution(),
            CaptureBackend::Stream(source) => source.resolution(),
        }
    }

    /// Read the next frame.
    ///
    /// - image: one frame then `None`; undecodable images already failed at open
    /// - video: frames until end of file; a bad frame is `Decode` for that call only
    /// - camera: never `None`; a failed capture is `Decode`
    /// - stream: a dropped connection ends the stream (`None`)
    pub fn next_frame(&mut self) -> Result<Option<Frame>, IngestError> {
        if self.ended || self.released {
            return Ok(None);
        }
        let result = match &mut self.backend {
            CaptureBackend::Image(source) => source.next_frame().map_err(|err| IngestError::decode(&err)),
            CaptureBackend::Video(source) => source.next_frame().map_err(|err| IngestError::decode(&err)),
            CaptureBackend::Camera(source) => source
                .next_frame()
                .map(Some)
                .map_err(|err| IngestError::decode(&err)),
            CaptureBackend::Stream(source) => match source.next_frame() {
                Ok(frame) => Ok(Some(frame)),
                Err(err) => {
                    log::warn!(
                        "stream {} dropped after {} frames: {:#}",
                        source.stats().location,
                        source.stats().frames_captured,
                        err
                    );
                    Ok(None)
                }
            },
        };
        if matches!(result, Ok(None)) {
            self.ended = true;
        }
        result
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            CaptureBackend::Image(_) => true,
            CaptureBackend::Video(source) => source.is_healthy(),
            CaptureBackend::Camera(source) => source.is_healthy(),
            CaptureBackend::Stream(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            CaptureBackend::Image(source) => source.stats(),
            CaptureBackend::Video(source) => source.stats(),
            CaptureBackend::Camera(source) => source.stats(),
            CaptureBackend::Stream(source) => source.stats(),
        }
    }

    /// Release the underlying device or connection.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match &mut self.backend {
            CaptureBackend::Camera(source) => source.close(),
            CaptureBackend::Stream(source) => source.close(),
            CaptureBackend::Image(_) | CaptureBackend::Video(_) => {}
        }
        let stats = self.stats();
        log::debug!(
            "released {} source {} after {} frames",
            self.kind(),
            stats.location,
            stats.frames_captured
        );
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_backend(
    descriptor: &SourceDescriptor,
    settings: &CaptureSettings,
) -> anyhow::Result<CaptureBackend> {
    match descriptor {
        SourceDescriptor::Image { path } => Ok(CaptureBackend::Image(ImageSource::new(
            ImageConfig { path: path.clone() },
        )?)),
        SourceDescriptor::Video { path } => {
            let mut source = FileSource::new(FileConfig { path: path.clone() })?;
            source.connect()?;
            Ok(CaptureBackend::Video(source))
        }
        SourceDescriptor::Camera { device } => {
            let mut source = CameraSource::new(CameraConfig {
                device: device.clone(),
                target_fps: settings.camera.target_fps,
                width: settings.camera.width,
                height: settings.camera.height,
            })?;
            source.connect()?;
            Ok(CaptureBackend::Camera(source))
        }
        SourceDescriptor::Stream { url } => {
            let mut source = StreamSource::new(StreamConfig {
                url: url.clone(),
                target_fps: settings.stream.target_fps,
                connect_timeout: settings.stream.connect_timeout(),
                read_timeout: settings.stream.read_timeout(),
                width: settings.stream.width,
                height: settings.stream.height,
            })?;
            source.connect()?;
            Ok(CaptureBackend::Stream(source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_kind_follows_extension() {
        assert_eq!(
            SourceDescriptor::from_path("/tmp/a.JPG").map(|d| d.kind()),
            Ok(SourceKind::Image)
        );
        assert_eq!(
            SourceDescriptor::from_path("clip.mkv").map(|d| d.kind()),
            Ok(SourceKind::Video)
        );
        assert_eq!(
            SourceDescriptor::from_path("stub://clip.mp4?frames=3").map(|d| d.kind()),
            Ok(SourceKind::Video)
        );
        assert!(SourceDescriptor::from_path("notes.txt").is_err());
        assert!(SourceDescriptor::from_path("no_extension").is_err());
        assert!(SourceDescriptor::from_path("  ").is_err());
    }

    #[test]
    fn camera_index_maps_to_device_node() {
        assert_eq!(
            SourceDescriptor::camera("2"),
            Ok(SourceDescriptor::Camera {
                device: "/dev/video2".to_string()
            })
        );
        assert_eq!(
            SourceDescriptor::camera("stub://webcam").map(|d| d.location().to_string()),
            Ok("stub://webcam".to_string())
        );
        assert!(SourceDescriptor::camera("").is_err());
    }

    #[test]
    fn stream_urls_are_checked() {
        assert!(SourceDescriptor::stream("rtsp://10.0.0.5:554/live").is_ok());
        assert!(SourceDescriptor::stream("http://cam.local/mjpeg").is_ok());
        assert!(SourceDescriptor::stream("stub://lobby?fail_after=3").is_ok());
        assert!(SourceDescriptor::stream("ftp://cam.local/feed").is_err());
        assert!(SourceDescriptor::stream("not a url").is_err());
    }

    #[test]
    fn continuous_kinds() {
        assert!(SourceKind::Camera.is_continuous());
        assert!(SourceKind::Stream.is_continuous());
        assert!(!SourceKind::Image.is_continuous());
        assert_eq!(SourceKind::Stream.default_camera_id(), "rtsp_stream");
    }

    #[test]
    fn dropped_stream_ends_instead_of_failing() -> Result<(), IngestError> {
        let descriptor = SourceDescriptor::stream("stub://lobby?fps=500&fail_after=2&width=4&height=4")?;
        let mut source = CaptureSource::open(&descriptor, &CaptureSettings::default())?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert!(source.next_frame()?.is_none());
        source.close();
        Ok(())
    }

    #[test]
    fn corrupt_video_frames_are_decode_errors() -> Result<(), IngestError> {
        let descriptor = SourceDescriptor::from_path("stub://clip.mp4?frames=2&width=2&height=2&corrupt_every=2")?;
        let mut source = CaptureSource::open(&descriptor, &CaptureSettings::default())?;
        assert!(source.next_frame()?.is_some());
        let err = match source.next_frame() {
            Err(err) => err,
            Ok(_) => panic!("second frame should be corrupt"),
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn missing_image_is_source_unavailable() {
        let descriptor = SourceDescriptor::Image {
            path: "/nonexistent/dir/photo.png".to_string(),
        };
        let err = CaptureSource::open(&descriptor, &CaptureSettings::default())
            .err()
            .map(|e| e.kind());
        assert_eq!(err, Some(crate::error::ErrorKind::SourceUnavailable));
    }
}
