//! Local video file source.
//!
//! `FileSource` decodes a finite video file frame by frame. The source is
//! responsible for:
//! - Reading a local file only (no URL schemes other than `stub://`)
//! - Decoding frames in memory and handing them over as RGB24
//! - Reporting end of file as `Ok(None)`
//!
//! A frame that fails to decode is an `Err` for that call only; the next call
//! continues with the following frame.

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::synthetic::{is_stub, StubParams, SyntheticScene};
use super::SourceStats;
use crate::frame::Frame;

/// Configuration for a local file source.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    /// Local file path (e.g., "/var/lib/scenes/upload.mp4").
    pub path: String,
}

/// Local video file source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        if is_stub(&config.path) {
            return Ok(Self {
                backend: FileBackend::Synthetic(SyntheticFileSource::new(config)?),
            });
        }
        if !std::path::Path::new(&config.path).is_file() {
            return Err(anyhow!("video file '{}' does not exist", config.path));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(Self {
                backend: FileBackend::Ffmpeg(FfmpegFileSource::new(config)?),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "video decoding requires the ingest-file-ffmpeg feature"
            ))
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.connect(),
        }
    }

    /// Decode the next frame, `Ok(None)` once the file is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    /// `WxH` of the decoded stream, when known before the first frame.
    pub fn resolution(&self) -> Option<String> {
        match &self.backend {
            FileBackend::Synthetic(source) => Some(source.scene.resolution()),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.resolution(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            FileBackend::Synthetic(_) => true,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            FileBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticFileSource {
    config: FileConfig,
    scene: SyntheticScene,
    total_frames: u64,
}

impl SyntheticFileSource {
    fn new(config: FileConfig) -> Result<Self> {
        let params = StubParams::parse(&config.path)?;
        let total_frames = params.u32_or("frames", 30)? as u64;
        let scene = SyntheticScene::from_params(&params, 640, 480)?;
        log::debug!("synthetic clip '{}': {} frames", params.name, total_frames);
        Ok(Self {
            config,
            scene,
            total_frames,
        })
    }

    fn connect(&mut self) -> Result<()> {
        log::info!(
            "FileSource: opened {} (synthetic, {} frames)",
            self.config.path,
            self.total_frames
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.scene.frames_generated() >= self.total_frames {
            return Ok(None);
        }
        self.scene.next_frame().map(Some)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.scene.frames_generated(),
            location: self.config.path.clone(),
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if is_stub(path) {
        return true;
    }
    !path.contains("://")
}
