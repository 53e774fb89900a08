use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "scenes.db";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    db_path: Option<String>,
    busy_timeout_ms: Option<u64>,
    workers: Option<usize>,
    camera: Option<CameraConfigFile>,
    stream: Option<StreamConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    connect_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<DetectorKind>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub db_path: String,
    pub busy_timeout: Duration,
    pub workers: usize,
    pub capture: CaptureSettings,
    pub detector: DetectorSettings,
}

/// Settings handed to capture sources at open.
#[derive(Debug, Clone, Default)]
pub struct CaptureSettings {
    pub camera: CameraSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Device used when a camera request does not name one.
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: DEFAULT_CAMERA_DEVICE.to_string(),
            target_fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl StreamSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            target_fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    #[default]
    Stub,
    Tract,
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(DetectorKind::Stub),
            "tract" => Ok(DetectorKind::Tract),
            other => Err(anyhow!("unknown detector backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorKind,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DetectorKind::Stub,
            model_path: None,
            labels_path: None,
            input_width: DEFAULT_MODEL_INPUT,
            input_height: DEFAULT_MODEL_INPUT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from_file(IngestConfigFile::default())
    }
}

impl IngestConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SCENE_INGEST_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with a different database, for tests and embedding.
    pub fn with_db_path(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    fn from_file(file: IngestConfigFile) -> Self {
        let camera_defaults = CameraSettings::default();
        let camera = match file.camera {
            Some(camera) => CameraSettings {
                device: camera.device.unwrap_or(camera_defaults.device),
                target_fps: camera.target_fps.unwrap_or(camera_defaults.target_fps),
                width: camera.width.unwrap_or(camera_defaults.width),
                height: camera.height.unwrap_or(camera_defaults.height),
            },
            None => camera_defaults,
        };

        let stream_defaults = StreamSettings::default();
        let stream = match file.stream {
            Some(stream) => StreamSettings {
                connect_timeout_ms: stream
                    .connect_timeout_ms
                    .unwrap_or(stream_defaults.connect_timeout_ms),
                read_timeout_ms: stream
                    .read_timeout_ms
                    .unwrap_or(stream_defaults.read_timeout_ms),
                target_fps: stream.target_fps.unwrap_or(stream_defaults.target_fps),
                width: stream.width.unwrap_or(stream_defaults.width),
                height: stream.height.unwrap_or(stream_defaults.height),
            },
            None => stream_defaults,
        };

        let detector_defaults = DetectorSettings::default();
        let detector = match file.detector {
            Some(detector) => DetectorSettings {
                backend: detector.backend.unwrap_or(detector_defaults.backend),
                model_path: detector.model_path,
                labels_path: detector.labels_path,
                input_width: detector.input_width.unwrap_or(detector_defaults.input_width),
                input_height: detector
                    .input_height
                    .unwrap_or(detector_defaults.input_height),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(detector_defaults.confidence_threshold),
                iou_threshold: detector
                    .iou_threshold
                    .unwrap_or(detector_defaults.iou_threshold),
            },
            None => detector_defaults,
        };

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            busy_timeout: Duration::from_millis(
                file.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
            ),
            workers: file.workers.unwrap_or(DEFAULT_WORKERS),
            capture: CaptureSettings { camera, stream },
            detector,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SCENE_INGEST_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(device) = std::env::var("SCENE_INGEST_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.capture.camera.device = device;
            }
        }
        if let Ok(workers) = std::env::var("SCENE_INGEST_WORKERS") {
            self.workers = workers
                .parse()
                .map_err(|_| anyhow!("SCENE_INGEST_WORKERS must be a positive integer"))?;
        }
        if let Ok(timeout) = std::env::var("SCENE_INGEST_CONNECT_TIMEOUT_MS") {
            self.capture.stream.connect_timeout_ms = timeout.parse().map_err(|_| {
                anyhow!("SCENE_INGEST_CONNECT_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
        }
        if let Ok(backend) = std::env::var("SCENE_INGEST_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.parse()?;
            }
        }
        if let Ok(path) = std::env::var("SCENE_INGEST_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be greater than zero"));
        }
        if self.capture.camera.target_fps == 0 || self.capture.stream.target_fps == 0 {
            return Err(anyhow!("target_fps must be greater than zero"));
        }
        if self.capture.stream.connect_timeout_ms == 0 {
            return Err(anyhow!("stream connect timeout must be greater than zero"));
        }
        for (name, value) in [
            ("confidence_threshold", self.detector.confidence_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.detector.backend == DetectorKind::Tract && self.detector.model_path.is_none() {
            return Err(anyhow!("the tract detector requires detector.model_path"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<IngestConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let cfg = IngestConfig::default();
        cfg.validate()?;
        assert_eq!(cfg.db_path, "scenes.db");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.capture.camera.device, "/dev/video0");
        assert_eq!(cfg.capture.stream.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.detector.backend, DetectorKind::Stub);
        Ok(())
    }

    #[test]
    fn partial_sections_keep_defaults() -> Result<()> {
        let file: IngestConfigFile =
            serde_json::from_str(r#"{ "stream": { "target_fps": 3 }, "detector": { "backend": "tract" } }"#)?;
        let cfg = IngestConfig::from_file(file);
        assert_eq!(cfg.capture.stream.target_fps, 3);
        assert_eq!(cfg.capture.stream.connect_timeout_ms, 5_000);
        assert_eq!(cfg.detector.backend, DetectorKind::Tract);
        assert!(cfg.validate().is_err(), "tract without a model must be rejected");
        Ok(())
    }

    #[test]
    fn thresholds_are_bounded() {
        let mut cfg = IngestConfig::default();
        cfg.detector.iou_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn detector_kind_parses_case_insensitively() {
        assert_eq!("Tract".parse::<DetectorKind>().ok(), Some(DetectorKind::Tract));
        assert!("yolo".parse::<DetectorKind>().is_err());
    }
}
