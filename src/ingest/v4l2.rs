//! Live camera source.
//!
//! `CameraSource` captures frames from a local V4L2 device node (e.g.
//! `/dev/video0`) or, for `stub://` devices, from a paced synthetic generator.
//!
//! The camera source is responsible for:
//! - Opening the device exclusively for the lifetime of the source
//! - Negotiating a pixel format and normalising frames to RGB24
//! - Releasing the device when closed or dropped
//!
//! A live camera never ends on its own; the caller bounds capture time.

use anyhow::{anyhow, Result};
#[cfg(feature = "ingest-v4l2")]
use anyhow::Context;
#[cfg(feature = "ingest-v4l2")]
use ouroboros::self_referencing;
#[cfg(feature = "ingest-v4l2")]
use std::time::{Duration, Instant};

#[cfg(feature = "ingest-v4l2")]
use super::normalize::PixelFormat;
use super::synthetic::{is_stub, Pacer, StubParams, SyntheticScene};
use super::SourceStats;
use crate::frame::Frame;

/// Configuration for a camera source.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g., "/dev/video0").
    pub device: String,
    /// Requested frame rate. Devices may deliver less.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// Camera frame source.
///
/// Uses libv4l for real devices, with a synthetic fallback for `stub://` paths.
pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCameraSource),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceCameraSource),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        if is_stub(&config.device) {
            return Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticCameraSource::new(config)?),
            });
        }
        #[cfg(feature = "ingest-v4l2")]
        {
            Ok(Self {
                backend: CameraBackend::Device(DeviceCameraSource::new(config)),
            })
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            Err(anyhow!(
                "camera capture from {} requires the ingest-v4l2 feature",
                config.device
            ))
        }
    }

    /// Open the device and start streaming.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.connect(),
        }
    }

    /// Capture the next frame. Blocks until the device delivers one.
    pub fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.next_frame(),
        }
    }

    /// Negotiated `WxH`, known once connected.
    pub fn resolution(&self) -> Option<String> {
        match &self.backend {
            CameraBackend::Synthetic(source) => Some(source.scene.resolution()),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.resolution(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(_) => true,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.stats(),
        }
    }

    /// Stop streaming and release the device.
    pub fn close(&mut self) {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.connected = false,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.close(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticCameraSource {
    config: CameraConfig,
    scene: SyntheticScene,
    pacer: Pacer,
    connected: bool,
}

impl SyntheticCameraSource {
    fn new(config: CameraConfig) -> Result<Self> {
        let params = StubParams::parse(&config.device)?;
        let fps = params.u32_or("fps", config.target_fps)?;
        let scene = SyntheticScene::from_params(&params, config.width, config.height)?;
        log::debug!("synthetic camera '{}' at {} fps", params.name, fps);
        Ok(Self {
            config,
            scene,
            pacer: Pacer::new(fps),
            connected: false,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("CameraSource: connected to {} (synthetic)", self.config.device);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("camera {} is not connected", self.config.device));
        }
        self.pacer.wait();
        self.scene.next_frame()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.scene.frames_generated(),
            location: self.config.device.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production camera source using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
struct DeviceCameraSource {
    config: CameraConfig,
    state: Option<DeviceCameraState>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
    pixel_format: PixelFormat,
}

#[cfg(feature = "ingest-v4l2")]
#[self_referencing]
struct DeviceCameraState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "ingest-v4l2")]
impl DeviceCameraSource {
    fn new(config: CameraConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
            pixel_format: PixelFormat::Rgb24,
        }
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "CameraSource: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.pixel_format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"YUYV" => PixelFormat::Yuyv,
            other => {
                return Err(anyhow!(
                    "v4l2 device {} only offers unsupported pixel format {}",
                    self.config.device,
                    String::from_utf8_lossy(other)
                ))
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "CameraSource: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let state = DeviceCameraStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "CameraSource: connected to {} ({}x{}, {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.pixel_format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let (buf, _meta) = state
            .with_mut(|fields| fields.stream.next())
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                anyhow::Error::new(err).context("capture v4l2 frame")
            })?;

        let index = self.frame_count;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Frame::from_pixels(
            buf,
            self.active_width,
            self.active_height,
            self.pixel_format,
            index,
        )
    }

    fn resolution(&self) -> Option<String> {
        self.state
            .as_ref()
            .map(|_| format!("{}x{}", self.active_width, self.active_height))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            location: self.config.device.clone(),
        }
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::debug!("CameraSource: released {}", self.config.device);
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(device: &str) -> CameraConfig {
        CameraConfig {
            device: device.to_string(),
            target_fps: 100,
            width: 32,
            height: 24,
        }
    }

    #[test]
    fn camera_source_produces_frames() -> Result<()> {
        let mut source = CameraSource::new(stub_config("stub://webcam"))?;
        source.connect()?;

        let frame = source.next_frame()?;
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 24);
        assert_eq!(source.resolution().as_deref(), Some("32x24"));
        assert_eq!(source.stats().frames_captured, 1);

        Ok(())
    }

    #[test]
    fn camera_requires_connect_and_stops_after_close() -> Result<()> {
        let mut source = CameraSource::new(stub_config("stub://webcam"))?;
        assert!(source.next_frame().is_err());
        source.connect()?;
        assert!(source.next_frame().is_ok());
        source.close();
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn stub_parameters_override_config() -> Result<()> {
        let mut source = CameraSource::new(stub_config("stub://webcam?width=8&height=4"))?;
        source.connect()?;
        let frame = source.next_frame()?;
        assert_eq!(frame.resolution(), "8x4");
        Ok(())
    }
}
