//! `stub://` sources shared by every capture kind.
//!
//! Synthetic sources take their parameters from the query string, e.g.
//! `stub://front_camera?fps=30&corrupt_every=10` or `stub://clip.mp4?frames=90`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::frame::Frame;
use crate::ingest::normalize::PixelFormat;

pub(crate) const STUB_SCHEME: &str = "stub://";

pub(crate) fn is_stub(location: &str) -> bool {
    location.starts_with(STUB_SCHEME)
}

/// Parsed `stub://name?key=value` location.
#[derive(Clone, Debug)]
pub(crate) struct StubParams {
    pub(crate) name: String,
    params: HashMap<String, String>,
}

impl StubParams {
    pub(crate) fn parse(location: &str) -> Result<Self> {
        let url = Url::parse(location).with_context(|| format!("parse stub location '{}'", location))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("'{}' is not a stub:// location", location));
        }
        let name = url.host_str().unwrap_or("stub").to_string();
        let params = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Ok(Self { name, params })
    }

    pub(crate) fn u32_or(&self, key: &str, default: u32) -> Result<u32> {
        match self.params.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow!("stub parameter {}='{}' is not an integer", key, raw)),
            None => Ok(default),
        }
    }

    pub(crate) fn u64_opt(&self, key: &str) -> Result<Option<u64>> {
        match self.params.get(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("stub parameter {}='{}' is not an integer", key, raw)),
            None => Ok(None),
        }
    }
}

/// Deterministic pixel generator with optional injected decode failures.
pub(crate) struct SyntheticScene {
    width: u32,
    height: u32,
    frame_count: u64,
    /// Simulated scene state; changes every 50 frames.
    scene_state: u8,
    /// Every n-th frame fails to decode.
    corrupt_every: Option<u64>,
}

impl SyntheticScene {
    pub(crate) fn new(width: u32, height: u32, corrupt_every: Option<u64>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("synthetic frame size must be non-zero"));
        }
        if corrupt_every == Some(0) {
            return Err(anyhow!("corrupt_every must be greater than zero"));
        }
        Ok(Self {
            width,
            height,
            frame_count: 0,
            scene_state: 0,
            corrupt_every,
        })
    }

    pub(crate) fn from_params(params: &StubParams, width: u32, height: u32) -> Result<Self> {
        Self::new(
            params.u32_or("width", width)?,
            params.u32_or("height", height)?,
            params.u64_opt("corrupt_every")?,
        )
    }

    pub(crate) fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    pub(crate) fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub(crate) fn next_frame(&mut self) -> Result<Frame> {
        let index = self.frame_count;
        self.frame_count += 1;

        if let Some(every) = self.corrupt_every {
            if self.frame_count % every == 0 {
                return Err(anyhow!("synthetic frame {} is corrupt", index));
            }
        }

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }

        Frame::from_pixels(&pixels, self.width, self.height, PixelFormat::Rgb24, index)
    }
}

/// Sleeps so a live synthetic source delivers at most `fps` frames per second.
pub(crate) struct Pacer {
    interval: Duration,
    next_at: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(fps: u32) -> Self {
        let interval = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / fps).max(1) as u64)
        };
        Self {
            interval,
            next_at: None,
        }
    }

    pub(crate) fn wait(&mut self) {
        let now = Instant::now();
        if let Some(next_at) = self.next_at {
            if next_at > now {
                std::thread::sleep(next_at - now);
            }
        }
        self.next_at = Some(Instant::now() + self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_params_parse_name_and_query() -> Result<()> {
        let params = StubParams::parse("stub://clip.mp4?frames=12&corrupt_every=3")?;
        assert_eq!(params.name, "clip.mp4");
        assert_eq!(params.u32_or("frames", 30)?, 12);
        assert_eq!(params.u32_or("width", 640)?, 640);
        assert_eq!(params.u64_opt("corrupt_every")?, Some(3));
        assert_eq!(params.u64_opt("fail_after")?, None);
        assert!(StubParams::parse("rtsp://cam/stream").is_err());
        Ok(())
    }

    #[test]
    fn stub_params_reject_non_numeric_values() -> Result<()> {
        let params = StubParams::parse("stub://cam?fps=fast")?;
        assert!(params.u32_or("fps", 10).is_err());
        Ok(())
    }

    #[test]
    fn synthetic_scene_injects_corrupt_frames() -> Result<()> {
        let mut scene = SyntheticScene::new(8, 6, Some(3))?;
        assert!(scene.next_frame().is_ok());
        assert!(scene.next_frame().is_ok());
        assert!(scene.next_frame().is_err());
        let frame = scene.next_frame()?;
        assert_eq!(frame.index, 3);
        assert_eq!(frame.pixels().len(), 8 * 6 * 3);
        assert_eq!(scene.frames_generated(), 4);
        Ok(())
    }

    #[test]
    fn pacer_spaces_frames() {
        let mut pacer = Pacer::new(50);
        let start = Instant::now();
        pacer.wait();
        pacer.wait();
        pacer.wait();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
