//! Decoded frames.
//!
//! - `Frame`: one decoded RGB24 image handed from a capture source to the detector.
//!
//! Frames are transient. The pipeline drops each frame once the detector returns; nothing
//! in the crate persists pixel data.

use std::time::Instant;

use anyhow::Result;

use crate::ingest::normalize::{normalize_to_rgb, PixelFormat};

/// One decoded frame in RGB24 layout (`width * height * 3` bytes, row-major).
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Zero-based position of this frame within its source.
    pub index: u64,

    /// Monotonic capture instant.
    captured_at: Instant,
}

// No Clone: frames move from source to detector and are dropped there.

impl Frame {
    /// Build a frame from pixels in `format`, converting to RGB24.
    ///
    /// Fails when the buffer length does not match the dimensions.
    pub(crate) fn from_pixels(
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        index: u64,
    ) -> Result<Self> {
        let data = normalize_to_rgb(pixels, width, height, format)?;
        Ok(Self::from_rgb_unchecked(data, width, height, index))
    }

    /// Take ownership of an RGB24 buffer that already matches `width * height * 3`.
    pub(crate) fn from_rgb_unchecked(data: Vec<u8>, width: u32, height: u32, index: u64) -> Self {
        Self {
            data,
            width,
            height,
            index,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from an RGB24 buffer. Intended for detector tests and adapters.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = expected_rgb_len(width, height)?;
        if data.len() != expected {
            anyhow::bail!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            );
        }
        Ok(Self::from_rgb_unchecked(data, width, height, index))
    }

    /// Read-only pixel access for detectors.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Time since the source produced this frame.
    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }

    /// `WxH`, the format used in scene records.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel content is never printed.
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("index", &self.index)
            .field("bytes", &self.byte_len())
            .finish()
    }
}

pub(crate) fn expected_rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow::anyhow!("frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_checks_length() {
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2, 0).is_ok());
        assert!(Frame::from_rgb(vec![0u8; 11], 2, 2, 0).is_err());
    }

    #[test]
    fn frame_reports_resolution_and_index() -> Result<()> {
        let frame = Frame::from_rgb(vec![7u8; 4 * 3 * 3], 4, 3, 5)?;
        assert_eq!(frame.resolution(), "4x3");
        assert_eq!(frame.index, 5);
        assert_eq!(frame.pixels().len(), 36);
        Ok(())
    }

    #[test]
    fn debug_omits_pixels() -> Result<()> {
        let frame = Frame::from_rgb(vec![1u8; 3], 1, 1, 0)?;
        let text = format!("{:?}", frame);
        assert!(text.contains("bytes: 3"));
        assert!(!text.contains("data"));
        Ok(())
    }
}
