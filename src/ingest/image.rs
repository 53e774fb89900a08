//! Still image source.
//!
//! An image is a one-frame source. The whole image is decoded when the source
//! is opened, so a missing, unsupported, or truncated file fails before any
//! Scene exists.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use image::ImageReader;

use super::SourceStats;
use crate::frame::Frame;

/// Configuration for an image source.
#[derive(Clone, Debug, Default)]
pub struct ImageConfig {
    /// Local image path (JPEG or PNG).
    pub path: String,
}

pub struct ImageSource {
    config: ImageConfig,
    frame: Option<Frame>,
    width: u32,
    height: u32,
    frames_captured: u64,
}

impl ImageSource {
    pub fn new(config: ImageConfig) -> Result<Self> {
        let bytes = std::fs::read(&config.path)
            .with_context(|| format!("read image file {}", config.path))?;
        let reader = ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .context("sniff image format")?;
        let format = reader
            .format()
            .ok_or_else(|| anyhow!("{} is not a recognised image", config.path))?;
        let rgb = reader
            .decode()
            .with_context(|| format!("decode {:?} image {}", format, config.path))?
            .into_rgb8();
        let (width, height) = rgb.dimensions();
        let frame = Frame::from_rgb_unchecked(rgb.into_raw(), width, height, 0);

        log::info!(
            "ImageSource: opened {} ({:?}, {}x{})",
            config.path,
            format,
            width,
            height
        );
        Ok(Self {
            config,
            frame: Some(frame),
            width,
            height,
            frames_captured: 0,
        })
    }

    /// The decoded image on the first call, `Ok(None)` afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.frame.take();
        if frame.is_some() {
            self.frames_captured += 1;
        }
        Ok(frame)
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            location: self.config.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &tempfile::TempDir, name: &str, width: u32, height: u32) -> Result<String> {
        let path = dir.path().join(name);
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
        img.save(&path)?;
        Ok(path.to_string_lossy().into_owned())
    }

    #[test]
    fn png_yields_exactly_one_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_png(&dir, "still.png", 6, 4)?;
        let mut source = ImageSource::new(ImageConfig { path })?;
        assert_eq!(source.resolution(), "6x4");

        let frame = source.next_frame()?.context("first frame")?;
        assert_eq!((frame.width, frame.height), (6, 4));
        assert_eq!(&frame.pixels()[..3], &[10, 20, 30]);
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn missing_and_garbage_files_fail_at_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(ImageSource::new(ImageConfig {
            path: dir.path().join("absent.png").to_string_lossy().into_owned(),
        })
        .is_err());

        let garbage = dir.path().join("noise.jpg");
        std::fs::write(&garbage, b"definitely not an image")?;
        assert!(ImageSource::new(ImageConfig {
            path: garbage.to_string_lossy().into_owned(),
        })
        .is_err());
        Ok(())
    }

    #[test]
    fn truncated_body_fails_at_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let noisy = image::RgbImage::from_fn(64, 64, |x, y| {
            image::Rgb([(x * 37 + y * 11) as u8, (x * y) as u8, (x ^ y) as u8])
        });
        let full = dir.path().join("full.png");
        noisy.save(&full)?;
        let bytes = std::fs::read(&full)?;
        let truncated = dir.path().join("truncated.png");
        // The header survives, the compressed pixel data is cut in half.
        std::fs::write(&truncated, &bytes[..bytes.len() / 2])?;

        let err = match ImageSource::new(ImageConfig {
            path: truncated.to_string_lossy().into_owned(),
        }) {
            Err(err) => err,
            Ok(_) => panic!("truncated image should not open"),
        };
        assert!(format!("{:#}", err).contains("decode"));
        Ok(())
    }
}
