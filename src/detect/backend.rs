use anyhow::Result;

use crate::frame::Frame;
use crate::scene::Detection;

/// Detector backend trait.
///
/// The pipeline calls `detect` once per decoded frame and persists whatever it
/// returns as one batch. Implementations:
/// - must treat the frame as read-only and drop any reference to it on return
/// - return boxes in pixel coordinates of the frame they were given
/// - return an empty list when nothing was found (not an error)
///
/// An `Err` ends the capture session; detections already persisted are kept.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
