use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::frame::Frame;
use crate::scene::Detection;

/// Stub backend for testing and the default configuration.
///
/// Returns a fixed batch per frame, a scripted sequence of batches, or nothing.
#[derive(Default)]
pub struct StubBackend {
    script: VecDeque<Vec<Detection>>,
    repeat: Vec<Detection>,
    fail_after: Option<u64>,
    calls: u64,
}

impl StubBackend {
    /// Finds nothing in any frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `detections` for every frame.
    pub fn returning(detections: Vec<Detection>) -> Self {
        Self {
            repeat: detections,
            ..Self::default()
        }
    }

    /// Returns `batches` in order, one per frame, then nothing.
    pub fn scripted(batches: Vec<Vec<Detection>>) -> Self {
        Self {
            script: batches.into(),
            ..Self::default()
        }
    }

    /// Fails every call after the first `calls` frames.
    pub fn failing_after(mut self, calls: u64) -> Self {
        self.fail_after = Some(calls);
        self
    }

    /// Frames seen so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if let Some(limit) = self.fail_after {
            if self.calls >= limit {
                return Err(anyhow!("stub detector failed on frame {}", frame.index));
            }
        }
        self.calls += 1;
        if let Some(batch) = self.script.pop_front() {
            return Ok(batch);
        }
        Ok(self.repeat.clone())
    }
}
