//! Error taxonomy for ingestion.
//!
//! Callers need to tell three situations apart:
//! - the request itself was malformed (`ErrorKind::Validation`), nothing was touched;
//! - the request was well formed but a collaborator failed (source, detector, storage);
//! - a failure happened after the Scene row was created, so earlier results are durable
//!   (`PipelineError::is_partial`).

use std::fmt;

use thiserror::Error;

use crate::pipeline::PipelineState;
use crate::scene::{DetectionId, SceneId};

/// A request parameter or record field outside its domain.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failures raised by the scene store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("scene {0} does not exist")]
    MissingScene(SceneId),
    #[error("detection {0} does not exist")]
    MissingDetection(DetectionId),
    #[error("invalid record: {0}")]
    Invalid(#[from] ValidationError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Classified ingestion failure.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("detector failed: {0}")]
    Detector(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("ingest pool unavailable: {0}")]
    Shutdown(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    SourceUnavailable,
    Decode,
    Detector,
    Storage,
    Shutdown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::Decode => "decode",
            ErrorKind::Detector => "detector",
            ErrorKind::Storage => "storage",
            ErrorKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Validation(_) => ErrorKind::Validation,
            IngestError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            IngestError::Decode(_) => ErrorKind::Decode,
            IngestError::Detector(_) => ErrorKind::Detector,
            IngestError::Storage(_) => ErrorKind::Storage,
            IngestError::Shutdown(_) => ErrorKind::Shutdown,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        IngestError::Validation(ValidationError::new(message))
    }

    /// Render an `anyhow` chain on one line, outermost context first.
    pub(crate) fn source_unavailable(err: &anyhow::Error) -> Self {
        IngestError::SourceUnavailable(format!("{:#}", err))
    }

    pub(crate) fn decode(err: &anyhow::Error) -> Self {
        IngestError::Decode(format!("{:#}", err))
    }
}

/// A failed ingestion request, with the phase it failed in.
#[derive(Debug, Error)]
#[error("ingestion failed during {phase}: {source}")]
pub struct PipelineError {
    pub phase: PipelineState,
    /// Set when the Scene row was created before the failure.
    pub scene_id: Option<SceneId>,
    /// Detections committed before the failure.
    pub persisted_detections: u64,
    #[source]
    pub source: IngestError,
}

impl PipelineError {
    pub(crate) fn before_scene(phase: PipelineState, source: IngestError) -> Self {
        Self {
            phase,
            scene_id: None,
            persisted_detections: 0,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// The Scene survived the failure along with whatever was committed before it.
    pub fn is_partial(&self) -> bool {
        self.scene_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(
            IngestError::validation("bad duration").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            IngestError::Storage(StoreError::MissingScene(4)).kind(),
            ErrorKind::Storage
        );
        assert_eq!(ErrorKind::SourceUnavailable.to_string(), "source_unavailable");
    }

    #[test]
    fn anyhow_context_is_kept_in_message() {
        let err = anyhow::anyhow!("connection refused").context("connect to rtsp://cam");
        let IngestError::SourceUnavailable(message) = IngestError::source_unavailable(&err)
        else {
            panic!("wrong variant");
        };
        assert_eq!(message, "connect to rtsp://cam: connection refused");
    }

    #[test]
    fn partial_failures_carry_scene() {
        let err = PipelineError {
            phase: PipelineState::Streaming,
            scene_id: Some(7),
            persisted_detections: 3,
            source: IngestError::Storage(StoreError::Corrupt("disk".into())),
        };
        assert!(err.is_partial());
        assert!(!err.is_validation());
        assert_eq!(
            err.to_string(),
            "ingestion failed during STREAMING: storage failure: corrupt row: disk"
        );

        let early = PipelineError::before_scene(
            PipelineState::Init,
            IngestError::validation("duration must be a positive integer"),
        );
        assert!(!early.is_partial());
        assert!(early.is_validation());
    }
}
