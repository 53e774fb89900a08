//! Detection adapter.
//!
//! The object detector is an injected collaborator: the pipeline only sees
//! `DetectorBackend`. Backends are built from `DetectorSettings` by
//! `backend_from_settings`, or handed in directly by callers and tests.

mod backend;
mod backends;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{DetectorKind, DetectorSettings};

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;

/// Builds one detector per store handle owner (worker thread or request).
pub type DetectorFactory = Arc<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

pub fn backend_from_settings(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend {
        DetectorKind::Stub => Ok(Box::new(StubBackend::new())),
        #[cfg(feature = "backend-tract")]
        DetectorKind::Tract => Ok(Box::new(TractBackend::from_settings(settings)?)),
        #[cfg(not(feature = "backend-tract"))]
        DetectorKind::Tract => Err(anyhow::anyhow!(
            "the tract detector requires the backend-tract feature"
        )),
    }
}

/// Factory that builds a backend from `settings` on every call.
pub fn factory_from_settings(settings: DetectorSettings) -> DetectorFactory {
    Arc::new(move || backend_from_settings(&settings))
}
