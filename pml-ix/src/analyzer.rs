//! Analyzer capability interfaces
//!
//! Analysis is an external pluggable capability set: tagging, text
//! recognition, face detection, and geocoding are independent interfaces an
//! analyzer may implement any subset of. The scheduler treats a missing
//! capability as a no-op, not an error, and every capability can fail
//! independently without affecting the others.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Per-capability analysis failure
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    /// Timeout or resource exhaustion; retried with backoff up to a ceiling
    #[error("transient analysis failure: {0}")]
    Transient(String),

    /// Structurally unreadable content; marks the item FAILED, never retried
    #[error("permanent analysis failure: {0}")]
    Permanent(String),
}

/// Derives descriptive tags from item content
#[async_trait]
pub trait TagCapability: Send + Sync {
    async fn tags(&self, content: &[u8]) -> Result<Vec<String>, AnalysisError>;
}

/// Recognizes text in item content (OCR)
#[async_trait]
pub trait TextCapability: Send + Sync {
    async fn recognize_text(&self, content: &[u8]) -> Result<String, AnalysisError>;
}

/// Detects faces and reports opaque per-person signatures.
///
/// Signatures are resolved to face clusters by the registry; two items
/// reporting the same signature land in the same cluster. The similarity
/// heuristic behind the signatures is the analyzer's concern.
#[async_trait]
pub trait FaceCapability: Send + Sync {
    async fn face_signatures(&self, content: &[u8]) -> Result<Vec<String>, AnalysisError>;
}

/// Geocodes item content to a human-readable location string
#[async_trait]
pub trait GeoCapability: Send + Sync {
    async fn locate(&self, content: &[u8]) -> Result<Option<String>, AnalysisError>;
}

/// The set of capabilities configured for the pipeline.
///
/// Each slot is optional; absent capabilities are skipped entirely.
#[derive(Clone, Default)]
pub struct AnalyzerSet {
    pub tags: Option<Arc<dyn TagCapability>>,
    pub text: Option<Arc<dyn TextCapability>>,
    pub faces: Option<Arc<dyn FaceCapability>>,
    pub geo: Option<Arc<dyn GeoCapability>>,
}

impl AnalyzerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(mut self, capability: Arc<dyn TagCapability>) -> Self {
        self.tags = Some(capability);
        self
    }

    pub fn with_text(mut self, capability: Arc<dyn TextCapability>) -> Self {
        self.text = Some(capability);
        self
    }

    pub fn with_faces(mut self, capability: Arc<dyn FaceCapability>) -> Self {
        self.faces = Some(capability);
        self
    }

    pub fn with_geo(mut self, capability: Arc<dyn GeoCapability>) -> Self {
        self.geo = Some(capability);
        self
    }

    /// Number of configured capabilities
    pub fn capability_count(&self) -> usize {
        [
            self.tags.is_some(),
            self.text.is_some(),
            self.faces.is_some(),
            self.geo.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.capability_count() == 0
    }
}
