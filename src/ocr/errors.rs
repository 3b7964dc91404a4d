//! Error kinds raised by the extraction pipeline.
//!
//! Each pipeline stage has its own error type, so the orchestrator can decide
//! how far a failure is allowed to spread. The underlying cause is kept as an
//! [`anyhow::Error`], which prints its full context chain with `{:#}`.

use thiserror::Error;

/// A PDF could not be turned into page images. Fatal for that document, and
/// never retried.
#[derive(Debug, Error)]
#[error("could not rasterize PDF: {cause:#}")]
pub struct RasterizationError {
    /// What went wrong.
    pub cause: anyhow::Error,
}

impl RasterizationError {
    /// Wrap an underlying error.
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

/// The structured query engine failed for a page. Recoverable: the page is
/// handed to the fallback OCR engine instead.
#[derive(Debug, Error)]
#[error("query engine failed: {cause:#}")]
pub struct PrimaryEngineError {
    /// What went wrong.
    pub cause: anyhow::Error,
}

impl PrimaryEngineError {
    /// Wrap an underlying error.
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

/// The fallback OCR engine failed for a page. The page contributes no form
/// data.
#[derive(Debug, Error)]
#[error("fallback OCR failed: {cause:#}")]
pub struct FallbackEngineError {
    /// What went wrong.
    pub cause: anyhow::Error,
}

impl FallbackEngineError {
    /// Wrap an underlying error.
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}
