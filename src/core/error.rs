//! Error types surfaced by pipeline operations.

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a pipeline operation was rejected. Every variant leaves the persisted
/// episode state untouched for the failing unit of work.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Episode, line, scene, clip or character id is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A gate predicate or an ordering/immutability rule was violated.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// An external service, process, or the document store failed.
    #[error("Collaborator failure: {0:#}")]
    Collaborator(#[from] anyhow::Error),

    /// The clip list could not be rendered into a media file.
    #[error("Assembly failed: {0}")]
    Assembly(String),
}

impl PipelineError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn assembly(message: impl Into<String>) -> Self {
        Self::Assembly(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Collaborator(err.into())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Collaborator(err.into())
    }
}
