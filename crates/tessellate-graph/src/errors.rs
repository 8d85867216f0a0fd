use crate::Diagnostic;
use crate::storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("document has no pipeline (Workflow) node")]
    MissingPipelineNode,
    #[error("document has more than one pipeline node: {}", .ids.join(", "))]
    AmbiguousPipelineNode { ids: Vec<String> },
    #[error("graph integrity violated at '{offending_id}': {reason}")]
    GraphIntegrity { reason: String, offending_id: String },
    #[error("node id '{id}' already exists")]
    DuplicateId { id: String },
    #[error("cannot widen port '{port}' from {from} to {to}")]
    UnsupportedPortWidening {
        port: String,
        from: String,
        to: String,
    },
    #[error("node '{id}' not found")]
    NodeNotFound { id: String },
    #[error("document format error: {0}")]
    DocumentFormat(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl GraphError {
    pub(crate) fn integrity(offending_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GraphIntegrity {
            reason: reason.into(),
            offending_id: offending_id.into(),
        }
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }

    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| d.is_error())
    }
}
