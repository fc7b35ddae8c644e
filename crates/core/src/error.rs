// Central Error Type for the Engine

use crate::domain::{ExecutionId, ExecutionStatus, ExecutionValidationResult};
use thiserror::Error;

/// Engine-level error type
///
/// Only errors detectable synchronously surface here. Failures inside an
/// asynchronous run are recorded on the execution instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {}", .0.errors.join("; "))]
    ValidationFailed(Box<ExecutionValidationResult>),

    #[error("Invalid script reference: {0}")]
    InvalidScriptReference(String),

    #[error("Execution not found: {0}")]
    NotFound(ExecutionId),

    #[error("Engine saturated: {queued} executions queued (limit {limit})")]
    EngineSaturated { queued: usize, limit: usize },

    #[error("Runner fault: {0}")]
    RunnerFault(String),

    #[error("Invalid state for execution {id}: {status}")]
    InvalidState {
        id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Script source error: {0}")]
    ScriptSource(#[from] crate::port::ScriptSourceError),
}

impl EngineError {
    /// Validation result carried by a `ValidationFailed` error
    pub fn validation_result(&self) -> Option<&ExecutionValidationResult> {
        match self {
            EngineError::ValidationFailed(result) => Some(result),
            _ => None,
        }
    }
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
