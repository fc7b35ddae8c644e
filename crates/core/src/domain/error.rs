// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid execution state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid runtime version: {0}")]
    InvalidRuntimeVersion(String),

    #[error("Invalid parameter schema: {0}")]
    InvalidSchema(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
