// Domain Layer - Pure entities and state machine

pub mod error;
pub mod execution;
pub mod metrics;
pub mod script;
pub mod validation;

// Re-exports
pub use error::DomainError;
pub use execution::{CapabilityMode, Execution, ExecutionId, ExecutionStatus, ScriptReference};
pub use metrics::{ExecutionMetrics, ResourceSample};
pub use script::{
    ParameterSchema, ParameterSpec, ParameterType, Parameters, RuntimeVersion, ScriptDefinition,
    ScriptRef, DEFAULT_SCRIPT_TIMEOUT,
};
pub use validation::{ExecutionValidationResult, SecurityRiskLevel};
