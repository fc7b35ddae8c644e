// Script Engine Core - Domain Logic, Ports & Orchestration
// NO infrastructure dependencies (hexagonal layout)

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use application::{
    EngineConfig, ExecutionEngine, ExecutionEngineBuilder, RetentionSweeper, SubmitRequest,
    ValidationConfig,
};
pub use error::{EngineError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
