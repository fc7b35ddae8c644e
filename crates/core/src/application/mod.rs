// Application Layer - Use Cases and Orchestration

pub mod config;
pub mod constants;
pub mod engine;
pub mod history;
pub mod metrics_collector;
pub mod panic_guard;
pub mod registry;
pub mod retention;
pub mod validator;

// Re-exports
pub use config::EngineConfig;
pub use engine::{ExecutionEngine, ExecutionEngineBuilder, SubmitRequest};
pub use metrics_collector::MetricsCollector;
pub use registry::{ExecutionHandle, ExecutionRegistry, Settlement, Transition};
pub use retention::RetentionSweeper;
pub use validator::{ScriptValidator, ValidationConfig};
