// Port Layer - Interfaces for external collaborators

pub mod id_provider; // For deterministic testing
pub mod notifier;
pub mod process_probe;
pub mod script_runner;
pub mod script_source;
pub mod time_provider;

// Re-exports
pub use id_provider::IdProvider;
pub use notifier::{ChannelNotifier, LifecycleEvent, NoopNotifier, Notifier, NotifyError};
pub use process_probe::ProcessProbe;
pub use script_runner::{
    CompletionReason, RunEvent, RunEvents, RunOutcome, RunRequest, RunnerError, ScriptRunner,
};
pub use script_source::{InMemoryScriptSource, ScriptSource, ScriptSourceError};
pub use time_provider::TimeProvider;
