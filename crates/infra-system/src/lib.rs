// Script Engine Infrastructure - System Adapters
// Implements: ScriptRunner, ProcessProbe, ScriptSource

pub mod directory_script_source;
pub mod process_probe_impl;
pub mod subprocess_runner;

pub use directory_script_source::DirectoryScriptSource;
pub use process_probe_impl::SysinfoProcessProbe;
pub use subprocess_runner::{
    InterpreterProfile, RestrictedInvocation, SubprocessRunner, GRACE_WINDOW,
};
