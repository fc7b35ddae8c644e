// Script Runner Port
// Abstraction for running one script in a freshly allocated, isolated context

use crate::domain::{CapabilityMode, ExecutionId, Parameters, RuntimeVersion};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything the runner needs for one invocation
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub execution_id: ExecutionId,
    pub content: String,
    pub parameters: Parameters,
    pub mode: CapabilityMode,
    pub required_runtime_version: Option<String>,
}

/// How the underlying process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Ran to completion on its own
    Exited,
    /// Stopped by the graceful interrupt after cancellation
    Interrupted,
    /// Force-terminated after the grace window
    Killed,
}

/// Result of one run
///
/// The output streams are not repeated here: they are delivered as
/// [`RunEvent::Output`] while the script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub completion_reason: CompletionReason,
}

impl RunOutcome {
    pub fn exited(exit_code: Option<i32>) -> Self {
        Self {
            exit_code,
            completion_reason: CompletionReason::Exited,
        }
    }

    /// Ran to completion on its own with exit code 0
    pub fn exited_cleanly(&self) -> bool {
        self.completion_reason == CompletionReason::Exited && self.exit_code == Some(0)
    }
}

/// Signals a runner emits while a script runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Process allocated (pid is None for in-process runners)
    Started {
        pid: Option<u32>,
        runtime_version: Option<String>,
    },
    /// Captured chunk of stdout (`is_error == false`) or stderr
    Output { chunk: String, is_error: bool },
    /// One discrete command/statement executed
    Command,
}

/// Sending half of the run event stream
///
/// Every byte of captured stdout/stderr is sent as an [`RunEvent::Output`];
/// the engine builds the execution record from the stream.
#[derive(Debug, Clone)]
pub struct RunEvents {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl RunEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    // Send failures mean the engine stopped listening; the run itself goes on.

    pub fn started(&self, pid: Option<u32>, runtime_version: Option<String>) {
        let _ = self.tx.send(RunEvent::Started {
            pid,
            runtime_version,
        });
    }

    pub fn output(&self, chunk: impl Into<String>, is_error: bool) {
        let _ = self.tx.send(RunEvent::Output {
            chunk: chunk.into(),
            is_error,
        });
    }

    pub fn command(&self) {
        let _ = self.tx.send(RunEvent::Command);
    }
}

/// Runner errors (the run could not be carried out at all)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Capability mode not supported: {0}")]
    UnsupportedMode(String),

    #[error("Denied: {0}")]
    Denied(String),

    #[error("Process killed: {0}")]
    Killed(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Runner fault: {0}")]
    Fault(String),
}

/// Script Runner trait
///
/// Implementations:
/// - SubprocessRunner: one interpreter process per run (infra-system)
/// - MockScriptRunner: scripted behaviors for tests
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run one script to completion or until `cancel` fires
    ///
    /// On cancellation the runner interrupts gracefully, then force-terminates
    /// after its fixed grace window, and returns an outcome with
    /// `CompletionReason::Interrupted` or `CompletionReason::Killed`.
    ///
    /// # Errors
    /// - RunnerError::SpawnFailed if the isolated context cannot be created
    /// - RunnerError::UnsupportedMode if the capability mode is unavailable
    /// - RunnerError::Denied if a restricted run breaks the restricted policy
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        events: RunEvents,
    ) -> Result<RunOutcome, RunnerError>;

    /// Runtime versions this runner can provide
    fn available_runtimes(&self) -> Vec<RuntimeVersion>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Mock runner behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Emit one command per non-empty script line, print `stdout`, exit 0 after `delay`
        Succeed { stdout: String, delay: Duration },
        /// Exit with a code and error output after `delay`
        Exit {
            code: i32,
            stderr: String,
            delay: Duration,
        },
        /// Run until cancelled, then acknowledge
        Hang,
        /// Ignore cancellation and never return
        Unresponsive,
        /// Panic with message (for panic isolation testing)
        Panic(String),
        /// Fail with a runner error
        Error(RunnerError),
    }

    /// Mock Script Runner for testing
    pub struct MockScriptRunner {
        behavior: Mutex<MockBehavior>,
        call_count: AtomicUsize,
        runtimes: Vec<RuntimeVersion>,
    }

    impl MockScriptRunner {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                call_count: AtomicUsize::new(0),
                runtimes: vec![RuntimeVersion::new(7, 4, 0)],
            }
        }

        pub fn new_success(delay: Duration) -> Self {
            Self::new(MockBehavior::Succeed {
                stdout: "ok\n".to_string(),
                delay,
            })
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        fn interrupted() -> RunOutcome {
            RunOutcome {
                exit_code: None,
                completion_reason: CompletionReason::Interrupted,
            }
        }
    }

    #[async_trait]
    impl ScriptRunner for MockScriptRunner {
        async fn run(
            &self,
            request: RunRequest,
            cancel: CancellationToken,
            events: RunEvents,
        ) -> Result<RunOutcome, RunnerError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior.lock().unwrap().clone();

            if let MockBehavior::Error(err) = &behavior {
                return Err(err.clone());
            }
            events.started(None, self.runtimes.first().map(|v| v.to_string()));

            match behavior {
                MockBehavior::Succeed { stdout, delay } => {
                    for _ in request.content.lines().filter(|l| !l.trim().is_empty()) {
                        events.command();
                    }
                    tokio::select! {
                        biased;
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Ok(Self::interrupted()),
                    }
                    events.output(stdout, false);
                    Ok(RunOutcome::exited(Some(0)))
                }
                MockBehavior::Exit {
                    code,
                    stderr,
                    delay,
                } => {
                    tokio::select! {
                        biased;
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Ok(Self::interrupted()),
                    }
                    events.output(stderr, true);
                    Ok(RunOutcome::exited(Some(code)))
                }
                MockBehavior::Hang => {
                    events.output("working\n", false);
                    cancel.cancelled().await;
                    Ok(Self::interrupted())
                }
                MockBehavior::Unresponsive => std::future::pending().await,
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg); // Actually panic for panic isolation testing
                }
                MockBehavior::Error(_) => unreachable!("handled above"),
            }
        }

        fn available_runtimes(&self) -> Vec<RuntimeVersion> {
            self.runtimes.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit() {
        assert!(RunOutcome::exited(Some(0)).exited_cleanly());
        assert!(!RunOutcome::exited(Some(3)).exited_cleanly());
        assert!(!RunOutcome::exited(None).exited_cleanly());

        let interrupted = RunOutcome {
            exit_code: Some(0),
            completion_reason: CompletionReason::Interrupted,
        };
        assert!(!interrupted.exited_cleanly());
    }

    #[tokio::test]
    async fn test_run_events_stream_in_order() {
        let (events, mut rx) = RunEvents::channel();
        events.started(Some(42), Some("7.4.0".to_string()));
        events.output("hello\n", false);
        events.command();
        drop(events);

        assert_eq!(
            rx.recv().await,
            Some(RunEvent::Started {
                pid: Some(42),
                runtime_version: Some("7.4.0".to_string())
            })
        );
        assert!(matches!(rx.recv().await, Some(RunEvent::Output { is_error: false, .. })));
        assert_eq!(rx.recv().await, Some(RunEvent::Command));
        assert_eq!(rx.recv().await, None);
    }
}
