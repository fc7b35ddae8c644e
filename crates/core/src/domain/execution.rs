// Execution Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::script::Parameters;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Execution ID (UUID v4)
pub type ExecutionId = String;

/// Execution lifecycle status
///
/// `Pending → Running → {Succeeded | Failed | Cancelled | TimedOut}`, plus the
/// direct `Pending → Cancelled` edge for cancellation before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    /// All terminal statuses
    pub const TERMINAL: [ExecutionStatus; 4] = [
        ExecutionStatus::Succeeded,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
        ExecutionStatus::TimedOut,
    ];

    /// Terminal statuses never transition again
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "PENDING"),
            ExecutionStatus::Running => write!(f, "RUNNING"),
            ExecutionStatus::Succeeded => write!(f, "SUCCEEDED"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
            ExecutionStatus::Cancelled => write!(f, "CANCELLED"),
            ExecutionStatus::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Capability mode requested for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityMode {
    /// Full language, native calls allowed
    #[default]
    Full,
    /// Constrained language: no arbitrary native calls, no filesystem/network helpers
    Restricted,
}

impl std::fmt::Display for CapabilityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityMode::Full => write!(f, "FULL"),
            CapabilityMode::Restricted => write!(f, "RESTRICTED"),
        }
    }
}

/// Which script an execution ran: a stored script id, or the hash of inline content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScriptReference {
    Id(String),
    ContentHash(String),
}

impl ScriptReference {
    /// Reference inline content by its SHA-256 digest (lowercase hex)
    pub fn for_content(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        ScriptReference::ContentHash(format!("{:x}", digest))
    }
}

impl std::fmt::Display for ScriptReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptReference::Id(id) => write!(f, "id:{}", id),
            ScriptReference::ContentHash(hash) => write!(f, "sha256:{}", hash),
        }
    }
}

/// One tracked run of a script from submission to terminal status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub script: ScriptReference,
    pub status: ExecutionStatus,

    pub created_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,

    pub exit_code: Option<i32>,
    pub output: String,
    pub error_output: String,
    pub output_bytes: u64,
    pub error_output_bytes: u64,

    pub parameters: Parameters,
    pub triggered_by: String, // audit only
    pub mode: CapabilityMode,
}

impl Execution {
    /// Create a new Pending execution
    ///
    /// # Arguments
    ///
    /// * `id` - Unique execution ID (injected, not generated)
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    /// * `script` - Script reference
    /// * `parameters` - Caller parameters (opaque to the engine)
    /// * `triggered_by` - Caller identity for audit
    /// * `mode` - Requested capability mode
    pub fn new(
        id: impl Into<String>,
        created_at: i64,
        script: ScriptReference,
        parameters: Parameters,
        triggered_by: impl Into<String>,
        mode: CapabilityMode,
    ) -> Self {
        Self {
            id: id.into(),
            script,
            status: ExecutionStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            exit_code: None,
            output: String::new(),
            error_output: String::new(),
            output_bytes: 0,
            error_output_bytes: 0,
            parameters,
            triggered_by: triggered_by.into(),
            mode,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock run time, available once the execution started and completed
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Apply a state-machine transition with an explicit timestamp
    ///
    /// Stamps `started_at` on entering Running and `completed_at` on entering
    /// any terminal status.
    pub fn transition(&mut self, to: ExecutionStatus, now_millis: i64) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        if to == ExecutionStatus::Running {
            self.started_at = Some(now_millis);
        }
        if to.is_terminal() {
            self.completed_at = Some(now_millis);
        }
        Ok(())
    }

    /// Append captured text to the output or error-output stream
    pub fn append_output(&mut self, chunk: &str, is_error: bool) {
        if is_error {
            self.error_output.push_str(chunk);
            self.error_output_bytes += chunk.len() as u64;
        } else {
            self.output.push_str(chunk);
            self.output_bytes += chunk.len() as u64;
        }
    }
}
