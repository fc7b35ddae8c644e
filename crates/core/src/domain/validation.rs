// Validation Result Domain Model

use serde::{Deserialize, Serialize};

/// Security risk classification from static inspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityRiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for SecurityRiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityRiskLevel::Low => write!(f, "LOW"),
            SecurityRiskLevel::Medium => write!(f, "MEDIUM"),
            SecurityRiskLevel::High => write!(f, "HIGH"),
        }
    }
}

/// Outcome of validating a script and its parameters
///
/// Produced fresh per validation call, never stored as mutable state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionValidationResult {
    pub is_valid: bool,
    /// Blocking problems, in check order
    pub errors: Vec<String>,
    /// Non-blocking observations, in check order
    pub warnings: Vec<String>,
    pub requires_elevation: bool,
    /// Best-effort estimate, filled from run history when available
    pub estimated_duration_secs: Option<f64>,
    pub security_risk_level: SecurityRiskLevel,
    pub missing_dependencies: Vec<String>,
}

impl ExecutionValidationResult {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Raise the risk level (never lowers it)
    pub fn raise_risk(&mut self, level: SecurityRiskLevel) {
        self.security_risk_level = self.security_risk_level.max(level);
    }

    /// Seal the result: valid iff no blocking errors were recorded
    pub fn finish(mut self) -> Self {
        self.is_valid = self.errors.is_empty();
        self
    }
}
