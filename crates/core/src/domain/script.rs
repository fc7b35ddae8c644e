// Script Definition Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default script timeout (300 seconds)
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Caller parameters (key-value map, opaque to the engine)
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// Declared type of a script parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParameterType {
    /// Whether a JSON value is acceptable for this declared type
    pub fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
            ParameterType::Any => true,
        }
    }

    /// Name of the JSON type of a value, for error messages
    pub fn describe(value: &serde_json::Value) -> &'static str {
        match value {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
        }
    }
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
            ParameterType::Any => "any",
        };
        write!(f, "{}", name)
    }
}

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Declared parameter schema of a script
///
/// Parameter names bind case-insensitively, as PowerShell does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,

    /// When false, parameters not declared here are rejected
    #[serde(default = "default_true")]
    pub additional_parameters: bool,
}

impl ParameterSchema {
    pub fn new(parameters: Vec<ParameterSpec>) -> Result<Self> {
        for (i, spec) in parameters.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(DomainError::InvalidSchema(format!(
                    "parameter #{} has an empty name",
                    i
                )));
            }
            let duplicate = parameters[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&spec.name));
            if duplicate {
                return Err(DomainError::InvalidSchema(format!(
                    "parameter '{}' is declared twice",
                    spec.name
                )));
            }
        }
        Ok(Self {
            parameters,
            additional_parameters: true,
        })
    }

    /// Reject parameters that are not declared
    pub fn strict(mut self) -> Self {
        self.additional_parameters = false;
        self
    }

    /// Find a declared parameter by name (case-insensitive)
    pub fn find(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters
            .iter()
            .find(|spec| spec.name.eq_ignore_ascii_case(name))
    }
}

/// Interpreter runtime version (`major.minor.patch`, missing parts are zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RuntimeVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `7`, `7.2`, `7.2.1` or `v7.2`
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let invalid = || DomainError::InvalidRuntimeVersion(raw.to_string());

        if trimmed.is_empty() {
            return Err(invalid());
        }
        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in trimmed.split('.') {
            if count == parts.len() {
                return Err(invalid());
            }
            parts[count] = piece.parse().map_err(|_| invalid())?;
            count += 1;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }

    /// A host runtime satisfies a requirement with the same major version
    /// and an equal or newer minor/patch.
    pub fn satisfies(&self, required: &RuntimeVersion) -> bool {
        self.major == required.major && self >= required
    }
}

impl std::fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Script definition consumed by the engine, immutable for a given run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub content: String,
    pub timeout: Duration,
    pub required_runtime_version: Option<String>,
    pub parameter_schema: Option<ParameterSchema>,
}

impl ScriptDefinition {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timeout: DEFAULT_SCRIPT_TIMEOUT,
            required_runtime_version: None,
            parameter_schema: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.required_runtime_version = Some(version.into());
        self
    }

    pub fn with_schema(mut self, schema: ParameterSchema) -> Self {
        self.parameter_schema = Some(schema);
        self
    }
}

/// How a caller names the script to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptRef {
    /// Stored script, resolved through the script source
    Id(String),
    /// Literal script supplied with the request
    Inline(ScriptDefinition),
}

impl ScriptRef {
    pub fn id(id: impl Into<String>) -> Self {
        ScriptRef::Id(id.into())
    }

    pub fn inline(content: impl Into<String>) -> Self {
        ScriptRef::Inline(ScriptDefinition::new(content))
    }
}
