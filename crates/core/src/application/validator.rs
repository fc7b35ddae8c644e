// Script Validator
// Pure inspection of a script and proposed parameters before execution
//
// No I/O, no shared state, deterministic. Checks run in a fixed order so
// errors and warnings come out ordered:
// 1. content present and within the size limit
// 2. parameters against the declared schema
// 3. static risk indicators (elevation, dynamic code, native calls, network)
// 4. restricted-mode policy (only for restricted runs)
// 5. required runtime version against the host runtimes

use crate::domain::{
    CapabilityMode, ExecutionValidationResult, ParameterSchema, ParameterType, Parameters, RuntimeVersion,
    ScriptDefinition, SecurityRiskLevel,
};
use serde::{Deserialize, Serialize};

/// Default maximum script size (1 MiB)
pub const DEFAULT_MAX_SCRIPT_BYTES: usize = 1024 * 1024;

/// Validation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Scripts larger than this are rejected
    pub max_script_bytes: usize,

    /// When set, scripts rated above this level are rejected
    pub block_risk_above: Option<SecurityRiskLevel>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_script_bytes: DEFAULT_MAX_SCRIPT_BYTES,
            block_risk_above: None,
        }
    }
}

/// Static risk indicator
struct RiskIndicator {
    /// Lowercase token searched for
    token: &'static str,
    /// Display name used in warnings
    name: &'static str,
    level: SecurityRiskLevel,
    requires_elevation: bool,
    reason: &'static str,
}

const fn indicator(
    token: &'static str,
    name: &'static str,
    level: SecurityRiskLevel,
    requires_elevation: bool,
    reason: &'static str,
) -> RiskIndicator {
    RiskIndicator {
        token,
        name,
        level,
        requires_elevation,
        reason,
    }
}

use SecurityRiskLevel::{High, Low, Medium};

const RISK_INDICATORS: &[RiskIndicator] = &[
    // Elevation
    indicator("#requires -runasadministrator", "#Requires -RunAsAdministrator", High, true, "declares it must run elevated"),
    indicator("-verb runas", "-Verb RunAs", High, true, "starts an elevated process"),
    indicator("set-executionpolicy", "Set-ExecutionPolicy", High, true, "changes the execution policy"),
    indicator("new-service", "New-Service", High, true, "installs a service"),
    indicator("stop-computer", "Stop-Computer", High, true, "shuts down the host"),
    indicator("restart-computer", "Restart-Computer", High, true, "restarts the host"),
    indicator("format-volume", "Format-Volume", High, true, "formats a volume"),
    indicator("hklm:", "HKLM:", Medium, true, "touches the machine-wide registry hive"),
    indicator("sudo", "sudo", High, true, "escalates privileges"),
    // Dynamic code and native calls
    indicator("invoke-expression", "Invoke-Expression", High, false, "evaluates dynamic code"),
    indicator("iex", "iex", High, false, "evaluates dynamic code"),
    indicator("add-type", "Add-Type", High, false, "compiles and loads native code"),
    indicator("[system.runtime.interopservices", "InteropServices", High, false, "calls native APIs"),
    indicator("downloadstring", "DownloadString", High, false, "downloads remote code"),
    // Network, processes, filesystem
    indicator("invoke-webrequest", "Invoke-WebRequest", Medium, false, "accesses the network"),
    indicator("invoke-restmethod", "Invoke-RestMethod", Medium, false, "accesses the network"),
    indicator("net.webclient", "Net.WebClient", Medium, false, "accesses the network"),
    indicator("start-process", "Start-Process", Medium, false, "spawns processes"),
    indicator("remove-item", "Remove-Item", Medium, false, "deletes files"),
    indicator("set-content", "Set-Content", Low, false, "writes files"),
];

/// Script validator
pub struct ScriptValidator {
    config: ValidationConfig,
    host_runtimes: Vec<RuntimeVersion>,
}

impl ScriptValidator {
    /// Create a validator
    ///
    /// # Arguments
    /// * `config` - Size and risk limits
    /// * `host_runtimes` - Runtime versions available on this host
    pub fn new(config: ValidationConfig, host_runtimes: Vec<RuntimeVersion>) -> Self {
        Self {
            config,
            host_runtimes,
        }
    }

    pub fn host_runtimes(&self) -> &[RuntimeVersion] {
        &self.host_runtimes
    }

    /// Validate a script definition and proposed parameters for a full-capability run
    pub fn validate(
        &self,
        definition: &ScriptDefinition,
        parameters: &Parameters,
    ) -> ExecutionValidationResult {
        self.validate_for_mode(definition, parameters, CapabilityMode::Full)
    }

    /// Validate for a run in the given capability mode
    ///
    /// Restricted runs additionally reject medium/high risk indicators and
    /// any reference to the host filesystem outside the working directory.
    pub fn validate_for_mode(
        &self,
        definition: &ScriptDefinition,
        parameters: &Parameters,
        mode: CapabilityMode,
    ) -> ExecutionValidationResult {
        let mut result = ExecutionValidationResult::default();

        self.check_content(definition, &mut result);
        if let Some(schema) = &definition.parameter_schema {
            check_parameters(schema, parameters, &mut result);
        }
        self.check_risk(&definition.content, &mut result);
        if mode == CapabilityMode::Restricted {
            check_restricted(&definition.content, &mut result);
        }
        self.check_runtime(definition, &mut result);

        result.finish()
    }

    fn check_content(&self, definition: &ScriptDefinition, result: &mut ExecutionValidationResult) {
        if definition.content.trim().is_empty() {
            result.error("Script content is empty");
        } else if definition.content.len() > self.config.max_script_bytes {
            result.error(format!(
                "Script content is {} bytes, exceeding the {} byte limit",
                definition.content.len(),
                self.config.max_script_bytes
            ));
        }
    }

    fn check_risk(&self, content: &str, result: &mut ExecutionValidationResult) {
        let lowered = content.to_lowercase();
        for risk in RISK_INDICATORS {
            if contains_token(&lowered, risk.token) {
                result.warning(format!("Script uses {}: {}", risk.name, risk.reason));
                result.raise_risk(risk.level);
                result.requires_elevation |= risk.requires_elevation;
            }
        }

        if let Some(ceiling) = self.config.block_risk_above {
            if result.security_risk_level > ceiling {
                result.error(format!(
                    "Security risk level {} exceeds the allowed {}",
                    result.security_risk_level, ceiling
                ));
            }
        }
    }

    fn check_runtime(&self, definition: &ScriptDefinition, result: &mut ExecutionValidationResult) {
        let Some(raw) = definition.required_runtime_version.as_deref() else {
            return;
        };
        if raw.trim().is_empty() {
            return;
        }

        let required = match RuntimeVersion::parse(raw) {
            Ok(version) => version,
            Err(_) => {
                result.error(format!("Invalid required runtime version '{}'", raw));
                return;
            }
        };

        if !self.host_runtimes.iter().any(|host| host.satisfies(&required)) {
            let available = if self.host_runtimes.is_empty() {
                "none".to_string()
            } else {
                self.host_runtimes
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            result
                .missing_dependencies
                .push(format!("runtime {}.x >= {}", required.major, required));
            result.error(format!(
                "Required runtime {} is not available (host provides: {})",
                required, available
            ));
        }
    }
}

/// One error per missing required parameter and per type mismatch
fn check_parameters(
    schema: &ParameterSchema,
    parameters: &Parameters,
    result: &mut ExecutionValidationResult,
) {
    for spec in &schema.parameters {
        let supplied = parameters
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&spec.name))
            .map(|(_, value)| value)
            .filter(|value| !value.is_null());

        match supplied {
            None if spec.required => result.error(format!(
                "Missing required parameter '{}' ({})",
                spec.name, spec.kind
            )),
            None => {}
            Some(value) if !spec.kind.accepts(value) => result.error(format!(
                "Parameter '{}' expects {}, got {}",
                spec.name,
                spec.kind,
                ParameterType::describe(value)
            )),
            Some(_) => {}
        }
    }

    for name in parameters.keys() {
        if schema.find(name).is_some() {
            continue;
        }
        if schema.additional_parameters {
            result.warning(format!("Parameter '{}' is not declared by the script", name));
        } else {
            result.error(format!("Unknown parameter '{}'", name));
        }
    }
}

fn check_restricted(content: &str, result: &mut ExecutionValidationResult) {
    let lowered = content.to_lowercase();
    for risk in RISK_INDICATORS.iter().filter(|risk| risk.level >= Medium) {
        if contains_token(&lowered, risk.token) {
            result.error(format!("{} is not allowed in restricted mode", risk.name));
        }
    }
    for violation in restricted_violations(content) {
        result.error(violation);
    }
}

/// Characters that end a word in shell and PowerShell source
const WORD_SEPARATORS: &[char] = &[
    ' ', '\t', '\n', '\r', '\'', '"', '`', '(', ')', '{', '}', '[', ']', ';', '|', '&', '<', '>',
    '=', ',', '$',
];

/// Host filesystem references a restricted script may not make
///
/// Restricted runs are confined to their temporary working directory:
/// absolute paths, home-relative paths, parent-directory hops and
/// module-qualified cmdlet names are refused.
pub fn restricted_violations(content: &str) -> Vec<String> {
    let mut violations: Vec<String> = Vec::new();
    for word in content.split(WORD_SEPARATORS).filter(|w| !w.is_empty()) {
        let violation = if is_absolute_path(word) {
            format!("Absolute path '{}' is not allowed in restricted mode", word)
        } else if word.starts_with('~') {
            format!("Home directory path '{}' is not allowed in restricted mode", word)
        } else if word.split(['/', '\\']).any(|segment| segment == "..") {
            format!("Parent directory reference '{}' is not allowed in restricted mode", word)
        } else if word.to_lowercase().starts_with("microsoft.powershell.") {
            format!("Module-qualified command '{}' is not allowed in restricted mode", word)
        } else {
            continue;
        };
        if !violations.contains(&violation) {
            violations.push(violation);
        }
    }
    violations
}

fn is_absolute_path(word: &str) -> bool {
    let bytes = word.as_bytes();
    match bytes {
        // "/" alone is the division operator
        [b'/', _, ..] => true,
        [b'\\', b'\\', ..] => true,
        [drive, b':', b'/' | b'\\', ..] => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

/// Substring match that does not start or end inside an identifier
fn contains_token(haystack: &str, token: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '-';
    haystack.match_indices(token).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + token.len()..].chars().next();
        let starts_clean = before.map_or(true, |c| !is_word(c) || !token.starts_with(is_word));
        let ends_clean = after.map_or(true, |c| !is_word(c) || !token.ends_with(is_word));
        starts_clean && ends_clean
    })
}
