// Directory script source
// Scripts are files `<id>.<ext>` under one root; an optional `<id>.json`
// manifest next to the script carries timeout, runtime and parameter schema.
use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use script_engine_core::domain::{ParameterSchema, ScriptDefinition};
use script_engine_core::port::{ScriptSource, ScriptSourceError};

/// Script file extensions searched in order
pub const DEFAULT_EXTENSIONS: &[&str] = &["ps1", "sh"];

/// Optional per-script manifest
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    timeout_secs: Option<u64>,
    required_runtime_version: Option<String>,
    parameters: Option<ParameterSchema>,
}

/// Resolves script ids to files under a root directory
pub struct DirectoryScriptSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirectoryScriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids are plain file stems: no separators, no traversal
    fn check_id(script_id: &str) -> Result<(), ScriptSourceError> {
        let invalid = |reason: &str| ScriptSourceError::Invalid {
            id: script_id.to_string(),
            reason: reason.to_string(),
        };
        if script_id.trim().is_empty() {
            return Err(invalid("empty script id"));
        }
        if script_id.contains(['/', '\\']) || script_id.contains("..") {
            return Err(invalid("script id must not contain path components"));
        }
        Ok(())
    }

    async fn read_manifest(&self, script_id: &str) -> Result<Manifest, ScriptSourceError> {
        let path = self.root.join(format!("{}.json", script_id));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(e) => {
                return Err(ScriptSourceError::Unavailable(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&raw).map_err(|e| ScriptSourceError::Invalid {
            id: script_id.to_string(),
            reason: format!("manifest: {}", e),
        })
    }
}

#[async_trait]
impl ScriptSource for DirectoryScriptSource {
    async fn resolve(&self, script_id: &str) -> Result<ScriptDefinition, ScriptSourceError> {
        Self::check_id(script_id)?;

        let mut content = None;
        for ext in &self.extensions {
            let path = self.root.join(format!("{}.{}", script_id, ext));
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    debug!(script_id, path = %path.display(), "Script resolved");
                    content = Some(text);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(ScriptSourceError::Unavailable(format!(
                        "{}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        let content = content.ok_or_else(|| ScriptSourceError::NotFound(script_id.to_string()))?;

        let manifest = self.read_manifest(script_id).await?;
        let mut definition = ScriptDefinition::new(content);
        if let Some(secs) = manifest.timeout_secs {
            definition = definition.with_timeout(Duration::from_secs(secs));
        }
        if let Some(version) = manifest.required_runtime_version {
            definition = definition.with_runtime_version(version);
        }
        if let Some(schema) = manifest.parameters {
            let schema = ParameterSchema::new(schema.parameters.clone())
                .map(|checked| ParameterSchema {
                    additional_parameters: schema.additional_parameters,
                    ..checked
                })
                .map_err(|e| ScriptSourceError::Invalid {
                    id: script_id.to_string(),
                    reason: e.to_string(),
                })?;
            definition = definition.with_schema(schema);
        }
        Ok(definition)
    }
}
