// Script Source Port
// Resolves stored script ids to definitions; storage itself lives outside the core

use crate::domain::ScriptDefinition;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptSourceError {
    #[error("Script not found: {0}")]
    NotFound(String),

    #[error("Script source unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid script definition for {id}: {reason}")]
    Invalid { id: String, reason: String },
}

/// Script source collaborator
#[async_trait]
pub trait ScriptSource: Send + Sync {
    /// Resolve a script id to its definition
    ///
    /// # Errors
    /// - ScriptSourceError::NotFound if the id is unknown
    async fn resolve(&self, script_id: &str) -> Result<ScriptDefinition, ScriptSourceError>;
}

/// In-memory script source (embedding and tests)
#[derive(Default)]
pub struct InMemoryScriptSource {
    scripts: RwLock<HashMap<String, ScriptDefinition>>,
}

impl InMemoryScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, definition: ScriptDefinition) {
        let mut scripts = self
            .scripts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scripts.insert(id.into(), definition);
    }

    pub fn with_script(self, id: impl Into<String>, definition: ScriptDefinition) -> Self {
        self.insert(id, definition);
        self
    }
}

#[async_trait]
impl ScriptSource for InMemoryScriptSource {
    async fn resolve(&self, script_id: &str) -> Result<ScriptDefinition, ScriptSourceError> {
        let scripts = self
            .scripts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scripts
            .get(script_id)
            .cloned()
            .ok_or_else(|| ScriptSourceError::NotFound(script_id.to_string()))
    }
}
