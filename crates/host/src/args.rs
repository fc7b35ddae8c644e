// Command-line and environment configuration for the host binary

use clap::{Parser, ValueEnum};
use script_engine_core::application::constants::DEFAULT_MAX_QUEUE_DEPTH;
use script_engine_core::domain::{CapabilityMode, Parameters};
use script_engine_core::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SCRIPT_DIR: &str = "~/.script-engine/scripts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Interpreter {
    /// PowerShell 7+ (`pwsh`)
    Pwsh,
    /// POSIX shell (`sh`, restricted runs use `bash --restricted`)
    Sh,
}

#[derive(Debug, Parser)]
#[command(name = "script-engine")]
#[command(about = "Run stored scripts in isolated interpreter processes", long_about = None)]
#[command(version)]
pub struct HostArgs {
    /// Script ids to run (files under the script directory)
    #[arg(required = true)]
    pub scripts: Vec<String>,

    /// Parameter passed to every script; VALUE is parsed as JSON, else taken as a string
    #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, serde_json::Value)>,

    /// Run in restricted capability mode
    #[arg(long)]
    pub restricted: bool,

    /// Only validate the scripts, do not run them
    #[arg(long)]
    pub validate_only: bool,

    /// Stream script output to stderr while running
    #[arg(short, long)]
    pub follow: bool,

    /// Give up waiting for results after this many seconds
    #[arg(long, default_value = "3600")]
    pub wait_secs: u64,

    /// Directory holding `<id>.ps1` / `<id>.sh` scripts and optional `<id>.json` manifests
    #[arg(long, env = "SCRIPT_ENGINE_SCRIPT_DIR", default_value = DEFAULT_SCRIPT_DIR)]
    pub script_dir: String,

    #[arg(long, env = "SCRIPT_ENGINE_INTERPRETER", value_enum, default_value = "pwsh")]
    pub interpreter: Interpreter,

    /// PowerShell version to assume instead of asking `pwsh`
    #[arg(long, env = "SCRIPT_ENGINE_POWERSHELL_VERSION")]
    pub powershell_version: Option<String>,

    /// Concurrent runs (default: host parallelism)
    #[arg(long, env = "SCRIPT_ENGINE_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    #[arg(long, env = "SCRIPT_ENGINE_QUEUE_DEPTH", default_value_t = DEFAULT_MAX_QUEUE_DEPTH)]
    pub queue_depth: usize,
}

impl HostArgs {
    pub fn script_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.script_dir).into_owned())
    }

    pub fn parameters(&self) -> Parameters {
        self.params.iter().cloned().collect()
    }

    pub fn mode(&self) -> CapabilityMode {
        if self.restricted {
            CapabilityMode::Restricted
        } else {
            CapabilityMode::Full
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            max_queue_depth: self.queue_depth,
            ..EngineConfig::default()
        };
        if let Some(max) = self.max_concurrency {
            config.max_concurrent_runs = max.max(1);
        }
        config
    }
}

/// Parse `KEY=VALUE`
fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("Name=world").unwrap(),
            ("Name".to_string(), json!("world"))
        );
        assert_eq!(parse_param("count=3").unwrap(), ("count".to_string(), json!(3)));
        assert_eq!(
            parse_param("tags=[\"a\",\"b\"]").unwrap(),
            ("tags".to_string(), json!(["a", "b"]))
        );
        assert_eq!(
            parse_param("query=a=b").unwrap(),
            ("query".to_string(), json!("a=b"))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let args = HostArgs::try_parse_from([
            "script-engine",
            "--interpreter",
            "sh",
            "--queue-depth",
            "8",
            "-p",
            "Name=x",
            "--restricted",
            "hello",
            "bye",
        ])
        .unwrap();

        assert_eq!(args.scripts, vec!["hello".to_string(), "bye".to_string()]);
        assert_eq!(args.interpreter, Interpreter::Sh);
        assert_eq!(args.mode(), CapabilityMode::Restricted);
        assert_eq!(args.parameters().get("Name"), Some(&json!("x")));

        let config = args.engine_config();
        assert_eq!(config.max_queue_depth, 8);
        assert!(config.max_concurrent_runs >= 1);
    }

    #[test]
    fn test_scripts_required() {
        tokio_test::assert_err!(HostArgs::try_parse_from(["script-engine"]));
    }
}
