// Script Engine - Host Entry Point
// Composition root: wires the engine to the subprocess runner, the directory
// script source and the sysinfo probe, runs the requested scripts and prints
// one JSON result per script on stdout.

mod args;

use anyhow::{Context, Result};
use args::{HostArgs, Interpreter};
use clap::Parser;
use futures::future::join_all;
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use script_engine_core::application::constants::DEFAULT_SWEEP_INTERVAL;
use script_engine_core::domain::{ExecutionStatus, RuntimeVersion, ScriptRef};
use script_engine_core::port::{ChannelNotifier, LifecycleEvent};
use script_engine_core::{ExecutionEngine, RetentionSweeper, SubmitRequest};
use script_engine_infra_system::{
    DirectoryScriptSource, InterpreterProfile, SubprocessRunner, SysinfoProcessProbe,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `sh` reports no version; scripts requiring one are checked against this
const POSIX_SHELL_VERSION: RuntimeVersion = RuntimeVersion::new(1, 0, 0);

const NOTIFY_CAPACITY: usize = 1024;

fn init_logging() -> Result<()> {
    let log_format =
        std::env::var("SCRIPT_ENGINE_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("script_engine=info"))
        .context("Failed to create env filter")?;

    // stdout carries the JSON results; logs go to stderr
    match log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
    Ok(())
}

async fn interpreter_profile(args: &HostArgs) -> Result<InterpreterProfile> {
    match args.interpreter {
        Interpreter::Sh => Ok(InterpreterProfile::posix_shell(POSIX_SHELL_VERSION)),
        Interpreter::Pwsh => match &args.powershell_version {
            Some(raw) => {
                let version = RuntimeVersion::parse(raw)
                    .with_context(|| format!("Invalid SCRIPT_ENGINE_POWERSHELL_VERSION '{}'", raw))?;
                Ok(InterpreterProfile::powershell(version))
            }
            None => InterpreterProfile::detect_powershell()
                .await
                .context("PowerShell not available (set SCRIPT_ENGINE_INTERPRETER=sh to use sh)"),
        },
    }
}

/// Mirror script output to stderr while runs are in progress
fn follow_output(notifier: &ChannelNotifier) {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(LifecycleEvent::Output {
                    execution_id,
                    chunk,
                    ..
                }) => eprint!("[{}] {}", short_id(&execution_id), chunk),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Output follower lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = HostArgs::parse();

    // 1. Initialize logging
    init_logging()?;
    info!("Script Engine v{} starting...", VERSION);

    // 2. Setup dependencies (DI wiring)
    let profile = interpreter_profile(&args).await?;
    let script_dir = args.script_dir();
    info!(
        script_dir = %script_dir.display(),
        interpreter = %profile.program,
        version = %profile.version,
        "Configuration loaded"
    );

    let runner = Arc::new(SubprocessRunner::new(profile));
    let source = Arc::new(DirectoryScriptSource::new(script_dir));
    let notifier = Arc::new(ChannelNotifier::new(NOTIFY_CAPACITY));
    if args.follow {
        follow_output(&notifier);
    }

    let engine = ExecutionEngine::builder(runner, source)
        .config(args.engine_config())
        .notifier(notifier)
        .probe(Arc::new(SysinfoProcessProbe::new()))
        .build();

    // 3. Validate-only mode
    let parameters = args.parameters();
    if args.validate_only {
        let mut all_valid = true;
        for script in &args.scripts {
            let report = match engine
                .validate_for_mode(&ScriptRef::id(script), &parameters, args.mode())
                .await
            {
                Ok(result) => {
                    all_valid &= result.is_valid;
                    json!({ "script": script, "validation": result })
                }
                Err(e) => {
                    all_valid = false;
                    json!({ "script": script, "error": e.to_string() })
                }
            };
            println!("{}", report);
        }
        return Ok(if all_valid {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    // 4. Start retention sweeper
    let shutdown = CancellationToken::new();
    let sweeper = RetentionSweeper::new(engine.clone(), DEFAULT_SWEEP_INTERVAL);
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    // 5. Submit
    let triggered_by = std::env::var("USER").unwrap_or_else(|_| "script-engine".to_string());
    let mut submitted = Vec::new();
    let mut all_ok = true;
    for script in &args.scripts {
        let request = SubmitRequest::new(ScriptRef::id(script), triggered_by.clone())
            .with_parameters(parameters.clone())
            .with_mode(args.mode());
        match engine.submit(request).await {
            Ok(id) => {
                info!(execution_id = %id, script = %script, "Submitted");
                submitted.push((script.clone(), id));
            }
            Err(e) => {
                all_ok = false;
                let report = match e.validation_result() {
                    Some(result) => json!({ "script": script, "error": e.to_string(), "validation": result }),
                    None => json!({ "script": script, "error": e.to_string() }),
                };
                println!("{}", report);
            }
        }
    }

    // 6. Wait for results (or Ctrl+C)
    let wait_timeout = args.wait_timeout();
    let waits = submitted
        .iter()
        .map(|(_, id)| engine.wait_for_terminal(id, wait_timeout));
    let interrupted = tokio::select! {
        _ = join_all(waits) => false,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Cancelling running scripts...");
            true
        }
    };

    // 7. Graceful shutdown
    let signalled = engine.shutdown().await;
    if interrupted {
        info!(signalled, "Running scripts cancelled");
    }
    shutdown.cancel();
    let _ = sweeper_handle.await;

    // 8. Report
    for (script, id) in &submitted {
        let execution = engine
            .get_status(id)
            .with_context(|| format!("Execution {} disappeared", id))?;
        let metrics = engine.get_metrics(id).unwrap_or(None);
        all_ok &= execution.status == ExecutionStatus::Succeeded;
        println!(
            "{}",
            json!({ "script": script, "execution": execution, "metrics": metrics })
        );
    }

    info!("Shutdown complete.");
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
