// Subprocess runner implementation
// reason: tokio process management, nix for process-group signals
//
// One interpreter process per run: its own process group, a fresh empty
// temporary working directory, a cleared environment plus an allowlist.
// The script text is piped to the interpreter on stdin.
use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use script_engine_core::application::validator::restricted_violations;
use script_engine_core::domain::{CapabilityMode, Parameters, RuntimeVersion};
use script_engine_core::port::{
    CompletionReason, RunEvents, RunOutcome, RunRequest, RunnerError, ScriptRunner,
};

/// Grace window between SIGTERM and SIGKILL (fixed, not configurable)
pub const GRACE_WINDOW: Duration = Duration::from_secs(3);

/// How long to wait for the output pipes after the process is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on interpreter version detection
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable carrying all parameters as JSON
pub const PARAMETERS_ENV: &str = "SCRIPT_PARAMETERS";

/// Prefix of the per-parameter environment variables
pub const PARAMETER_ENV_PREFIX: &str = "SCRIPT_PARAM_";

/// Variables passed through from the host environment by default
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TZ",
    "SYSTEMROOT",
    "PSModulePath",
];

/// Cmdlets shadowed in restricted PowerShell sessions: filesystem,
/// network, process and module access
const POWERSHELL_DENIED_COMMANDS: &[&str] = &[
    "Get-Content",
    "Set-Content",
    "Add-Content",
    "Clear-Content",
    "Out-File",
    "Tee-Object",
    "Get-ChildItem",
    "Get-Item",
    "Set-Item",
    "New-Item",
    "Remove-Item",
    "Copy-Item",
    "Move-Item",
    "Rename-Item",
    "Test-Path",
    "Resolve-Path",
    "Set-Location",
    "Push-Location",
    "Select-String",
    "Import-Csv",
    "Export-Csv",
    "Import-Module",
    "Invoke-WebRequest",
    "Invoke-RestMethod",
    "Start-Process",
    "Start-Job",
    "Invoke-Command",
    "Invoke-Expression",
    "New-PSSession",
    "Enter-PSSession",
    "Add-Type",
    "New-Object",
];

/// Restricted PowerShell session setup
///
/// Runs in FullLanguage before the switch: empties the application and
/// script allowlists, drops built-in aliases of denied cmdlets, shadows the
/// cmdlets with constant aliases to a throwing function, then enters
/// ConstrainedLanguage.
fn powershell_restricted_prelude() -> String {
    let denied = POWERSHELL_DENIED_COMMANDS
        .iter()
        .map(|name| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "$ExecutionContext.SessionState.Applications.Clear()\n\
         $ExecutionContext.SessionState.Scripts.Clear()\n\
         $__denied = @({denied})\n\
         Get-Alias | Where-Object {{ $__denied -contains $_.ResolvedCommandName }} | \
         ForEach-Object {{ Remove-Item -Force -LiteralPath \"Alias:$($_.Name)\" }}\n\
         New-Item -Path Function:Stop-RestrictedCommand -Options Constant -Value \
         {{ throw \"$($MyInvocation.InvocationName) is not allowed in restricted mode\" }} | Out-Null\n\
         foreach ($__name in $__denied) {{ \
         Set-Alias -Name $__name -Value Stop-RestrictedCommand -Option Constant -Scope Global }}\n\
         Remove-Variable __denied, __name\n\
         $ExecutionContext.SessionState.LanguageMode = 'ConstrainedLanguage'\n"
    )
}

/// Restricted-mode variant of an interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Prepended after the profile prelude
    pub prelude: Option<String>,
}

/// How to invoke one interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterProfile {
    pub program: String,
    pub args: Vec<String>,
    /// None when the interpreter has no restricted mode
    pub restricted: Option<RestrictedInvocation>,
    /// Prepended to every script (parameter binding)
    pub prelude: Option<String>,
    pub version: RuntimeVersion,
}

impl InterpreterProfile {
    /// PowerShell 7+ (`pwsh`) reading the script from stdin
    ///
    /// Parameters are bound as script variables from `SCRIPT_PARAMETERS`;
    /// restricted mode blocks native executables and host-access cmdlets and
    /// switches the session to ConstrainedLanguage.
    pub fn powershell(version: RuntimeVersion) -> Self {
        let args: Vec<String> = ["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", "-"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            program: "pwsh".to_string(),
            restricted: Some(RestrictedInvocation {
                program: "pwsh".to_string(),
                args: args.clone(),
                prelude: Some(powershell_restricted_prelude()),
            }),
            args,
            prelude: Some(format!(
                "if ($env:{env}) {{ ($env:{env} | ConvertFrom-Json).PSObject.Properties | \
                 ForEach-Object {{ Set-Variable -Name $_.Name -Value $_.Value }} }}\n",
                env = PARAMETERS_ENV
            )),
            version,
        }
    }

    /// POSIX `sh`; restricted mode runs `bash --restricted`
    pub fn posix_shell(version: RuntimeVersion) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-s".to_string()],
            restricted: Some(RestrictedInvocation {
                program: "bash".to_string(),
                args: vec!["--restricted".to_string(), "-s".to_string()],
                prelude: None,
            }),
            prelude: None,
            version,
        }
    }

    /// Same interpreter without a restricted variant
    pub fn without_restricted_mode(mut self) -> Self {
        self.restricted = None;
        self
    }

    /// Program, arguments and full script text for one run
    ///
    /// # Errors
    /// - RunnerError::UnsupportedMode for restricted mode without a restricted variant
    fn invocation(
        &self,
        mode: CapabilityMode,
        content: &str,
    ) -> Result<(&str, Vec<String>, String), RunnerError> {
        let mut script = self.prelude.clone().unwrap_or_default();
        let (program, args) = match mode {
            CapabilityMode::Full => (self.program.as_str(), self.args.clone()),
            CapabilityMode::Restricted => {
                let restricted = self.restricted.as_ref().ok_or_else(|| {
                    RunnerError::UnsupportedMode(format!(
                        "{} has no restricted mode",
                        self.program
                    ))
                })?;
                if let Some(prelude) = &restricted.prelude {
                    script.push_str(prelude);
                }
                (restricted.program.as_str(), restricted.args.clone())
            }
        };
        script.push_str(content);
        if !script.ends_with('\n') {
            script.push('\n');
        }
        Ok((program, args, script))
    }

    /// Ask `pwsh` for its version
    ///
    /// # Errors
    /// - RunnerError::SpawnFailed if pwsh is missing or reports no usable version
    pub async fn detect_powershell() -> Result<Self, RunnerError> {
        let mut cmd = Command::new("pwsh");
        cmd.args([
            "-NoLogo",
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            "$PSVersionTable.PSVersion.ToString()",
        ])
        .stdin(Stdio::null())
        .kill_on_drop(true);

        let output = timeout(VERSION_PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| RunnerError::SpawnFailed("pwsh version probe timed out".to_string()))?
            .map_err(|e| RunnerError::SpawnFailed(format!("pwsh: {}", e)))?;

        let text = String::from_utf8_lossy(&output.stdout);
        // "7.4.1" or "7.5.0-preview.2"
        let numeric = text.trim().split('-').next().unwrap_or_default();
        let version = RuntimeVersion::parse(numeric).map_err(|_| {
            RunnerError::SpawnFailed(format!("unrecognized pwsh version '{}'", text.trim()))
        })?;

        info!(version = %version, "Detected PowerShell");
        Ok(Self::powershell(version))
    }
}

/// Subprocess runner
/// Spawns one isolated interpreter process per run with environment allowlisting
pub struct SubprocessRunner {
    profile: InterpreterProfile,
    env_allowlist: Vec<String>,
}

impl SubprocessRunner {
    /// Create a new subprocess runner
    ///
    /// # Arguments
    /// * `profile` - Interpreter invocation
    ///
    /// # Example
    /// ```ignore
    /// let runner = SubprocessRunner::new(InterpreterProfile::posix_shell(RuntimeVersion::new(1, 0, 0)))
    ///     .with_env_allowlist(vec!["PATH".to_string()]);
    /// ```
    pub fn new(profile: InterpreterProfile) -> Self {
        Self {
            profile,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the host variables passed through to scripts
    pub fn with_env_allowlist(mut self, env_allowlist: Vec<String>) -> Self {
        self.env_allowlist = env_allowlist;
        self
    }

    pub fn profile(&self) -> &InterpreterProfile {
        &self.profile
    }

    /// Filter environment variables to allowlist only
    fn filter_env<I>(&self, env: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        env.into_iter()
            .filter(|(k, _)| self.env_allowlist.contains(k))
            .collect()
    }

    fn check_runtime(&self, required: Option<&str>) -> Result<(), RunnerError> {
        let Some(raw) = required.filter(|raw| !raw.trim().is_empty()) else {
            return Ok(());
        };
        match RuntimeVersion::parse(raw) {
            Ok(required) if self.profile.version.satisfies(&required) => Ok(()),
            _ => Err(RunnerError::SpawnFailed(format!(
                "{} {} does not satisfy required runtime {}",
                self.profile.program, self.profile.version, raw
            ))),
        }
    }

    /// Host variables for the child; restricted runs get an empty `PATH` and
    /// the working directory as `HOME`
    fn child_env(
        &self,
        mode: CapabilityMode,
        workdir: &Path,
        empty_path: &Path,
    ) -> Vec<(String, String)> {
        let mut vars = self.filter_env(std::env::vars());
        if mode == CapabilityMode::Restricted {
            vars.retain(|(key, _)| key != "PATH" && key != "HOME");
            vars.push(("PATH".to_string(), empty_path.display().to_string()));
            vars.push(("HOME".to_string(), workdir.display().to_string()));
        }
        vars
    }

    /// Interrupt the process group: SIGTERM, then SIGKILL after the grace window
    async fn terminate(
        &self,
        child: &mut Child,
    ) -> Result<(ExitStatus, CompletionReason), RunnerError> {
        let Some(pid) = child.id() else {
            // Already reaped
            let status = child.wait().await.map_err(|e| RunnerError::Io(e.to_string()))?;
            return Ok((status, CompletionReason::Exited));
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let group = Pid::from_raw(pid as i32);

            // Step 1: Send SIGTERM for graceful shutdown
            info!(pid, "Sending SIGTERM to process group");
            if let Err(e) = killpg(group, Signal::SIGTERM) {
                warn!(pid, error = %e, "SIGTERM failed");
            }

            // Step 2: Wait for the grace window
            if let Ok(status) = timeout(GRACE_WINDOW, child.wait()).await {
                let status = status.map_err(|e| RunnerError::Io(e.to_string()))?;
                info!(pid, "Process exited after SIGTERM");
                return Ok((status, CompletionReason::Interrupted));
            }

            // Step 3: Force kill the whole group
            warn!(pid, "Process did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                warn!(pid, error = %e, "SIGKILL failed");
            }
        }

        #[cfg(not(unix))]
        {
            info!(pid, "Killing process");
            child
                .start_kill()
                .map_err(|e| RunnerError::Killed(e.to_string()))?;
        }

        let status = child.wait().await.map_err(|e| RunnerError::Io(e.to_string()))?;
        Ok((status, CompletionReason::Killed))
    }
}

/// Environment variables exposing the parameters to the script
fn parameter_env(parameters: &Parameters) -> Result<Vec<(String, String)>, RunnerError> {
    let json = serde_json::to_string(parameters)
        .map_err(|e| RunnerError::Fault(format!("parameters not serializable: {}", e)))?;

    let mut vars = vec![(PARAMETERS_ENV.to_string(), json)];
    for (name, value) in parameters {
        let key: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        vars.push((format!("{}{}", PARAMETER_ENV_PREFIX, key), text));
    }
    Ok(vars)
}

/// Statements submitted to the interpreter (non-blank, non-comment lines)
fn statement_count(content: &str) -> usize {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count()
}

/// Forward one output stream line by line as run events
async fn pump<R>(stream: Option<R>, events: RunEvents, is_error: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => events.output(String::from_utf8_lossy(&line).into_owned(), is_error),
            Err(e) => {
                warn!(error = %e, is_error, "Output stream read failed");
                break;
            }
        }
    }
}

/// Wait for a pump task to reach end of stream
async fn drain(mut task: JoinHandle<()>) {
    match timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Output reader failed"),
        Err(_) => {
            warn!("Output pipe still open after exit; dropping reader");
            task.abort();
        }
    }
}

/// SIGKILL whatever is left of the process group once the interpreter is gone
#[cfg(unix)]
fn kill_leftovers(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pid, "Killed leftover processes of the run"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to kill leftover processes"),
    }
}

#[async_trait]
impl ScriptRunner for SubprocessRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        events: RunEvents,
    ) -> Result<RunOutcome, RunnerError> {
        self.check_runtime(request.required_runtime_version.as_deref())?;
        if request.mode == CapabilityMode::Restricted {
            let violations = restricted_violations(&request.content);
            if !violations.is_empty() {
                return Err(RunnerError::Denied(violations.join("; ")));
            }
        }
        let (program, args, script) = self.profile.invocation(request.mode, &request.content)?;
        // Resolved against the host PATH: the child's PATH may be empty
        let program_path = which::which(program)
            .map_err(|e| RunnerError::SpawnFailed(format!("{}: {}", program, e)))?;

        let workdir = tempfile::Builder::new()
            .prefix("script-run-")
            .tempdir()
            .map_err(|e| RunnerError::SpawnFailed(format!("working directory: {}", e)))?;
        let empty_path = tempfile::Builder::new()
            .prefix("script-path-")
            .tempdir()
            .map_err(|e| RunnerError::SpawnFailed(format!("search path directory: {}", e)))?;

        let mut cmd = Command::new(&program_path);
        cmd.args(&args)
            .env_clear()
            .envs(self.child_env(request.mode, workdir.path(), empty_path.path()))
            .envs(parameter_env(&request.parameters)?)
            .current_dir(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            RunnerError::SpawnFailed(format!("{}: {}", program, e))
        })?;
        let pid = child.id();

        info!(
            execution_id = %request.execution_id,
            program,
            pid = ?pid,
            mode = %request.mode,
            workdir = %workdir.path().display(),
            "Interpreter started"
        );
        events.started(pid, Some(self.profile.version.to_string()));
        for _ in 0..statement_count(&request.content) {
            events.command();
        }

        // Feed stdin in the background: a script that never reads it must not block us
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(script.as_bytes()).await {
                    debug!(error = %e, "Interpreter closed stdin early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stdout_task = tokio::spawn(pump(child.stdout.take(), events.clone(), false));
        let stderr_task = tokio::spawn(pump(child.stderr.take(), events.clone(), true));

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let (status, completion_reason) = match exited {
            Some(status) => (
                status.map_err(|e| RunnerError::Io(e.to_string()))?,
                CompletionReason::Exited,
            ),
            None => self.terminate(&mut child).await?,
        };

        // Background descendants must not outlive the run
        #[cfg(unix)]
        if let Some(pid) = pid {
            kill_leftovers(pid);
        }

        drain(stdout_task).await;
        drain(stderr_task).await;

        info!(
            execution_id = %request.execution_id,
            exit_code = ?status.code(),
            reason = ?completion_reason,
            "Interpreter finished"
        );

        Ok(RunOutcome {
            exit_code: status.code(),
            completion_reason,
        })
    }

    fn available_runtimes(&self) -> Vec<RuntimeVersion> {
        vec![self.profile.version]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use script_engine_core::port::RunEvent;
    use serde_json::json;

    fn request(content: &str) -> RunRequest {
        RunRequest {
            execution_id: "exec-1".to_string(),
            content: content.to_string(),
            parameters: Parameters::new(),
            mode: CapabilityMode::Full,
            required_runtime_version: None,
        }
    }

    fn restricted(content: &str) -> RunRequest {
        RunRequest {
            mode: CapabilityMode::Restricted,
            ..request(content)
        }
    }

    fn sh() -> SubprocessRunner {
        SubprocessRunner::new(InterpreterProfile::posix_shell(RuntimeVersion::new(1, 0, 0)))
    }

    #[test]
    fn test_env_filtering() {
        let runner = sh().with_env_allowlist(vec!["ALLOWED_VAR".to_string()]);

        let env = vec![
            ("ALLOWED_VAR".to_string(), "value1".to_string()),
            ("BLOCKED_VAR".to_string(), "value2".to_string()),
        ];
        let filtered = runner.filter_env(env);

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, "ALLOWED_VAR");
    }

    #[test]
    fn test_restricted_env_replaces_path_and_home() {
        let runner = sh().with_env_allowlist(vec!["PATH".to_string(), "HOME".to_string()]);
        let workdir = Path::new("/tmp/script-run-x");
        let empty = Path::new("/tmp/script-path-x");

        let full = runner.child_env(CapabilityMode::Full, workdir, empty);
        assert!(!full.contains(&("PATH".to_string(), empty.display().to_string())));

        let vars = runner.child_env(CapabilityMode::Restricted, workdir, empty);
        let lookup = |key: &str| -> Vec<&str> {
            vars.iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .collect()
        };
        assert_eq!(lookup("PATH"), vec!["/tmp/script-path-x"]);
        assert_eq!(lookup("HOME"), vec!["/tmp/script-run-x"]);
    }

    #[test]
    fn test_parameter_env() {
        let parameters: Parameters =
            serde_json::from_value(json!({"name": "world", "retry-count": 3, "empty": null}))
                .unwrap();
        let vars = parameter_env(&parameters).unwrap();

        assert_eq!(vars[0].0, PARAMETERS_ENV);
        assert!(vars[0].1.contains("\"name\":\"world\""));
        assert!(vars.contains(&("SCRIPT_PARAM_NAME".to_string(), "world".to_string())));
        assert!(vars.contains(&("SCRIPT_PARAM_RETRY_COUNT".to_string(), "3".to_string())));
        assert!(vars.contains(&("SCRIPT_PARAM_EMPTY".to_string(), String::new())));
    }

    #[test]
    fn test_powershell_invocation() {
        let profile = InterpreterProfile::powershell(RuntimeVersion::new(7, 4, 0));
        let (program, args, script) = profile
            .invocation(CapabilityMode::Full, "Write-Output 1")
            .unwrap();
        assert_eq!(program, "pwsh");
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(script.contains("ConvertFrom-Json"));
        assert!(!script.contains("ConstrainedLanguage"));
        assert!(script.ends_with("Write-Output 1\n"));

        let (_, _, restricted) = profile
            .invocation(CapabilityMode::Restricted, "Write-Output 1")
            .unwrap();
        let body_at = restricted.find("Write-Output 1").unwrap();
        let natives_at = restricted.find("Applications.Clear()").unwrap();
        let shadow_at = restricted.find("'Get-Content','Set-Content'").unwrap();
        let mode_at = restricted.find("ConstrainedLanguage").unwrap();
        assert!(natives_at < shadow_at && shadow_at < mode_at && mode_at < body_at);
        assert!(restricted.contains("'Invoke-WebRequest'"));
    }

    #[test]
    fn test_restricted_shell_uses_bash() {
        let sh = InterpreterProfile::posix_shell(RuntimeVersion::new(1, 0, 0));
        let (program, args, _) = sh.invocation(CapabilityMode::Full, "echo hi").unwrap();
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["-s".to_string()]);

        let (program, args, _) = sh.invocation(CapabilityMode::Restricted, "echo hi").unwrap();
        assert_eq!(program, "bash");
        assert_eq!(args, vec!["--restricted".to_string(), "-s".to_string()]);
    }

    #[test]
    fn test_restricted_mode_unsupported() {
        let sh =
            InterpreterProfile::posix_shell(RuntimeVersion::new(1, 0, 0)).without_restricted_mode();
        assert!(matches!(
            sh.invocation(CapabilityMode::Restricted, "echo hi"),
            Err(RunnerError::UnsupportedMode(_))
        ));
    }

    #[test]
    fn test_statement_count() {
        assert_eq!(statement_count("# header\necho a\n\n  echo b  \n"), 2);
        assert_eq!(statement_count(""), 0);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::time::Instant;

        /// Outcome of one run together with everything it streamed
        struct Finished {
            outcome: RunOutcome,
            stdout: String,
            stderr: String,
            events: Vec<RunEvent>,
        }

        async fn run(
            runner: &SubprocessRunner,
            request: RunRequest,
            cancel: CancellationToken,
        ) -> Result<Finished, RunnerError> {
            let (events, mut rx) = RunEvents::channel();
            let outcome = runner.run(request, cancel, events).await?;

            let mut finished = Finished {
                outcome,
                stdout: String::new(),
                stderr: String::new(),
                events: Vec::new(),
            };
            while let Ok(event) = rx.try_recv() {
                if let RunEvent::Output { chunk, is_error } = &event {
                    if *is_error {
                        finished.stderr.push_str(chunk);
                    } else {
                        finished.stdout.push_str(chunk);
                    }
                }
                finished.events.push(event);
            }
            Ok(finished)
        }

        fn bash_available() -> bool {
            which::which("bash").is_ok()
        }

        #[tokio::test]
        async fn test_run_success_streams_output() {
            let finished = tokio_test::assert_ok!(
                run(&sh(), request("echo hello\necho world"), CancellationToken::new()).await
            );

            assert!(finished.outcome.exited_cleanly());
            assert_eq!(finished.stdout, "hello\nworld\n");
            assert!(finished.stderr.is_empty());
            assert!(matches!(
                finished.events.first(),
                Some(RunEvent::Started { pid: Some(_), .. })
            ));
            let commands = finished
                .events
                .iter()
                .filter(|e| **e == RunEvent::Command)
                .count();
            assert_eq!(commands, 2);
        }

        #[tokio::test]
        async fn test_nonzero_exit_and_stderr() {
            let finished = run(&sh(), request("echo bad >&2\nexit 3"), CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(finished.outcome.exit_code, Some(3));
            assert_eq!(finished.outcome.completion_reason, CompletionReason::Exited);
            assert!(!finished.outcome.exited_cleanly());
            assert_eq!(finished.stderr, "bad\n");
        }

        #[tokio::test]
        async fn test_parameters_reach_script() {
            let mut req = request("echo \"$SCRIPT_PARAM_NAME $SCRIPT_PARAM_COUNT\"");
            req.parameters = serde_json::from_value(json!({"Name": "world", "count": 3})).unwrap();

            let finished = run(&sh(), req, CancellationToken::new()).await.unwrap();
            assert_eq!(finished.stdout, "world 3\n");
        }

        #[tokio::test]
        async fn test_fresh_empty_working_directory() {
            let script = "pwd\nls -A | wc -l | tr -d ' '";
            let first = run(&sh(), request(script), CancellationToken::new())
                .await
                .unwrap();
            let second = run(&sh(), request(script), CancellationToken::new())
                .await
                .unwrap();

            let first_lines: Vec<_> = first.stdout.lines().collect();
            let second_lines: Vec<_> = second.stdout.lines().collect();
            assert_eq!(first_lines[1], "0");
            assert_ne!(first_lines[0], second_lines[0]);
        }

        #[tokio::test]
        async fn test_host_environment_is_not_inherited() {
            let runner = sh().with_env_allowlist(vec!["PATH".to_string()]);
            let finished = run(&runner, request("echo \"${HOME:-unset}\""), CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(finished.stdout, "unset\n");
        }

        #[tokio::test]
        async fn test_background_descendants_do_not_outlive_run() {
            let finished = run(
                &sh(),
                request("sleep 30 >/dev/null 2>&1 &\necho $!"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
            assert!(finished.outcome.exited_cleanly());
            let pid: u32 = finished.stdout.trim().parse().unwrap();

            tokio::time::sleep(Duration::from_millis(300)).await;
            // Gone, or at most a zombie waiting for its new parent to reap it
            let alive = std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .map(|stat| {
                    let state = stat.rsplit(')').next().unwrap_or("").trim_start();
                    !state.starts_with('Z')
                })
                .unwrap_or(false);
            assert!(!alive, "background process {} survived the run", pid);
        }

        #[tokio::test]
        async fn test_descendant_holding_the_pipe_does_not_delay_completion() {
            let started = Instant::now();
            let finished = run(
                &sh(),
                request("echo before\n(sleep 30; echo never) &"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

            assert_eq!(finished.stdout, "before\n");
            assert!(started.elapsed() < OUTPUT_DRAIN_TIMEOUT, "took {:?}", started.elapsed());
        }

        #[tokio::test]
        async fn test_restricted_run_cannot_read_host_files() {
            let err = run(&sh(), restricted("head -1 /etc/passwd"), CancellationToken::new())
                .await
                .err();
            assert!(
                matches!(&err, Some(RunnerError::Denied(reason)) if reason.contains("/etc/passwd")),
                "{:?}",
                err
            );

            let err = run(&sh(), restricted("cat ../../etc/passwd"), CancellationToken::new())
                .await
                .err();
            assert!(matches!(err, Some(RunnerError::Denied(_))));
        }

        #[tokio::test]
        async fn test_restricted_run_has_no_native_commands() {
            if !bash_available() {
                return;
            }
            let finished = run(&sh(), restricted("head -1 passwd\nls"), CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(finished.outcome.exit_code, Some(127));
            assert!(finished.stdout.is_empty());
            assert!(finished.stderr.contains("not found"), "{}", finished.stderr);

            // Builtins keep working
            let finished = run(&sh(), restricted("echo ok"), CancellationToken::new())
                .await
                .unwrap();
            assert!(finished.outcome.exited_cleanly());
            assert_eq!(finished.stdout, "ok\n");
        }

        #[tokio::test]
        async fn test_cancel_interrupts_process() {
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let started = Instant::now();
            let finished = run(&sh(), request("sleep 10"), cancel).await.unwrap();

            assert_eq!(finished.outcome.completion_reason, CompletionReason::Interrupted);
            assert!(started.elapsed() < GRACE_WINDOW);
        }

        #[tokio::test]
        async fn test_ignored_sigterm_is_killed_after_grace_window() {
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let started = Instant::now();
            let finished = run(
                &sh(),
                request("trap '' TERM\nwhile true; do sleep 0.1; done"),
                cancel,
            )
            .await
            .unwrap();

            assert_eq!(finished.outcome.completion_reason, CompletionReason::Killed);
            assert!(started.elapsed() >= GRACE_WINDOW);
        }

        #[tokio::test]
        async fn test_spawn_failure() {
            let mut profile = InterpreterProfile::posix_shell(RuntimeVersion::new(1, 0, 0));
            profile.program = "definitely-not-an-interpreter".to_string();
            let result = run(
                &SubprocessRunner::new(profile),
                request("echo hi"),
                CancellationToken::new(),
            )
            .await;
            assert!(matches!(result, Err(RunnerError::SpawnFailed(_))));
        }

        #[tokio::test]
        async fn test_unsatisfied_runtime_is_rejected() {
            let mut req = request("echo hi");
            req.required_runtime_version = Some("2.0".to_string());
            let result = run(&sh(), req, CancellationToken::new()).await;
            assert!(matches!(result, Err(RunnerError::SpawnFailed(_))));
        }
    }
}
