// Dispatch - one supervised run per execution
//
// Each submission gets a supervisor task that waits for a pool slot, moves the
// execution to Running, drives the runner under the timeout watchdog in its
// own task (panic isolation), streams run events into metrics and the
// notifier, and finally writes the single terminal transition.

use super::EngineInner;
use crate::application::constants::{PROGRESS_FINISHED, PROGRESS_STARTED};
use crate::application::metrics_collector::MetricsCollector;
use crate::application::panic_guard::panic_message;
use crate::application::registry::{ExecutionHandle, MetricsSlot, Settlement, Transition};
use crate::domain::{ExecutionStatus, ScriptReference};
use crate::error::EngineError;
use crate::port::{RunEvent, RunEvents, RunOutcome, RunRequest, RunnerError, ScriptRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything a supervisor needs, captured at submission
pub(super) struct DispatchJob {
    pub request: RunRequest,
    pub script: ScriptReference,
    pub timeout: Duration,
    pub handle: Arc<ExecutionHandle>,
    /// Pool slot taken at submission; None when the execution was queued
    pub permit: Option<OwnedSemaphorePermit>,
}

/// How the driven run ended
enum DriveResult {
    /// Runner returned (normally or after acknowledging the interruption)
    Finished(Result<RunOutcome, RunnerError>),
    /// Runner ignored the interruption past the acknowledgement window
    Abandoned,
}

/// Captured run output, written to the execution at the terminal transition
#[derive(Default)]
struct Captured {
    stdout: String,
    stderr: String,
}

/// Supervise one execution from Pending to its terminal status
pub(super) async fn supervise(inner: Arc<EngineInner>, job: DispatchJob) {
    let id = job.request.execution_id.clone();
    let token = job.handle.token();

    // Waiting for a slot is the queue; cancellation while queued leaves it.
    let permit = match job.permit {
        Some(permit) => Some(permit),
        None => {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok(),
            };
            inner.leave_queue();
            permit
        }
    };

    let Some(_permit) = permit else {
        debug!(execution_id = %id, "Left the queue before dispatch");
        return;
    };

    let now = inner.time_provider.now_millis();
    let collector = Arc::new(MetricsCollector::new(
        id.clone(),
        now,
        inner.host_identifier(),
    ));
    let started = inner.registry.compare_and_transition(
        &id,
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        now,
        |entry| entry.metrics = MetricsSlot::Live(Arc::clone(&collector)),
    );
    match started {
        Ok(Transition::Applied(_)) => {}
        Ok(Transition::Lost(current)) => {
            debug!(execution_id = %id, status = %current.status, "Not dispatched");
            return;
        }
        Err(e) => {
            error!(execution_id = %id, error = %e, "Dispatch transition failed");
            return;
        }
    }

    let timeout = job.timeout;
    info!(
        execution_id = %id,
        script = %job.script,
        mode = %job.request.mode,
        timeout_ms = timeout.as_millis() as u64,
        "Execution started"
    );
    inner.notify_status(&id, ExecutionStatus::Running);
    inner.notify_progress(&id, PROGRESS_STARTED, "Execution started");

    // Drive the runner in its own task; panics surface through the JoinHandle
    let (events, mut rx) = RunEvents::channel();
    let mut run_task = tokio::spawn(drive(
        Arc::clone(&inner.runner),
        job.request,
        Arc::clone(&job.handle),
        events,
        timeout,
        inner.config.runner_ack_timeout,
    ));

    let mut captured = Captured::default();
    let mut sampler: Option<JoinHandle<()>> = None;
    let joined = loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => {
                on_event(&inner, &id, &collector, &mut captured, &mut sampler, event);
            }
            joined = &mut run_task => break joined,
        }
    };
    while let Ok(event) = rx.try_recv() {
        on_event(&inner, &id, &collector, &mut captured, &mut sampler, event);
    }
    if let Some(sampler) = sampler {
        sampler.abort();
    }

    let (outcome, fault) = match joined {
        Ok(DriveResult::Finished(Ok(outcome))) => (Some(outcome), None),
        Ok(DriveResult::Finished(Err(e))) => (None, Some(EngineError::RunnerFault(e.to_string()))),
        Ok(DriveResult::Abandoned) => (
            None,
            Some(EngineError::RunnerFault(format!(
                "no acknowledgement of the interruption within {} ms; run abandoned",
                inner.config.runner_ack_timeout.as_millis()
            ))),
        ),
        Err(join_err) if join_err.is_panic() => {
            let msg = panic_message(join_err.into_panic().as_ref());
            error!(execution_id = %id, panic_msg = %msg, "Runner panicked");
            (None, Some(EngineError::RunnerFault(format!("panicked: {}", msg))))
        }
        Err(join_err) => (
            None,
            Some(EngineError::RunnerFault(format!("run task aborted: {}", join_err))),
        ),
    };

    // Faults are recorded on the error stream
    if let Some(fault) = &fault {
        let line = format!("{}\n", fault);
        collector.record_output(line.len(), true);
        captured.stderr.push_str(&line);
    }

    // Completion claims last; an earlier Cancel/Timeout claim decides instead
    job.handle.claim(Settlement::Completion);
    let status = match job.handle.settlement().and_then(Settlement::interrupted_status) {
        Some(interrupted) => interrupted,
        None => match &outcome {
            Some(outcome) if outcome.exited_cleanly() && captured.stderr.trim().is_empty() => {
                ExecutionStatus::Succeeded
            }
            _ => ExecutionStatus::Failed,
        },
    };
    let exit_code = outcome.as_ref().and_then(|o| o.exit_code);

    let now = inner.time_provider.now_millis();
    let finished = inner.registry.compare_and_transition(
        &id,
        ExecutionStatus::Running,
        status,
        now,
        |entry| {
            entry.execution.exit_code = exit_code;
            entry.execution.append_output(&captured.stdout, false);
            entry.execution.append_output(&captured.stderr, true);
            entry.metrics = MetricsSlot::Final(collector.finish(now));
            // Recorded under the entry lock so estimates see every finished run
            if status == ExecutionStatus::Succeeded {
                if let Some(duration_ms) = entry.execution.duration_ms() {
                    inner.history.record(&job.script, duration_ms);
                }
            }
        },
    );

    let execution = match finished {
        Ok(Transition::Applied(execution)) => execution,
        Ok(Transition::Lost(current)) => {
            error!(
                execution_id = %id,
                status = %current.status,
                "Terminal transition lost; execution already settled"
            );
            return;
        }
        Err(e) => {
            // Purged while running is impossible (remove refuses live entries)
            error!(execution_id = %id, error = %e, "Terminal transition failed");
            return;
        }
    };

    let duration_ms = execution.duration_ms().unwrap_or(0);

    match status {
        ExecutionStatus::Succeeded => {
            info!(execution_id = %id, status = %status, duration_ms, "Execution finished")
        }
        _ => warn!(
            execution_id = %id,
            status = %status,
            duration_ms,
            exit_code = ?exit_code,
            fault = ?fault.as_ref().map(ToString::to_string),
            "Execution finished"
        ),
    }

    inner.notify_status(&id, status);
    inner.notify_progress(&id, PROGRESS_FINISHED, "Execution finished");
    inner.notify_completed(&id, status, duration_ms);
}

fn on_event(
    inner: &Arc<EngineInner>,
    id: &str,
    collector: &Arc<MetricsCollector>,
    captured: &mut Captured,
    sampler: &mut Option<JoinHandle<()>>,
    event: RunEvent,
) {
    match event {
        RunEvent::Started {
            pid,
            runtime_version,
        } => {
            debug!(execution_id = %id, pid = ?pid, runtime_version = ?runtime_version, "Runner started");
            if let Some(version) = runtime_version {
                collector.set_runtime_version(version);
            }
            if let (Some(pid), Some(probe)) = (pid, inner.probe.as_ref()) {
                if sampler.is_none() {
                    *sampler = Some(MetricsCollector::spawn_sampler(
                        Arc::clone(collector),
                        Arc::clone(probe),
                        pid,
                        inner.config.sample_interval,
                    ));
                }
            }
        }
        RunEvent::Output { chunk, is_error } => {
            collector.record_output(chunk.len(), is_error);
            if is_error {
                captured.stderr.push_str(&chunk);
            } else {
                captured.stdout.push_str(&chunk);
            }
            inner.notify_output(id, &chunk, is_error);
        }
        RunEvent::Command => collector.record_command(),
    }
}

/// Run the script under the timeout watchdog
///
/// Normal completion is polled first, so a run that finishes at the same
/// instant the timeout fires is not timed out. After an interruption the
/// runner gets `ack_timeout` to return; otherwise the run future is dropped,
/// which kills the isolated process.
async fn drive(
    runner: Arc<dyn ScriptRunner>,
    request: RunRequest,
    handle: Arc<ExecutionHandle>,
    events: RunEvents,
    timeout: Duration,
    ack_timeout: Duration,
) -> DriveResult {
    let id = request.execution_id.clone();
    let token = handle.token();
    let run = runner.run(request, token.clone(), events);
    tokio::pin!(run);

    tokio::select! {
        biased;
        result = &mut run => return DriveResult::Finished(result),
        _ = tokio::time::sleep(timeout) => {
            if handle.claim(Settlement::Timeout) {
                warn!(execution_id = %id, timeout_ms = timeout.as_millis() as u64, "Execution timed out");
            }
            handle.signal();
        }
        _ = token.cancelled() => {
            debug!(execution_id = %id, "Interruption requested");
        }
    }

    match tokio::time::timeout(ack_timeout, &mut run).await {
        Ok(result) => DriveResult::Finished(result),
        Err(_) => {
            error!(
                execution_id = %id,
                ack_timeout_ms = ack_timeout.as_millis() as u64,
                "Runner unresponsive after interruption; abandoning run"
            );
            DriveResult::Abandoned
        }
    }
}
