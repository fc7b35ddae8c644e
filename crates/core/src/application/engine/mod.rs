// Execution Engine
// Public contract: submit, get_status, cancel, list_running, validate, get_metrics
//
// Composes the validator, the registry, the runner and the metrics collector.
// Owns the cancellation/timeout policy and the bounded worker pool.

mod dispatch;

use crate::application::config::EngineConfig;
use crate::application::constants::{UNKNOWN_HOST, WAIT_POLL_INTERVAL};
use crate::application::history::DurationHistory;
use crate::application::panic_guard::{execute_guarded, PanicGuardResult};
use crate::application::registry::{ExecutionRegistry, Settlement, Transition};
use crate::application::validator::ScriptValidator;
use crate::domain::{
    CapabilityMode, Execution, ExecutionId, ExecutionMetrics, ExecutionStatus,
    ExecutionValidationResult, Parameters, ScriptDefinition, ScriptRef, ScriptReference,
};
use crate::error::{EngineError, Result};
use crate::port::id_provider::UuidProvider;
use crate::port::time_provider::SystemTimeProvider;
use crate::port::{
    IdProvider, NoopNotifier, Notifier, NotifyError, ProcessProbe, RunRequest, ScriptRunner,
    ScriptSource, ScriptSourceError, TimeProvider,
};
use dispatch::DispatchJob;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Submission request
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub script: ScriptRef,
    pub parameters: Parameters,
    /// Caller identity, recorded for audit only
    pub triggered_by: String,
    pub mode: CapabilityMode,
}

impl SubmitRequest {
    pub fn new(script: ScriptRef, triggered_by: impl Into<String>) -> Self {
        Self {
            script,
            parameters: Parameters::new(),
            triggered_by: triggered_by.into(),
            mode: CapabilityMode::Full,
        }
    }

    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_mode(mut self, mode: CapabilityMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Builder for [`ExecutionEngine`]
pub struct ExecutionEngineBuilder {
    config: EngineConfig,
    runner: Arc<dyn ScriptRunner>,
    source: Arc<dyn ScriptSource>,
    notifier: Arc<dyn Notifier>,
    probe: Option<Arc<dyn ProcessProbe>>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl ExecutionEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Without a probe, runs are not sampled (peak memory and CPU stay zero)
    pub fn probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn id_provider(mut self, id_provider: Arc<dyn IdProvider>) -> Self {
        self.id_provider = id_provider;
        self
    }

    pub fn time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn build(self) -> ExecutionEngine {
        let validator = ScriptValidator::new(
            self.config.validation.clone(),
            self.runner.available_runtimes(),
        );
        let host_identifier = self
            .probe
            .as_ref()
            .map(|probe| probe.host_identifier())
            .unwrap_or_else(|| UNKNOWN_HOST.to_string());
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_runs.max(1)));

        info!(
            max_concurrent_runs = self.config.max_concurrent_runs,
            max_queue_depth = self.config.max_queue_depth,
            host = %host_identifier,
            runtimes = ?validator.host_runtimes(),
            "Execution engine ready"
        );

        ExecutionEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                registry: ExecutionRegistry::new(),
                validator,
                runner: self.runner,
                source: self.source,
                notifier: self.notifier,
                probe: self.probe,
                id_provider: self.id_provider,
                time_provider: self.time_provider,
                host_identifier,
                permits,
                queued: AtomicUsize::new(0),
                history: DurationHistory::new(),
                accepting: AtomicBool::new(true),
                tasks: TaskTracker::new(),
            }),
        }
    }
}

/// Execution Engine
///
/// Cheap to clone; clones share the same registry and pool.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    registry: ExecutionRegistry,
    validator: ScriptValidator,
    runner: Arc<dyn ScriptRunner>,
    source: Arc<dyn ScriptSource>,
    notifier: Arc<dyn Notifier>,
    probe: Option<Arc<dyn ProcessProbe>>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    host_identifier: String,
    permits: Arc<Semaphore>,
    /// Pending executions not yet holding a pool slot
    queued: AtomicUsize,
    history: DurationHistory,
    accepting: AtomicBool,
    tasks: TaskTracker,
}

impl ExecutionEngine {
    /// Start building an engine around a runner and a script source
    pub fn builder(
        runner: Arc<dyn ScriptRunner>,
        source: Arc<dyn ScriptSource>,
    ) -> ExecutionEngineBuilder {
        ExecutionEngineBuilder {
            config: EngineConfig::default(),
            runner,
            source,
            notifier: Arc::new(NoopNotifier),
            probe: None,
            id_provider: Arc::new(UuidProvider),
            time_provider: Arc::new(SystemTimeProvider),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Submit a script for asynchronous execution
    ///
    /// Resolves and validates synchronously, records the execution as
    /// Pending and returns its id without waiting for the run.
    ///
    /// # Errors
    /// - EngineError::InvalidScriptReference if the script cannot be resolved
    /// - EngineError::ValidationFailed if validation reports errors (nothing is recorded)
    /// - EngineError::EngineSaturated if every pool slot is busy and the queue is full
    /// - EngineError::ShuttingDown after `shutdown`
    pub async fn submit(&self, request: SubmitRequest) -> Result<ExecutionId> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        let (definition, script) = inner.resolve(&request.script).await?;
        let validation =
            inner.validate_definition(&definition, &request.parameters, &script, request.mode);
        if !validation.is_valid {
            warn!(
                script = %script,
                errors = ?validation.errors,
                "Submission rejected by validation"
            );
            return Err(EngineError::ValidationFailed(Box::new(validation)));
        }

        // A free slot is taken now; only submissions that must wait count against the queue
        let permit = Arc::clone(&inner.permits).try_acquire_owned().ok();
        let queued = permit.is_none();
        if queued {
            inner.enter_queue()?;
        }

        let id = inner.id_provider.generate_id();
        let execution = Execution::new(
            id.clone(),
            inner.time_provider.now_millis(),
            script.clone(),
            request.parameters.clone(),
            request.triggered_by.clone(),
            request.mode,
        );
        let handle = match inner.registry.insert(execution) {
            Ok(handle) => handle,
            Err(e) => {
                if queued {
                    inner.leave_queue();
                }
                return Err(e);
            }
        };

        info!(
            execution_id = %id,
            script = %script,
            triggered_by = %request.triggered_by,
            mode = %request.mode,
            risk = %validation.security_risk_level,
            queued,
            "Execution submitted"
        );
        inner.notify_status(&id, ExecutionStatus::Pending);

        let job = DispatchJob {
            request: RunRequest {
                execution_id: id.clone(),
                content: definition.content,
                parameters: request.parameters,
                mode: request.mode,
                required_runtime_version: definition.required_runtime_version,
            },
            script,
            timeout: inner.config.timeout_for(definition.timeout),
            handle,
            permit,
        };
        inner.tasks.spawn(dispatch::supervise(Arc::clone(inner), job));

        // Lost a race with shutdown: do not leave the run behind
        if !inner.accepting.load(Ordering::Acquire) {
            let _ = self.cancel(&id);
        }
        Ok(id)
    }

    /// Snapshot of one execution
    ///
    /// # Errors
    /// - EngineError::NotFound for unknown or purged ids
    pub fn get_status(&self, id: &str) -> Result<Execution> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Request cancellation
    ///
    /// A Pending execution becomes Cancelled immediately. A Running execution
    /// is signalled and becomes Cancelled once the runner acknowledges (or is
    /// abandoned). Returns false when the execution is already terminal or its
    /// outcome is already settled.
    ///
    /// # Errors
    /// - EngineError::NotFound for unknown ids
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let inner = &self.inner;
        loop {
            let current = self.get_status(id)?;
            match current.status {
                ExecutionStatus::Pending => {
                    let now = inner.time_provider.now_millis();
                    let transition = inner.registry.compare_and_transition(
                        id,
                        ExecutionStatus::Pending,
                        ExecutionStatus::Cancelled,
                        now,
                        |_| {},
                    )?;
                    if let Transition::Applied(_) = transition {
                        if let Some(handle) = inner.registry.handle(id) {
                            handle.claim(Settlement::Cancel);
                            handle.signal();
                        }
                        info!(execution_id = %id, "Execution cancelled before dispatch");
                        inner.notify_status(id, ExecutionStatus::Cancelled);
                        inner.notify_completed(id, ExecutionStatus::Cancelled, 0);
                        return Ok(true);
                    }
                    // Dispatched meanwhile: retry against the new state
                }
                ExecutionStatus::Running => {
                    let handle = inner
                        .registry
                        .handle(id)
                        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
                    if !handle.claim(Settlement::Cancel) {
                        debug!(
                            execution_id = %id,
                            settlement = ?handle.settlement(),
                            "Cancel ignored; outcome already settled"
                        );
                        return Ok(false);
                    }
                    handle.signal();
                    info!(execution_id = %id, "Cancellation signalled");
                    return Ok(true);
                }
                _ => return Ok(false),
            }
        }
    }

    /// Snapshot of every non-terminal execution
    pub fn list_running(&self) -> Vec<Execution> {
        self.inner.registry.snapshot_all(|e| !e.is_terminal())
    }

    /// Preview what `submit` would decide for a full-capability run, without side effects
    ///
    /// # Errors
    /// - EngineError::InvalidScriptReference if the script cannot be resolved
    pub async fn validate(
        &self,
        script: &ScriptRef,
        parameters: &Parameters,
    ) -> Result<ExecutionValidationResult> {
        self.validate_for_mode(script, parameters, CapabilityMode::Full).await
    }

    /// Same as [`validate`](Self::validate) for a run in the given capability mode
    ///
    /// # Errors
    /// - EngineError::InvalidScriptReference if the script cannot be resolved
    pub async fn validate_for_mode(
        &self,
        script: &ScriptRef,
        parameters: &Parameters,
        mode: CapabilityMode,
    ) -> Result<ExecutionValidationResult> {
        let (definition, reference) = self.inner.resolve(script).await?;
        Ok(self
            .inner
            .validate_definition(&definition, parameters, &reference, mode))
    }

    /// Metrics: None before the run starts, a live snapshot while running,
    /// the final summary once terminal
    ///
    /// # Errors
    /// - EngineError::NotFound for unknown ids
    pub fn get_metrics(&self, id: &str) -> Result<Option<ExecutionMetrics>> {
        self.inner.registry.metrics(id)
    }

    /// Remove a terminal execution after its result was retrieved
    ///
    /// # Errors
    /// - EngineError::InvalidState while the execution is Pending/Running
    /// - EngineError::NotFound for unknown ids
    pub fn purge(&self, id: &str) -> Result<Execution> {
        let removed = self.inner.registry.remove(id)?;
        debug!(execution_id = %id, "Execution purged");
        Ok(removed)
    }

    /// Purge terminal executions older than the retention window
    pub fn purge_expired(&self) -> usize {
        let retention_ms = i64::try_from(self.inner.config.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self
            .inner
            .time_provider
            .now_millis()
            .saturating_sub(retention_ms);
        self.inner.registry.purge_terminal_before(cutoff)
    }

    /// Poll until the execution is terminal or `timeout` elapses
    ///
    /// # Returns
    /// The last snapshot (check `is_terminal()` to tell the two apart)
    pub async fn wait_for_terminal(&self, id: &str, timeout: Duration) -> Result<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let execution = self.get_status(id)?;
            let now = tokio::time::Instant::now();
            if execution.is_terminal() || now >= deadline {
                return Ok(execution);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Stop accepting submissions, cancel every live execution and wait
    /// (bounded by `shutdown_timeout`) for in-flight runs to finish
    ///
    /// # Returns
    /// Number of executions that were signalled
    pub async fn shutdown(&self) -> usize {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::Release);

        let signalled = self
            .list_running()
            .iter()
            .filter(|execution| matches!(self.cancel(&execution.id), Ok(true)))
            .count();

        inner.tasks.close();
        if tokio::time::timeout(inner.config.shutdown_timeout, inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = inner.tasks.len(),
                "Shutdown timed out waiting for in-flight runs"
            );
        }

        info!(signalled, "Execution engine shut down");
        signalled
    }
}

impl EngineInner {
    async fn resolve(&self, script: &ScriptRef) -> Result<(ScriptDefinition, ScriptReference)> {
        match script {
            ScriptRef::Id(id) => {
                if id.trim().is_empty() {
                    return Err(EngineError::InvalidScriptReference(
                        "script id is empty".to_string(),
                    ));
                }
                match self.source.resolve(id).await {
                    Ok(definition) => Ok((definition, ScriptReference::Id(id.clone()))),
                    Err(ScriptSourceError::NotFound(_)) => Err(
                        EngineError::InvalidScriptReference(format!("unknown script '{}'", id)),
                    ),
                    Err(ScriptSourceError::Invalid { reason, .. }) => Err(
                        EngineError::InvalidScriptReference(format!("script '{}': {}", id, reason)),
                    ),
                    Err(e) => Err(e.into()),
                }
            }
            ScriptRef::Inline(definition) => Ok((
                definition.clone(),
                ScriptReference::for_content(&definition.content),
            )),
        }
    }

    fn validate_definition(
        &self,
        definition: &ScriptDefinition,
        parameters: &Parameters,
        script: &ScriptReference,
        mode: CapabilityMode,
    ) -> ExecutionValidationResult {
        let mut result = self.validator.validate_for_mode(definition, parameters, mode);
        result.estimated_duration_secs = self.history.mean_secs(script);
        result
    }

    fn enter_queue(&self) -> Result<()> {
        let limit = self.config.max_queue_depth;
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < limit).then_some(queued + 1)
            })
            .map(|_| ())
            .map_err(|queued| {
                warn!(queued, limit, "Submission rejected: queue full");
                EngineError::EngineSaturated { queued, limit }
            })
    }

    fn leave_queue(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    fn host_identifier(&self) -> String {
        self.host_identifier.clone()
    }

    // Notifier calls are best effort: errors and panics are logged, never propagated

    fn notify<F>(&self, id: &str, callback: &'static str, call: F)
    where
        F: FnOnce(&dyn Notifier) -> std::result::Result<(), NotifyError>,
    {
        let notifier = self.notifier.as_ref();
        match execute_guarded(AssertUnwindSafe(|| call(notifier))) {
            PanicGuardResult::Success(Ok(())) => {}
            PanicGuardResult::Success(Err(e)) => {
                warn!(execution_id = %id, callback, error = %e, "Notifier callback failed")
            }
            PanicGuardResult::Panicked(msg) => {
                warn!(execution_id = %id, callback, panic_msg = %msg, "Notifier callback panicked")
            }
        }
    }

    fn notify_status(&self, id: &str, status: ExecutionStatus) {
        self.notify(id, "on_status_changed", |n| n.on_status_changed(id, status));
    }

    fn notify_progress(&self, id: &str, percent: u8, message: &str) {
        self.notify(id, "on_progress", |n| n.on_progress(id, percent, message));
    }

    fn notify_completed(&self, id: &str, status: ExecutionStatus, duration_ms: i64) {
        self.notify(id, "on_completed", |n| n.on_completed(id, status, duration_ms));
    }

    fn notify_output(&self, id: &str, chunk: &str, is_error: bool) {
        self.notify(id, "on_output", |n| n.on_output(id, chunk, is_error));
    }
}
