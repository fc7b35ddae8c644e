// Engine configuration

use crate::application::constants::*;
use crate::application::validator::ValidationConfig;
use crate::domain::DEFAULT_SCRIPT_TIMEOUT;
use std::time::Duration;

/// Execution engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently running runner instances (pool size)
    pub max_concurrent_runs: usize,

    /// Pending executions allowed to wait for a pool slot; beyond it submit fails
    pub max_queue_depth: usize,

    /// Applied when a script definition carries a zero timeout
    pub default_timeout: Duration,

    /// Resource sampling period
    pub sample_interval: Duration,

    /// Grace given to an interrupted runner before the run is abandoned
    pub runner_ack_timeout: Duration,

    /// Age after which terminal executions are purged
    pub retention: Duration,

    /// Bound on draining in-flight runs at shutdown
    pub shutdown_timeout: Duration,

    pub validation: ValidationConfig,
}

impl EngineConfig {
    /// Effective timeout for a script
    pub fn timeout_for(&self, script_timeout: Duration) -> Duration {
        if script_timeout.is_zero() {
            self.default_timeout
        } else {
            script_timeout
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_CONCURRENCY);

        Self {
            max_concurrent_runs: parallelism,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            default_timeout: DEFAULT_SCRIPT_TIMEOUT,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            runner_ack_timeout: DEFAULT_RUNNER_ACK_TIMEOUT,
            retention: DEFAULT_RETENTION,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            validation: ValidationConfig::default(),
        }
    }
}
