// Engine constants (No magic values)
use std::time::Duration;

/// Resource sampling interval while a run is in progress (250ms)
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Maximum number of Pending executions waiting for a pool slot
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 256;

/// Pool size when host parallelism cannot be determined
pub const FALLBACK_CONCURRENCY: usize = 4;

/// How long an interrupted runner gets to return before it is abandoned (5s)
/// Must exceed the runner's own SIGTERM -> SIGKILL grace window.
pub const DEFAULT_RUNNER_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal executions older than this are purged by the retention sweeper (1 hour)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Retention sweep period (1 minute)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on waiting for in-flight runs during shutdown (10s)
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll period of `wait_for_terminal` (50ms)
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Host identifier reported when no process probe is configured
pub const UNKNOWN_HOST: &str = "unknown";

/// Progress reported at dispatch and at completion
pub const PROGRESS_STARTED: u8 = 0;
pub const PROGRESS_FINISHED: u8 = 100;
