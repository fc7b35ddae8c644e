// Metrics Collector
// Live per-execution accumulator plus the resource sampling loop

use crate::domain::{ExecutionId, ExecutionMetrics, ResourceSample};
use crate::port::ProcessProbe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// CPU percentages are accumulated in hundredths of a percent
const CPU_SCALE: f64 = 100.0;

/// Lock-free accumulator for one running execution
///
/// Shared between the dispatch task (output and command events) and the
/// sampler task; read concurrently by `get_metrics`.
#[derive(Debug)]
pub struct MetricsCollector {
    execution_id: ExecutionId,
    start_time: i64,
    started: Instant,
    host_identifier: String,
    runtime_version: OnceLock<String>,

    peak_memory_bytes: AtomicU64,
    cpu_sum: AtomicU64,
    sample_count: AtomicU64,
    command_count: AtomicU64,
    output_bytes: AtomicU64,
    error_output_bytes: AtomicU64,
}

impl MetricsCollector {
    /// Attach a collector at dispatch
    ///
    /// # Arguments
    /// * `execution_id` - Execution being measured
    /// * `start_time` - Dispatch timestamp in epoch ms
    /// * `host_identifier` - Host running the script
    pub fn new(execution_id: impl Into<String>, start_time: i64, host_identifier: String) -> Self {
        Self {
            execution_id: execution_id.into(),
            start_time,
            started: Instant::now(),
            host_identifier,
            runtime_version: OnceLock::new(),
            peak_memory_bytes: AtomicU64::new(0),
            cpu_sum: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
            command_count: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
            error_output_bytes: AtomicU64::new(0),
        }
    }

    pub fn record_sample(&self, sample: ResourceSample) {
        self.peak_memory_bytes
            .fetch_max(sample.memory_bytes, Ordering::Relaxed);
        let cpu = (f64::from(sample.cpu_percent.max(0.0)) * CPU_SCALE).round() as u64;
        self.cpu_sum.fetch_add(cpu, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.command_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_output(&self, bytes: usize, is_error: bool) {
        let counter = if is_error {
            &self.error_output_bytes
        } else {
            &self.output_bytes
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// First reported version wins
    pub fn set_runtime_version(&self, version: String) {
        let _ = self.runtime_version.set(version);
    }

    /// Provisional view while running (`end_time` is None)
    pub fn snapshot(&self) -> ExecutionMetrics {
        self.build(None)
    }

    /// Final summary, produced once inside the terminal transition
    pub fn finish(&self, end_time: i64) -> ExecutionMetrics {
        self.build(Some(end_time))
    }

    fn build(&self, end_time: Option<i64>) -> ExecutionMetrics {
        let samples = self.sample_count.load(Ordering::Relaxed);
        let average_cpu_percent = if samples == 0 {
            0.0
        } else {
            self.cpu_sum.load(Ordering::Relaxed) as f64 / CPU_SCALE / samples as f64
        };

        ExecutionMetrics {
            execution_id: self.execution_id.clone(),
            start_time: self.start_time,
            end_time,
            duration: self.started.elapsed(),
            peak_memory_bytes: self.peak_memory_bytes.load(Ordering::Relaxed),
            average_cpu_percent,
            sample_count: samples,
            command_count: self.command_count.load(Ordering::Relaxed),
            output_size_bytes: self.output_bytes.load(Ordering::Relaxed),
            error_output_size_bytes: self.error_output_bytes.load(Ordering::Relaxed),
            runtime_version: self.runtime_version.get().cloned(),
            host_identifier: self.host_identifier.clone(),
        }
    }

    /// Sample `pid` every `period` until the process disappears or the task is aborted
    ///
    /// Should be aborted by the caller once the run returns.
    pub fn spawn_sampler(
        collector: Arc<Self>,
        probe: Arc<dyn ProcessProbe>,
        pid: u32,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                match probe.sample(pid).await {
                    Some(sample) => collector.record_sample(sample),
                    None => {
                        debug!(
                            execution_id = %collector.execution_id,
                            pid,
                            "Process no longer visible, sampler stopped"
                        );
                        break;
                    }
                }
            }
        })
    }
}
