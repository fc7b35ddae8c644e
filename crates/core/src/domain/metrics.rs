// Execution Metrics Domain Model

use crate::domain::ExecutionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One resource sample of a running process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Per-execution performance summary
///
/// Final once `end_time` is set (written at the terminal transition);
/// snapshots taken while running carry `end_time: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub execution_id: ExecutionId,
    pub start_time: i64, // epoch ms
    pub end_time: Option<i64>,
    pub duration: Duration,
    pub peak_memory_bytes: u64,
    pub average_cpu_percent: f64,
    pub sample_count: u64,
    pub command_count: u64,
    pub output_size_bytes: u64,
    pub error_output_size_bytes: u64,
    pub runtime_version: Option<String>,
    pub host_identifier: String,
}

impl ExecutionMetrics {
    pub fn is_final(&self) -> bool {
        self.end_time.is_some()
    }
}
