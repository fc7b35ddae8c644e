// Process probe implementation
// reason: sysinfo for cross-platform per-process monitoring
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};
use tracing::trace;

use script_engine_core::domain::ResourceSample;
use script_engine_core::port::ProcessProbe;

/// Process probe implementation using sysinfo
///
/// CPU usage is measured between two refreshes of the same process, so the
/// first sample of a run reports 0%.
pub struct SysinfoProcessProbe {
    system: Arc<Mutex<System>>,
    host: String,
}

impl SysinfoProcessProbe {
    /// Create a new process probe
    ///
    /// # Example
    /// ```ignore
    /// let probe = SysinfoProcessProbe::new();
    /// ```
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            host: System::host_name().unwrap_or_else(|| "localhost".to_string()),
        }
    }
}

impl Default for SysinfoProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessProbe for SysinfoProcessProbe {
    async fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let pid = Pid::from_u32(pid);
        let mut sys = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !sys.refresh_process(pid) {
            return None;
        }
        let process = sys.process(pid)?;
        let sample = ResourceSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        };

        trace!(
            pid = %pid,
            memory_bytes = sample.memory_bytes,
            cpu = sample.cpu_percent,
            "Process sampled"
        );
        Some(sample)
    }

    fn host_identifier(&self) -> String {
        self.host.clone()
    }
}
