// Process resource monitoring port
use crate::domain::ResourceSample;
use async_trait::async_trait;

/// Process probe port for per-execution resource sampling
///
/// Used by the metrics collector while a run is in progress
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// Sample memory and CPU of one process
    ///
    /// # Returns
    /// None once the process is gone (or was never visible)
    ///
    /// # Example
    /// ```text
    /// if let Some(sample) = probe.sample(pid).await {
    ///     println!("rss={} cpu={}", sample.memory_bytes, sample.cpu_percent);
    /// }
    /// ```
    async fn sample(&self, pid: u32) -> Option<ResourceSample>;

    /// Identifier of the host running the scripts
    fn host_identifier(&self) -> String;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of samples, then repeats the last one
    pub struct MockProcessProbe {
        samples: Mutex<VecDeque<ResourceSample>>,
        last: Mutex<Option<ResourceSample>>,
    }

    impl MockProcessProbe {
        pub fn new(samples: Vec<ResourceSample>) -> Self {
            Self {
                samples: Mutex::new(samples.into()),
                last: Mutex::new(None),
            }
        }

        /// A probe that never sees any process
        pub fn empty() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl ProcessProbe for MockProcessProbe {
        async fn sample(&self, _pid: u32) -> Option<ResourceSample> {
            let next = self.samples.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if next.is_some() {
                *last = next;
            }
            *last
        }

        fn host_identifier(&self) -> String {
            "mock-host".to_string()
        }
    }
}
