// Notifier Port
// Lifecycle callbacks to the (external) notification transport

use crate::domain::{ExecutionId, ExecutionStatus};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Lifecycle notifier
///
/// Best-effort and fire-and-forget from the engine's perspective: returned
/// errors (and panics) are logged and never affect execution state.
/// Implementations must not block; hand off to a channel or task instead.
pub trait Notifier: Send + Sync {
    fn on_status_changed(&self, _id: &str, _status: ExecutionStatus) -> Result<(), NotifyError> {
        Ok(())
    }

    fn on_progress(&self, _id: &str, _percent: u8, _message: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    fn on_completed(
        &self,
        _id: &str,
        _status: ExecutionStatus,
        _duration_ms: i64,
    ) -> Result<(), NotifyError> {
        Ok(())
    }

    fn on_output(&self, _id: &str, _chunk: &str, _is_error: bool) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Discards every notification
pub struct NoopNotifier;

impl Notifier for NoopNotifier {}

/// Lifecycle event as published by [`ChannelNotifier`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StatusChanged {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    Progress {
        execution_id: ExecutionId,
        percent: u8,
        message: String,
    },
    Completed {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: i64,
    },
    Output {
        execution_id: ExecutionId,
        chunk: String,
        is_error: bool,
    },
}

impl LifecycleEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            LifecycleEvent::StatusChanged { execution_id, .. }
            | LifecycleEvent::Progress { execution_id, .. }
            | LifecycleEvent::Completed { execution_id, .. }
            | LifecycleEvent::Output { execution_id, .. } => execution_id,
        }
    }
}

/// Push-based notifier backed by a broadcast channel
///
/// Subscribers that fall behind lose the oldest events (broadcast lag);
/// polling `get_status` stays the source of truth.
pub struct ChannelNotifier {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: LifecycleEvent) -> Result<(), NotifyError> {
        // No subscribers is not a failure
        let _ = self.tx.send(event);
        Ok(())
    }
}

impl Notifier for ChannelNotifier {
    fn on_status_changed(&self, id: &str, status: ExecutionStatus) -> Result<(), NotifyError> {
        self.publish(LifecycleEvent::StatusChanged {
            execution_id: id.to_string(),
            status,
        })
    }

    fn on_progress(&self, id: &str, percent: u8, message: &str) -> Result<(), NotifyError> {
        self.publish(LifecycleEvent::Progress {
            execution_id: id.to_string(),
            percent,
            message: message.to_string(),
        })
    }

    fn on_completed(
        &self,
        id: &str,
        status: ExecutionStatus,
        duration_ms: i64,
    ) -> Result<(), NotifyError> {
        self.publish(LifecycleEvent::Completed {
            execution_id: id.to_string(),
            status,
            duration_ms,
        })
    }

    fn on_output(&self, id: &str, chunk: &str, is_error: bool) -> Result<(), NotifyError> {
        self.publish(LifecycleEvent::Output {
            execution_id: id.to_string(),
            chunk: chunk.to_string(),
            is_error,
        })
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Records every event in order
    #[derive(Default)]
    pub struct RecordingNotifier {
        events: Mutex<Vec<LifecycleEvent>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<LifecycleEvent> {
            self.events.lock().unwrap().clone()
        }

        /// Status changes observed for one execution, in order
        pub fn statuses_for(&self, id: &str) -> Vec<ExecutionStatus> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    LifecycleEvent::StatusChanged {
                        execution_id,
                        status,
                    } if execution_id == id => Some(status),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, event: LifecycleEvent) -> Result<(), NotifyError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl Notifier for RecordingNotifier {
        fn on_status_changed(&self, id: &str, status: ExecutionStatus) -> Result<(), NotifyError> {
            self.record(LifecycleEvent::StatusChanged {
                execution_id: id.to_string(),
                status,
            })
        }

        fn on_progress(&self, id: &str, percent: u8, message: &str) -> Result<(), NotifyError> {
            self.record(LifecycleEvent::Progress {
                execution_id: id.to_string(),
                percent,
                message: message.to_string(),
            })
        }

        fn on_completed(
            &self,
            id: &str,
            status: ExecutionStatus,
            duration_ms: i64,
        ) -> Result<(), NotifyError> {
            self.record(LifecycleEvent::Completed {
                execution_id: id.to_string(),
                status,
                duration_ms,
            })
        }

        fn on_output(&self, id: &str, chunk: &str, is_error: bool) -> Result<(), NotifyError> {
            self.record(LifecycleEvent::Output {
                execution_id: id.to_string(),
                chunk: chunk.to_string(),
                is_error,
            })
        }
    }

    /// Fails every call: returns an error, or panics when `panics` is set
    pub struct FailingNotifier {
        pub panics: bool,
    }

    impl FailingNotifier {
        fn fail(&self) -> Result<(), NotifyError> {
            if self.panics {
                panic!("notifier exploded");
            }
            Err(NotifyError("transport down".to_string()))
        }
    }

    impl Notifier for FailingNotifier {
        fn on_status_changed(&self, _id: &str, _status: ExecutionStatus) -> Result<(), NotifyError> {
            self.fail()
        }

        fn on_progress(&self, _id: &str, _percent: u8, _message: &str) -> Result<(), NotifyError> {
            self.fail()
        }

        fn on_completed(
            &self,
            _id: &str,
            _status: ExecutionStatus,
            _duration_ms: i64,
        ) -> Result<(), NotifyError> {
            self.fail()
        }

        fn on_output(&self, _id: &str, _chunk: &str, _is_error: bool) -> Result<(), NotifyError> {
            self.fail()
        }
    }
}
