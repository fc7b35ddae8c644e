// Execution Registry
// The only shared mutable structure of the engine:
// execution id -> {execution, cancellation handle, metrics slot}
//
// Sharded map with per-entry locking (DashMap). Every state change goes
// through `compare_and_transition`, so transitions of one id are totally
// ordered and exactly one writer wins each edge.

use crate::application::metrics_collector::MetricsCollector;
use crate::domain::{DomainError, Execution, ExecutionId, ExecutionMetrics, ExecutionStatus};
use crate::error::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const UNSETTLED: u8 = 0;

/// Who settled a run first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Settlement {
    Cancel = 1,
    Timeout = 2,
    Completion = 3,
}

impl Settlement {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Settlement::Cancel),
            2 => Some(Settlement::Timeout),
            3 => Some(Settlement::Completion),
            _ => None,
        }
    }

    /// Terminal status for interruption settlements (Completion depends on the outcome)
    pub fn interrupted_status(self) -> Option<ExecutionStatus> {
        match self {
            Settlement::Cancel => Some(ExecutionStatus::Cancelled),
            Settlement::Timeout => Some(ExecutionStatus::TimedOut),
            Settlement::Completion => None,
        }
    }
}

/// Cancellation handle of one execution
///
/// Explicit cancel and the timeout watchdog signal the same token; the
/// settlement claim records which of them (or normal completion) got there first.
#[derive(Debug, Default)]
pub struct ExecutionHandle {
    token: CancellationToken,
    claim: AtomicU8,
}

impl ExecutionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Try to settle the run; true only for the first claimant
    pub fn claim(&self, settlement: Settlement) -> bool {
        self.claim
            .compare_exchange(
                UNSETTLED,
                settlement as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn settlement(&self) -> Option<Settlement> {
        Settlement::from_u8(self.claim.load(Ordering::Acquire))
    }

    /// Deliver the interruption signal to the runner
    pub fn signal(&self) {
        self.token.cancel();
    }
}

/// Metrics attached to an execution
#[derive(Debug, Default)]
pub enum MetricsSlot {
    /// Not dispatched yet
    #[default]
    Empty,
    /// Running: provisional snapshots
    Live(Arc<MetricsCollector>),
    /// Written once at the terminal transition
    Final(ExecutionMetrics),
}

impl MetricsSlot {
    pub fn view(&self) -> Option<ExecutionMetrics> {
        match self {
            MetricsSlot::Empty => None,
            MetricsSlot::Live(collector) => Some(collector.snapshot()),
            MetricsSlot::Final(metrics) => Some(metrics.clone()),
        }
    }
}

/// One registry entry
#[derive(Debug)]
pub struct RegistryEntry {
    pub execution: Execution,
    pub handle: Arc<ExecutionHandle>,
    pub metrics: MetricsSlot,
}

/// Outcome of a compare-and-transition
#[derive(Debug, Clone)]
pub enum Transition {
    /// This caller won; execution as written
    Applied(Execution),
    /// Another writer got there first; current state, nothing mutated
    Lost(Execution),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn execution(&self) -> &Execution {
        match self {
            Transition::Applied(execution) | Transition::Lost(execution) => execution,
        }
    }
}

/// Execution Registry
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    entries: DashMap<ExecutionId, RegistryEntry>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new execution and allocate its cancellation handle
    ///
    /// # Errors
    /// - EngineError::InvalidState if the id is already tracked
    pub fn insert(&self, execution: Execution) -> Result<Arc<ExecutionHandle>> {
        match self.entries.entry(execution.id.clone()) {
            Entry::Occupied(existing) => Err(EngineError::InvalidState {
                id: execution.id,
                status: existing.get().execution.status,
            }),
            Entry::Vacant(slot) => {
                let handle = Arc::new(ExecutionHandle::new());
                slot.insert(RegistryEntry {
                    execution,
                    handle: Arc::clone(&handle),
                    metrics: MetricsSlot::Empty,
                });
                Ok(handle)
            }
        }
    }

    /// Snapshot of one execution
    pub fn get(&self, id: &str) -> Option<Execution> {
        self.entries.get(id).map(|entry| entry.execution.clone())
    }

    pub fn handle(&self, id: &str) -> Option<Arc<ExecutionHandle>> {
        self.entries.get(id).map(|entry| Arc::clone(&entry.handle))
    }

    /// Metrics view: None before dispatch, live while running, final afterwards
    ///
    /// # Errors
    /// - EngineError::NotFound for unknown ids
    pub fn metrics(&self, id: &str) -> Result<Option<ExecutionMetrics>> {
        self.entries
            .get(id)
            .map(|entry| entry.metrics.view())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Atomically move `id` from `from` to `to`
    ///
    /// Stamps timestamps, then runs `mutator` under the entry lock. The
    /// mutator runs only when this caller wins; it must not block.
    ///
    /// # Errors
    /// - EngineError::Domain if `from -> to` is not an edge of the state machine
    /// - EngineError::NotFound for unknown ids
    pub fn compare_and_transition<F>(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        now_millis: i64,
        mutator: F,
    ) -> Result<Transition>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        if !from.can_transition_to(to) {
            return Err(DomainError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if entry.execution.status != from {
            return Ok(Transition::Lost(entry.execution.clone()));
        }

        entry.execution.transition(to, now_millis)?;
        mutator(entry.value_mut());
        Ok(Transition::Applied(entry.execution.clone()))
    }

    /// Remove a terminal execution
    ///
    /// # Errors
    /// - EngineError::InvalidState if the execution is still Pending/Running
    /// - EngineError::NotFound for unknown ids
    pub fn remove(&self, id: &str) -> Result<Execution> {
        if let Some((_, entry)) = self
            .entries
            .remove_if(id, |_, entry| entry.execution.is_terminal())
        {
            return Ok(entry.execution);
        }

        match self.get(id) {
            Some(execution) => Err(EngineError::InvalidState {
                id: execution.id,
                status: execution.status,
            }),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    /// Point-in-time copy of every execution matching `predicate`, oldest first
    pub fn snapshot_all<P>(&self, predicate: P) -> Vec<Execution>
    where
        P: Fn(&Execution) -> bool,
    {
        let mut executions: Vec<Execution> = self
            .entries
            .iter()
            .filter(|entry| predicate(&entry.execution))
            .map(|entry| entry.execution.clone())
            .collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        executions
    }

    /// Drop terminal executions completed before `cutoff_millis`
    ///
    /// # Returns
    /// Number of executions removed
    pub fn purge_terminal_before(&self, cutoff_millis: i64) -> usize {
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.execution.is_terminal()
                && entry
                    .execution
                    .completed_at
                    .is_some_and(|completed| completed < cutoff_millis);
            if expired {
                purged += 1;
            }
            !expired
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CapabilityMode, Parameters, ScriptReference};
    use ExecutionStatus::*;

    fn execution(id: &str, created_at: i64) -> Execution {
        Execution::new(
            id,
            created_at,
            ScriptReference::Id("hello".to_string()),
            Parameters::new(),
            "tester",
            CapabilityMode::Full,
        )
    }

    #[test]
    fn test_insert_and_get() {
        let registry = ExecutionRegistry::new();
        registry.insert(execution("a", 1)).unwrap();

        let snapshot = registry.get("a").unwrap();
        assert_eq!(snapshot.status, Pending);
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let registry = ExecutionRegistry::new();
        registry.insert(execution("a", 1)).unwrap();
        let err = registry.insert(execution("a", 2)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { status: Pending, .. }));
    }

    #[test]
    fn test_transition_stamps_and_mutates() {
        let registry = ExecutionRegistry::new();
        registry.insert(execution("a", 1)).unwrap();

        let started = registry
            .compare_and_transition("a", Pending, Running, 10, |_| {})
            .unwrap();
        assert!(started.is_applied());
        assert_eq!(started.execution().started_at, Some(10));

        let done = registry
            .compare_and_transition("a", Running, Succeeded, 25, |entry| {
                entry.execution.exit_code = Some(0);
                entry.execution.append_output("1\n", false);
            })
            .unwrap();
        let execution = done.execution();
        assert_eq!(execution.status, Succeeded);
        assert_eq!(execution.completed_at, Some(25));
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.output, "1\n");
    }

    #[test]
    fn test_loser_gets_current_state_and_mutates_nothing() {
        let registry = ExecutionRegistry::new();
        registry.insert(execution("a", 1)).unwrap();
        registry
            .compare_and_transition("a", Pending, Cancelled, 5, |_| {})
            .unwrap();

        let mut ran = false;
        let lost = registry
            .compare_and_transition("a", Pending, Running, 6, |_| ran = true)
            .unwrap();
        assert!(!lost.is_applied());
        assert!(!ran);
        assert_eq!(lost.execution().status, Cancelled);
        assert_eq!(lost.execution().started_at, None);
    }

    #[test]
    fn test_invalid_edge_and_unknown_id() {
        let registry = ExecutionRegistry::new();
        registry.insert(execution("a", 1)).unwrap();

        let err = registry
            .compare_and_transition("a", Pending, Succeeded, 5, |_| {})
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(_)));

        let err = registry
            .compare_and_transition("nope", Pending, Running, 5, |_| {})
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_remove_only_terminal() {
        let registry = ExecutionRegistry::new();
        registry.insert(execution("a", 1)).unwrap();

        assert!(matches!(
            registry.remove("a"),
            Err(EngineError::InvalidState { status: Pending, .. })
        ));
        registry
            .compare_and_transition("a", Pending, Cancelled, 5, |_| {})
            .unwrap();
        assert_eq!(registry.remove("a").unwrap().status, Cancelled);
        assert!(matches!(registry.remove("a"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_snapshot_all_ordered_by_creation() {
        let registry = ExecutionRegistry::new();
        registry.insert(execution("late", 30)).unwrap();
        registry.insert(execution("early", 10)).unwrap();
        registry.insert(execution("done", 20)).unwrap();
        registry
            .compare_and_transition("done", Pending, Cancelled, 25, |_| {})
            .unwrap();

        let live = registry.snapshot_all(|e| !e.is_terminal());
        let ids: Vec<_> = live.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_purge_terminal_before_cutoff() {
        let registry = ExecutionRegistry::new();
        for (id, completed) in [("old", 100), ("new", 900)] {
            registry.insert(execution(id, 1)).unwrap();
            registry
                .compare_and_transition(id, Pending, Cancelled, completed, |_| {})
                .unwrap();
        }
        registry.insert(execution("live", 1)).unwrap();

        assert_eq!(registry.purge_terminal_before(500), 1);
        assert!(registry.get("old").is_none());
        assert!(registry.get("new").is_some());
        assert!(registry.get("live").is_some());
    }

    #[test]
    fn test_metrics_slot_views() {
        let registry = ExecutionRegistry::new();
        registry.insert(execution("a", 1)).unwrap();
        assert_eq!(registry.metrics("a").unwrap(), None);
        assert!(matches!(registry.metrics("x"), Err(EngineError::NotFound(_))));

        let collector = Arc::new(MetricsCollector::new("a", 10, "h".to_string()));
        registry
            .compare_and_transition("a", Pending, Running, 10, |entry| {
                entry.metrics = MetricsSlot::Live(Arc::clone(&collector));
            })
            .unwrap();
        assert!(!registry.metrics("a").unwrap().unwrap().is_final());

        registry
            .compare_and_transition("a", Running, Failed, 20, |entry| {
                entry.metrics = MetricsSlot::Final(collector.finish(20));
            })
            .unwrap();
        assert!(registry.metrics("a").unwrap().unwrap().is_final());
    }

    #[test]
    fn test_settlement_first_claim_wins() {
        let handle = ExecutionHandle::new();
        assert_eq!(handle.settlement(), None);
        assert!(handle.claim(Settlement::Timeout));
        assert!(!handle.claim(Settlement::Cancel));
        assert!(!handle.claim(Settlement::Completion));
        assert_eq!(handle.settlement(), Some(Settlement::Timeout));
        assert_eq!(
            Settlement::Timeout.interrupted_status(),
            Some(ExecutionStatus::TimedOut)
        );
    }

    #[test]
    fn test_concurrent_terminal_writers_exactly_one_wins() {
        let registry = Arc::new(ExecutionRegistry::new());
        registry.insert(execution("race", 1)).unwrap();
        registry
            .compare_and_transition("race", Pending, Running, 2, |_| {})
            .unwrap();

        let targets = [Succeeded, Failed, Cancelled, TimedOut];
        let threads: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let to = targets[i % targets.len()];
                std::thread::spawn(move || {
                    registry
                        .compare_and_transition("race", Running, to, 3, |entry| {
                            entry.execution.append_output("winner", false);
                        })
                        .unwrap()
                        .is_applied()
                })
            })
            .collect();

        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|applied| *applied)
            .count();
        assert_eq!(winners, 1);
        let final_state = registry.get("race").unwrap();
        assert!(final_state.is_terminal());
        assert_eq!(final_state.output, "winner");
    }

    #[test]
    fn test_concurrent_claims_exactly_one_wins() {
        let handle = Arc::new(ExecutionHandle::new());
        let claims = [Settlement::Cancel, Settlement::Timeout, Settlement::Completion];
        let threads: Vec<_> = (0..30)
            .map(|i| {
                let handle = Arc::clone(&handle);
                std::thread::spawn(move || handle.claim(claims[i % 3]))
            })
            .collect();
        let wins = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
