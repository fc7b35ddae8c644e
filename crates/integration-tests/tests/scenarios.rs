// End-to-end scenarios through the public engine API (mock runner)

use script_engine_core::domain::{
    ExecutionStatus, ParameterSchema, ParameterSpec, ParameterType, ScriptDefinition, ScriptRef,
};
use script_engine_core::port::notifier::mocks::RecordingNotifier;
use script_engine_core::port::process_probe::mocks::MockProcessProbe;
use script_engine_core::port::script_runner::mocks::{MockBehavior, MockScriptRunner};
use script_engine_core::port::{InMemoryScriptSource, LifecycleEvent};
use script_engine_core::{EngineConfig, EngineError, ExecutionEngine, SubmitRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn source() -> Arc<InMemoryScriptSource> {
    let schema =
        ParameterSchema::new(vec![ParameterSpec::required("Name", ParameterType::String)])
            .unwrap();
    Arc::new(
        InMemoryScriptSource::new()
            .with_script(
                "greet",
                ScriptDefinition::new("Write-Output \"Hello $Name\"").with_schema(schema),
            )
            .with_script(
                "slow",
                ScriptDefinition::new("Start-Sleep -Seconds 10").with_timeout(Duration::from_secs(1)),
            ),
    )
}

struct Setup {
    engine: ExecutionEngine,
    runner: Arc<MockScriptRunner>,
    notifier: Arc<RecordingNotifier>,
}

fn setup(behavior: MockBehavior, config: EngineConfig) -> Setup {
    let runner = Arc::new(MockScriptRunner::new(behavior));
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = ExecutionEngine::builder(runner.clone(), source())
        .config(config)
        .notifier(notifier.clone())
        .probe(Arc::new(MockProcessProbe::empty()))
        .build();
    Setup {
        engine,
        runner,
        notifier,
    }
}

fn succeed(delay_ms: u64) -> MockBehavior {
    MockBehavior::Succeed {
        stdout: "1\n".to_string(),
        delay: Duration::from_millis(delay_ms),
    }
}

async fn wait_for_completed(notifier: &RecordingNotifier, id: &str) {
    for _ in 0..1000 {
        let done = notifier.events().iter().any(|e| {
            matches!(e, LifecycleEvent::Completed { execution_id, .. } if execution_id == id)
        });
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no completion notification for {}", id);
}

/// Scenario A: a trivial script runs Pending -> Running -> Succeeded
#[tokio::test]
async fn scenario_a_simple_script_succeeds() {
    let s = setup(succeed(20), EngineConfig::default());

    let id = s
        .engine
        .submit(SubmitRequest::new(ScriptRef::inline("return 1"), "scenario-a"))
        .await
        .unwrap();
    let execution = s.engine.wait_for_terminal(&id, WAIT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.output, "1\n");
    assert_eq!(execution.triggered_by, "scenario-a");
    assert!(execution.completed_at.unwrap() >= execution.started_at.unwrap());

    let metrics = s.engine.get_metrics(&id).unwrap().unwrap();
    assert!(metrics.duration > Duration::ZERO);
    assert!(metrics.end_time.is_some());

    wait_for_completed(&s.notifier, &id).await;
    assert_eq!(
        s.notifier.statuses_for(&id),
        vec![
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded
        ]
    );
    let progress: Vec<u8> = s
        .notifier
        .events()
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 100]);
}

/// Scenario B: a missing required parameter is rejected synchronously
#[tokio::test]
async fn scenario_b_missing_required_parameter() {
    let s = setup(succeed(20), EngineConfig::default());

    let err = s
        .engine
        .submit(SubmitRequest::new(ScriptRef::id("greet"), "scenario-b"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ValidationFailed(_)));
    let result = err.validation_result().unwrap();
    assert!(!result.is_valid);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("Name"));

    assert!(s.engine.list_running().is_empty());
    assert_eq!(s.runner.call_count(), 0);
    assert!(s.notifier.events().is_empty());
}

/// Scenario C: a run exceeding its timeout ends TimedOut promptly
#[tokio::test]
async fn scenario_c_timeout() {
    let s = setup(MockBehavior::Hang, EngineConfig::default());

    let started = Instant::now();
    let id = s
        .engine
        .submit(SubmitRequest::new(ScriptRef::id("slow"), "scenario-c"))
        .await
        .unwrap();
    let execution = s.engine.wait_for_terminal(&id, WAIT).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert!(elapsed >= Duration::from_secs(1), "finished early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "took too long: {:?}", elapsed);
    // Partial output captured before the interruption is kept
    assert_eq!(execution.output, "working\n");
}

/// Scenario D: 50 concurrent submissions all terminate with unique ids
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_fifty_concurrent_submissions() {
    let config = EngineConfig {
        max_concurrent_runs: 4,
        ..EngineConfig::default()
    };
    let s = setup(succeed(10), config);

    let submits = (0..50).map(|i| {
        let engine = s.engine.clone();
        tokio::spawn(async move {
            let request = SubmitRequest::new(ScriptRef::inline(format!("return {}", i)), "scenario-d");
            engine.submit(request).await
        })
    });
    let ids: Vec<String> = futures::future::join_all(submits)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), 50);

    for id in &ids {
        let execution = s.engine.wait_for_terminal(id, WAIT).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
    }
    assert!(s.engine.list_running().is_empty());
    assert_eq!(s.runner.call_count(), 50);
}

/// Scenario E: cancelling right after submit never reaches Running
#[tokio::test]
async fn scenario_e_cancel_before_dispatch() {
    let s = setup(succeed(20), EngineConfig::default());

    let id = s
        .engine
        .submit(SubmitRequest::new(ScriptRef::inline("return 1"), "scenario-e"))
        .await
        .unwrap();
    assert!(s.engine.cancel(&id).unwrap());

    let execution = s.engine.get_status(&id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert!(execution.started_at.is_none());
    assert!(execution.completed_at.is_some());
    assert_eq!(s.engine.get_metrics(&id).unwrap(), None);

    // Give the dispatcher a chance to (wrongly) run it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(s.runner.call_count(), 0);
    assert_eq!(
        s.notifier.statuses_for(&id),
        vec![ExecutionStatus::Pending, ExecutionStatus::Cancelled]
    );
    assert!(s.notifier.events().iter().any(|e| matches!(
        e,
        LifecycleEvent::Completed { execution_id, duration_ms: 0, status: ExecutionStatus::Cancelled }
            if *execution_id == id
    )));
}

#[tokio::test]
async fn validate_previews_without_side_effects() {
    let s = setup(succeed(20), EngineConfig::default());

    let mut parameters = script_engine_core::domain::Parameters::new();
    parameters.insert("name".to_string(), serde_json::json!("world"));
    let result = s
        .engine
        .validate(&ScriptRef::id("greet"), &parameters)
        .await
        .unwrap();

    assert!(result.is_valid);
    assert_eq!(result.estimated_duration_secs, None);
    assert!(s.engine.list_running().is_empty());
    assert!(s.notifier.events().is_empty());

    let err = s
        .engine
        .validate(&ScriptRef::id("nope"), &parameters)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidScriptReference(_)));
}

#[tokio::test]
async fn estimate_reflects_completed_runs() {
    let s = setup(succeed(20), EngineConfig::default());
    let request = || SubmitRequest::new(ScriptRef::id("greet"), "tester").with_parameter("Name", "x");

    let id = s.engine.submit(request()).await.unwrap();
    s.engine.wait_for_terminal(&id, WAIT).await.unwrap();

    let result = s
        .engine
        .validate(&ScriptRef::id("greet"), &request().parameters)
        .await
        .unwrap();
    assert!(result.estimated_duration_secs.is_some());
}

#[tokio::test]
async fn unknown_execution_is_not_found() {
    let s = setup(succeed(20), EngineConfig::default());

    assert!(matches!(
        s.engine.get_status("missing"),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(s.engine.cancel("missing"), Err(EngineError::NotFound(_))));
    assert!(matches!(
        s.engine.get_metrics("missing"),
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn purge_after_result_retrieved() {
    let s = setup(succeed(20), EngineConfig::default());

    let id = s
        .engine
        .submit(SubmitRequest::new(ScriptRef::inline("return 1"), "tester"))
        .await
        .unwrap();
    let execution = s.engine.wait_for_terminal(&id, WAIT).await.unwrap();
    assert!(execution.is_terminal());

    let purged = s.engine.purge(&id).unwrap();
    assert_eq!(purged.id, id);
    assert!(matches!(s.engine.get_status(&id), Err(EngineError::NotFound(_))));
}
