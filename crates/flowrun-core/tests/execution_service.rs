use async_trait::async_trait;
use flowrun_core::{
    flow, parameters, task, BroadcastEventHandler, CallableFailure, CoreError, EngineSettings,
    ExecutionService, FailureKind, LogEntry, LogLevel, LogSink, ParamType, ParameterSpec,
    Parameters, RetryTimer, RunError, RunFilter, RunId, RunState, AWAITING_RETRY, CANCELLED,
    TIMED_OUT,
};
use flowrun_state_inmemory::InMemoryStateStoreProvider;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn service() -> ExecutionService {
    let provider = InMemoryStateStoreProvider::new();
    let (recorder, logs) = provider.create_repositories();
    ExecutionService::new(recorder, logs)
}

fn states(history: &[flowrun_core::StateTransition]) -> Vec<RunState> {
    history.iter().map(|t| t.to).collect()
}

#[tokio::test]
async fn test_successful_run_records_three_states() {
    let service = service();
    let get_repo_info = flow("get_repo_info")
        .parameter(ParameterSpec::required("repo_name", ParamType::String))
        .build(|ctx| async move {
            let repo: String = ctx.parameter("repo_name")?;
            Ok::<_, anyhow::Error>(json!({"full_name": repo, "stargazers_count": 17000}))
        })
        .unwrap();

    let completed = service
        .run(
            &get_repo_info,
            parameters([("repo_name", json!("PrefectHQ/prefect"))]),
        )
        .await
        .unwrap();

    assert_eq!(completed.attempts, 1);
    assert_eq!(
        completed.value,
        json!({"full_name": "PrefectHQ/prefect", "stargazers_count": 17000})
    );

    let run = service.recorder().get_run(&completed.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.result, Some(completed.value.clone()));
    assert!(run.started_at.is_some());
    assert!(run.ended_at.is_some());

    let history = service.recorder().history(&completed.run_id).await.unwrap();
    assert_eq!(
        states(&history),
        vec![RunState::Scheduled, RunState::Running, RunState::Completed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_run_exhausts_attempts() {
    let service = service();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let get_repo_info = flow("get_repo_info")
        .parameter(ParameterSpec::required("repo_name", ParamType::String))
        .retries(2)
        .retry_delay(Duration::from_secs(5))
        .build(move |ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let repo: String = ctx.parameter("repo_name")?;
                Err::<Value, _>(anyhow::anyhow!("404 Not Found for {}", repo))
            }
        })
        .unwrap();

    let start = tokio::time::Instant::now();
    let err = service
        .run(
            &get_repo_info,
            parameters([("repo_name", json!("missing-org/missing-repo"))]),
        )
        .await
        .unwrap_err();

    assert!(start.elapsed() >= Duration::from_secs(10));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let failed = err.as_failed().expect("run failure");
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.history.len(), 3);
    assert_eq!(
        failed.last_failure.to_string(),
        "404 Not Found for missing-org/missing-repo"
    );

    let history = service.recorder().history(&failed.run_id).await.unwrap();
    assert_eq!(
        states(&history),
        vec![
            RunState::Scheduled,
            RunState::Running,
            RunState::Retrying,
            RunState::Running,
            RunState::Retrying,
            RunState::Running,
            RunState::Failed,
        ]
    );
    assert_eq!(history[2].state_name, AWAITING_RETRY);
    assert_eq!(history[2].retry_delay_ms, Some(5000));
    let attempts: Vec<_> = history
        .iter()
        .filter(|t| t.to == RunState::Running)
        .map(|t| t.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_success_on_second_attempt_stops_retrying() {
    let service = service();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let flaky = flow("flaky")
        .retries(2)
        .build(move |ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt() < 2 {
                    anyhow::bail!("transient");
                }
                Ok::<_, anyhow::Error>(ctx.attempt())
            }
        })
        .unwrap();

    let completed = service.run(&flaky, Parameters::new()).await.unwrap();
    assert_eq!(completed.attempts, 2);
    assert_eq!(completed.value_as::<u32>().unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let run = service.recorder().get_run(&completed.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.attempt, 2);
}

#[tokio::test]
async fn test_missing_parameter_records_no_run() {
    let service = service();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let get_repo_info = flow("get_repo_info")
        .parameter(ParameterSpec::required("repo_name", ParamType::String))
        .retries(3)
        .build(move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
        .unwrap();

    let err = service
        .run(&get_repo_info, Parameters::new())
        .await
        .unwrap_err();

    let validation = err.as_validation().expect("validation error");
    assert!(validation.is_missing("repo_name"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(service
        .recorder()
        .list_runs(&RunFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_rejected_run_can_be_recorded() {
    let service = service()
        .with_settings(EngineSettings {
            record_invalid_runs: true,
            ..Default::default()
        })
        .unwrap();
    let typed = flow("typed")
        .parameter(ParameterSpec::required("x", ParamType::Integer))
        .build(|_ctx| async { Ok::<_, anyhow::Error>(()) })
        .unwrap();

    let err = service
        .run(&typed, parameters([("x", json!("not a number"))]))
        .await
        .unwrap_err();
    assert!(err.as_validation().is_some());

    let runs = service
        .recorder()
        .list_runs(&RunFilter::default())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, RunState::Failed);
    assert_eq!(
        runs[0].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Validation)
    );

    let history = service.recorder().history(&runs[0].id).await.unwrap();
    assert_eq!(states(&history), vec![RunState::Scheduled, RunState::Failed]);
}

#[tokio::test]
async fn test_parameters_are_coerced_unless_disabled() {
    let service = service();
    let echo = |name: &str| {
        flow(name)
            .parameter(ParameterSpec::required("x", ParamType::Integer))
            .parameter(ParameterSpec::with_default(
                "tags",
                ParamType::array_of(ParamType::Integer),
                json!([]),
            ))
    };

    let coercing = echo("coercing")
        .build(|ctx| async move { Ok::<_, anyhow::Error>(Value::Object(ctx.parameters().clone().into_iter().collect())) })
        .unwrap();
    let raw = echo("raw")
        .validate_parameters(false)
        .build(|ctx| async move { Ok::<_, anyhow::Error>(Value::Object(ctx.parameters().clone().into_iter().collect())) })
        .unwrap();

    let args = parameters([("x", json!("1")), ("tags", json!(["1", "2"]))]);

    let coerced = service.run(&coercing, args.clone()).await.unwrap();
    assert_eq!(coerced.value, json!({"x": 1, "tags": [1, 2]}));

    let passed_through = service.run(&raw, args).await.unwrap();
    assert_eq!(passed_through.value, json!({"x": "1", "tags": ["1", "2"]}));

    let defaults = service
        .run(&coercing, parameters([("x", json!(3))]))
        .await
        .unwrap();
    assert_eq!(defaults.value, json!({"x": 3, "tags": []}));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_with_timed_out_state() {
    let service = service();
    let slow = flow("slow")
        .timeout(Duration::from_millis(100))
        .build(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, anyhow::Error>("done")
        })
        .unwrap();

    let err = service.run(&slow, Parameters::new()).await.unwrap_err();
    let failed = err.as_failed().expect("run failure");
    assert!(failed.last_failure.is_timeout());
    assert_eq!(
        failed.last_failure.to_string(),
        "exceeded timeout of 0.1 seconds"
    );

    let run = service.recorder().get_run(&failed.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.state_name, TIMED_OUT);
    assert_eq!(
        run.failure.map(|f| f.kind),
        Some(FailureKind::TimedOut)
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_are_retried() {
    let service = service();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let sometimes_slow = flow("sometimes_slow")
        .timeout(Duration::from_secs(1))
        .retries(1)
        .build(move |ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt() == 1 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<_, anyhow::Error>(ctx.attempt())
            }
        })
        .unwrap();

    let completed = service.run(&sometimes_slow, Parameters::new()).await.unwrap();
    assert_eq!(completed.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_raised_by_body_is_not_masked() {
    let service = service();
    let own_timeout = flow("own_timeout")
        .timeout(Duration::from_secs(30))
        .build(|_ctx| async {
            tokio::time::timeout(Duration::from_millis(10), std::future::pending::<()>()).await?;
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

    let err = service.run(&own_timeout, Parameters::new()).await.unwrap_err();
    let failed = err.as_failed().expect("run failure");
    assert!(!failed.last_failure.is_timeout());
    assert!(failed
        .last_failure
        .downcast_ref::<tokio::time::error::Elapsed>()
        .is_some());

    let run = service.recorder().get_run(&failed.run_id).await.unwrap();
    assert_eq!(run.state_name, "Failed");
}

#[tokio::test]
async fn test_panicking_body_fails_the_run() {
    let service = service();
    let panics = flow("panics")
        .build(|_ctx| async {
            let values: Vec<u32> = Vec::new();
            Ok::<_, anyhow::Error>(values[3])
        })
        .unwrap();

    let err = service.run(&panics, Parameters::new()).await.unwrap_err();
    let failed = err.as_failed().expect("run failure");
    assert!(matches!(failed.last_failure, CallableFailure::Panicked(_)));
}

#[tokio::test]
async fn test_run_name_is_rendered_once_per_call() {
    let service = service();
    let renders = Arc::new(AtomicU32::new(0));
    let counter = renders.clone();

    let named = flow("named")
        .parameter(ParameterSpec::required("foo", ParamType::String))
        .parameter(ParameterSpec::with_default("bar", ParamType::Integer, json!(42)))
        .retries(2)
        .run_name_fn(move |params| {
            counter.fetch_add(1, Ordering::SeqCst);
            format!("hi-{}-{}", params["foo"].as_str().unwrap_or_default(), params["bar"])
        })
        .build(|ctx| async move {
            if ctx.attempt() < 3 {
                anyhow::bail!("not yet");
            }
            Ok::<_, anyhow::Error>(ctx.run_name().to_string())
        })
        .unwrap();

    let completed = service
        .run(&named, parameters([("foo", json!("one"))]))
        .await
        .unwrap();
    assert_eq!(completed.name, "hi-one-42");
    assert_eq!(completed.value, json!("hi-one-42"));
    assert_eq!(renders.load(Ordering::SeqCst), 1);

    service
        .run(&named, parameters([("foo", json!("two"))]))
        .await
        .unwrap();
    assert_eq!(renders.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_submit_exposes_run_while_in_flight() {
    let service = service();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    let gated = flow("gated")
        .build(move |_ctx| {
            let release_rx = release_rx.clone();
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    rx.await?;
                }
                Ok::<_, anyhow::Error>("released")
            }
        })
        .unwrap();

    let handle = service.submit(&gated, Parameters::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    // Wait for the attempt to start
    loop {
        let run = service.recorder().get_run(&run_id).await.unwrap();
        if run.state == RunState::Running {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!handle.is_finished());

    release_tx.send(()).unwrap();
    let completed = handle.join().await.unwrap();
    assert_eq!(completed.run_id, run_id);
    assert_eq!(completed.value, json!("released"));
}

#[tokio::test]
async fn test_task_runs_link_to_parent() {
    let service = service();
    let add_one = task("add_one")
        .parameter(ParameterSpec::required("x", ParamType::Integer))
        .build(|ctx| async move {
            let x: i64 = ctx.parameter("x")?;
            Ok::<_, anyhow::Error>(x + 1)
        })
        .unwrap();

    let pipeline = flow("pipeline")
        .build(move |ctx| {
            let add_one = add_one.clone();
            async move {
                let first = ctx.run_task(&add_one, parameters([("x", json!(1))])).await?;
                let second = ctx
                    .run_task(&add_one, parameters([("x", first.value)]))
                    .await?;
                Ok::<_, anyhow::Error>(second.value)
            }
        })
        .unwrap();

    let completed = service.run(&pipeline, Parameters::new()).await.unwrap();
    assert_eq!(completed.value, json!(3));

    let children = service
        .recorder()
        .list_runs(&RunFilter {
            parent_id: Some(completed.run_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    assert!(children
        .iter()
        .all(|run| run.state == RunState::Completed && run.callable_name == "add_one"));
}

#[tokio::test]
async fn test_log_prints_routes_to_run_logs() {
    let service = service();
    let chatty = flow("chatty")
        .log_prints(true)
        .build(|ctx| async move {
            ctx.print("hello from the body").await?;
            ctx.log(LogLevel::Debug, "details").await?;
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

    let completed = service.run(&chatty, Parameters::new()).await.unwrap();
    let logs = service.log_sink().read_logs(&completed.run_id).await.unwrap();

    assert!(logs
        .iter()
        .any(|e| e.message == "hello from the body" && e.level == LogLevel::Info));
    assert!(logs.iter().any(|e| e.message == "details"));
    assert!(logs.iter().any(|e| e.message.starts_with("Created flow run")));
}

#[tokio::test]
async fn test_events_are_broadcast_for_each_transition() {
    let events = Arc::new(BroadcastEventHandler::new(16));
    let mut rx = events.subscribe();
    let service = service().with_event_handler(events.clone());

    let quick = flow("quick")
        .build(|_ctx| async { Ok::<_, anyhow::Error>(1) })
        .unwrap();
    service.run(&quick, Parameters::new()).await.unwrap();

    let mut types = Vec::new();
    for _ in 0..3 {
        types.push(rx.recv().await.unwrap().event_type());
    }
    assert_eq!(
        types,
        vec!["flow_run.scheduled", "flow_run.running", "flow_run.completed"]
    );
}

#[tokio::test]
async fn test_concurrent_runs_keep_independent_histories() {
    let service = service();
    let double = flow("double")
        .parameter(ParameterSpec::required("x", ParamType::Integer))
        .retries(1)
        .build(|ctx| async move {
            let x: i64 = ctx.parameter("x")?;
            if x % 2 == 1 && ctx.attempt() == 1 {
                anyhow::bail!("odd inputs fail once");
            }
            tokio::task::yield_now().await;
            Ok::<_, anyhow::Error>(x * 2)
        })
        .unwrap();

    let mut handles = Vec::new();
    for x in 0..10 {
        handles.push(
            service
                .submit(&double, parameters([("x", json!(x))]))
                .await
                .unwrap(),
        );
    }

    for (x, handle) in handles.into_iter().enumerate() {
        let completed = handle.join().await.unwrap();
        assert_eq!(completed.value, json!(x as i64 * 2));

        let history = service.recorder().history(&completed.run_id).await.unwrap();
        assert!(history.iter().all(|t| t.run_id == completed.run_id));
        let expected_len = if x % 2 == 1 { 5 } else { 3 };
        assert_eq!(history.len(), expected_len);
    }
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() {
    let result = service().with_settings(EngineSettings {
        default_retry_delay_seconds: -1.0,
        ..Default::default()
    });
    assert!(matches!(result, Err(CoreError::ConfigurationError(_))));

    let result = service().with_settings(EngineSettings {
        default_timeout_seconds: Some(f64::NAN),
        ..Default::default()
    });
    assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
}

#[tokio::test(start_paused = true)]
async fn test_parent_timeout_cancels_child_run() {
    let service = service();
    let side_effects = Arc::new(AtomicU32::new(0));
    let counter = side_effects.clone();

    let slow_child = task("slow_child")
        .build(move |_ctx| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
        .unwrap();

    let parent = flow("impatient_parent")
        .timeout(Duration::from_millis(100))
        .build(move |ctx| {
            let slow_child = slow_child.clone();
            async move {
                ctx.run_task(&slow_child, Parameters::new()).await?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .unwrap();

    let err = service.run(&parent, Parameters::new()).await.unwrap_err();
    let failed = err.as_failed().expect("run failure");
    assert!(failed.last_failure.is_timeout());

    tokio::time::sleep(Duration::from_secs(5)).await;

    let children = service
        .recorder()
        .list_runs(&RunFilter {
            parent_id: Some(failed.run_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.state, RunState::Failed);
    assert_eq!(child.state_name, CANCELLED);
    assert_eq!(
        child.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Cancelled)
    );
    assert_eq!(side_effects.load(Ordering::SeqCst), 0);

    let history = service.recorder().history(&child.id).await.unwrap();
    assert_eq!(
        states(&history),
        vec![RunState::Scheduled, RunState::Running, RunState::Failed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropped_run_is_recorded_as_cancelled() {
    let service = service();
    let stuck = flow("stuck")
        .build(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_secs(1), service.run(&stuck, Parameters::new())).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;

    let runs = service
        .recorder()
        .list_runs(&RunFilter {
            callable_name: Some("stuck".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, RunState::Failed);
    assert_eq!(runs[0].state_name, CANCELLED);
    assert!(runs[0].ended_at.is_some());
}

/// Log sink that accepts `limit` entries and then fails
struct FullDisk {
    inner: Arc<dyn LogSink>,
    limit: u32,
    appended: AtomicU32,
}

#[async_trait]
impl LogSink for FullDisk {
    async fn append(&self, entry: LogEntry) -> Result<(), CoreError> {
        if self.appended.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(CoreError::LogSinkError("disk full".to_string()));
        }
        self.inner.append(entry).await
    }

    async fn read_logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, CoreError> {
        self.inner.read_logs(run_id).await
    }
}

#[tokio::test]
async fn test_failing_log_sink_does_not_strand_runs() {
    let (recorder, logs) = InMemoryStateStoreProvider::new().create_repositories();
    let sink = Arc::new(FullDisk {
        inner: logs,
        limit: 1,
        appended: AtomicU32::new(0),
    });
    let service = ExecutionService::new(recorder, sink);

    let always_fails = flow("always_fails")
        .retries(2)
        .build(|_ctx| async { Err::<(), _>(anyhow::anyhow!("boom")) })
        .unwrap();
    let err = service
        .run(&always_fails, Parameters::new())
        .await
        .unwrap_err();
    let failed = err.as_failed().expect("the run's own failure");
    assert_eq!(failed.attempts, 3);
    let run = service.recorder().get_run(&failed.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);

    let succeeds = flow("succeeds")
        .build(|_ctx| async { Ok::<_, anyhow::Error>(7) })
        .unwrap();
    let completed = service.run(&succeeds, Parameters::new()).await.unwrap();
    let run = service.recorder().get_run(&completed.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
}

struct StoppedTimer;

#[async_trait]
impl RetryTimer for StoppedTimer {
    async fn wait(&self, _run_id: &RunId, _delay: Duration) -> Result<(), CoreError> {
        Err(CoreError::Other("timer stopped".to_string()))
    }
}

#[tokio::test]
async fn test_retry_timer_error_fails_the_run() {
    let service = service().with_retry_timer(Arc::new(StoppedTimer));
    let flaky = flow("flaky")
        .retries(1)
        .build(|_ctx| async { Err::<(), _>(anyhow::anyhow!("boom")) })
        .unwrap();

    let err = service.run(&flaky, Parameters::new()).await.unwrap_err();
    assert!(matches!(err, RunError::Core(CoreError::Other(_))));

    let runs = service
        .recorder()
        .list_runs(&RunFilter {
            callable_name: Some("flaky".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.failure.as_ref().map(|f| f.kind), Some(FailureKind::Engine));

    let history = service.recorder().history(&run.id).await.unwrap();
    assert_eq!(
        states(&history),
        vec![
            RunState::Scheduled,
            RunState::Running,
            RunState::Retrying,
            RunState::Failed
        ]
    );
}
