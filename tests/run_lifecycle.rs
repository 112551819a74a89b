//! End-to-end run lifecycles through the public facade.
//!
//! Each scenario drives a managed callable through the execution service and
//! checks the recorded history, the run logs and the published events.

use flowrun::{
    flow, parameters, FailureKind, ParamType, ParameterSpec, Parameters, RunFilter, RunOptions,
    RunState,
};
use flowrun_test_utils::{
    assert_monotonic_history, assert_state_sequence, state_names, CallCounter, TestEngine,
};
use flowrun_tests::{double, get_repo_info};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_successful_run_is_recorded_and_logged() -> anyhow::Result<()> {
    let engine = TestEngine::new();
    let get_repo_info = get_repo_info()?;

    let completed = engine
        .service()
        .run(
            &get_repo_info,
            parameters([("repo_name", json!("PrefectHQ/prefect"))]),
        )
        .await?;

    assert_eq!(completed.name, "repo-PrefectHQ/prefect");
    assert_eq!(completed.attempts, 1);
    assert_eq!(completed.value["stargazers_count"], json!(17000));

    let history = engine.history(&completed.run_id).await?;
    assert_monotonic_history(&history)?;
    assert_state_sequence(
        &history,
        &[RunState::Scheduled, RunState::Running, RunState::Completed],
    )?;

    assert_eq!(
        engine.log_messages(&completed.run_id).await?,
        vec![
            "Created flow run 'repo-PrefectHQ/prefect' for flow 'get_repo_info'".to_string(),
            "Fetched PrefectHQ/prefect".to_string(),
            "Finished in state Completed()".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_failing_run_retries_then_fails() -> anyhow::Result<()> {
    let engine = TestEngine::new();
    let get_repo_info = get_repo_info()?.with_options(RunOptions {
        retries: Some(2),
        retry_delay_seconds: Some(5.0),
        ..Default::default()
    })?;

    let err = engine
        .service()
        .run(&get_repo_info, parameters([("repo_name", json!("missing/repo"))]))
        .await
        .unwrap_err();
    let failed = err.as_failed().expect("run failure");
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.history.len(), 3);
    assert_eq!(failed.last_failure.kind(), FailureKind::Raised);
    assert!(failed
        .last_failure
        .to_string()
        .contains("404 Not Found for missing/repo"));

    let history = engine.history(&failed.run_id).await?;
    assert_monotonic_history(&history)?;
    assert_eq!(
        state_names(&history),
        vec![
            "Scheduled",
            "Running",
            "AwaitingRetry",
            "Running",
            "AwaitingRetry",
            "Running",
            "Failed",
        ]
    );
    let attempts: Vec<_> = history.iter().map(|t| t.attempt).collect();
    assert_eq!(attempts, vec![1, 1, 1, 2, 2, 3, 3]);
    assert_eq!(
        engine.timer().delays_for(&failed.run_id),
        vec![Duration::from_secs(5), Duration::from_secs(5)]
    );

    let run = engine.service().recorder().get_run(&failed.run_id).await?;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.failure.map(|f| f.kind), Some(FailureKind::Raised));
    Ok(())
}

#[tokio::test]
async fn test_invalid_arguments_never_start_a_run() -> anyhow::Result<()> {
    let engine = TestEngine::new();
    let counter = CallCounter::new();
    let counted = flow("counted")
        .parameter(ParameterSpec::required("x", ParamType::Integer))
        .retries(3)
        .build(counter.body())?;

    let missing = engine
        .service()
        .run(&counted, Parameters::new())
        .await
        .unwrap_err();
    assert!(missing.as_validation().expect("validation").is_missing("x"));

    let wrong_type = engine
        .service()
        .run(&counted, parameters([("x", json!("not a number"))]))
        .await
        .unwrap_err();
    assert!(wrong_type.as_validation().is_some());

    assert_eq!(counter.count(), 0);
    assert!(engine
        .service()
        .recorder()
        .list_runs(&RunFilter::default())
        .await?
        .is_empty());
    assert!(engine.timer().delays().is_empty());

    // Coercion hands the body a proper integer
    let ok = engine
        .service()
        .run(&counted, parameters([("x", json!("7"))]))
        .await?;
    assert_eq!(counter.count(), 1);
    let run = engine.service().recorder().get_run(&ok.run_id).await?;
    assert_eq!(run.parameters["x"], json!(7));
    Ok(())
}

#[tokio::test]
async fn test_nested_task_runs_link_to_their_parent() -> anyhow::Result<()> {
    let engine = TestEngine::new();
    let double = double()?;
    let pipeline = flow("pipeline").build(move |ctx| {
        let double = double.clone();
        async move {
            let first = ctx.run_task(&double, parameters([("x", json!(21))])).await?;
            let second = ctx.run_task(&double, parameters([("x", json!(1))])).await?;
            Ok::<_, anyhow::Error>(first.value_as::<i64>()? + second.value_as::<i64>()?)
        }
    })?;

    let completed = engine.service().run(&pipeline, Parameters::new()).await?;
    assert_eq!(completed.value, json!(44));

    let children = engine
        .service()
        .recorder()
        .list_runs(&RunFilter {
            parent_id: Some(completed.run_id.clone()),
            ..Default::default()
        })
        .await?;
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.callable_name, "double");
        assert_eq!(child.state, RunState::Completed);
        assert_monotonic_history(&engine.history(&child.id).await?)?;
    }
    let results: Vec<_> = children.iter().map(|c| c.result.clone()).collect();
    assert_eq!(results, vec![Some(json!(42)), Some(json!(2))]);
    Ok(())
}

#[tokio::test]
async fn test_events_mirror_the_recorded_history() -> anyhow::Result<()> {
    let engine = TestEngine::new();
    let mut events = engine.subscribe();
    let flaky = flow("flaky")
        .retries(1)
        .build(flowrun_test_utils::fail_times(1))?;

    let completed = engine.service().run(&flaky, Parameters::new()).await?;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    let types: Vec<_> = received.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![
            "flow_run.scheduled",
            "flow_run.running",
            "flow_run.retrying",
            "flow_run.running",
            "flow_run.completed",
        ]
    );

    let history = engine.history(&completed.run_id).await?;
    let transitions: Vec<_> = received.into_iter().map(|e| e.transition).collect();
    assert_eq!(transitions, history);
    Ok(())
}
