//! End-to-end samples: the data-or-timer workflow on the in-process `Runtime`.
//!
//! Each test uses millisecond-scale wait windows so the full
//! create, signal, continue-as-new and expire cycle runs in well under a second.
use data_or_timer::providers::HistoryStore;
use data_or_timer::providers::fs::FsHistoryStore;
use data_or_timer::providers::in_memory::InMemoryHistoryStore;
use data_or_timer::runtime::registry::ActivityRegistry;
use data_or_timer::runtime::{self, OrchestrationStatus, SignalDisposition};
use data_or_timer::workflow::{self, EXPIRED_OUTPUT, ORCHESTRATION_NAME, SAY_HELLO, SingletonClient, WorkflowInput};
use data_or_timer::{Action, Event, OrchestrationRegistry, run_turn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
mod common;

async fn start_runtime(store: Arc<dyn HistoryStore>, config: &data_or_timer::config::DataOrTimerConfig) -> Arc<runtime::Runtime> {
    runtime::Runtime::start_with_store(
        store,
        workflow::activity_registry(config),
        workflow::orchestration_registry(config),
    )
    .await
}

/// Expiration without signals: the instance re-arms until the deadline
/// passes, one execution per timer round, then completes with "expired".
#[tokio::test]
async fn sample_data_or_timer_expires_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(FsHistoryStore::new(td.path(), true)) as Arc<dyn HistoryStore>;
    let config = common::fast_config(300);
    let rt = start_runtime(store.clone(), &config).await;

    let input = WorkflowInput {
        expiration_ms: common::now_ms() + 300,
    };
    let created = rt
        .clone()
        .ensure_orchestration_typed("inst-expire", ORCHESTRATION_NAME, &input)
        .await
        .unwrap();
    assert!(created);

    let status = rt
        .wait_for_orchestration("inst-expire", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: EXPIRED_OUTPUT.to_string()
        }
    );

    let executions = common::all_executions(&rt, "inst-expire").await;
    assert!(executions.len() >= 2, "expected at least one continuation");
    let (last, earlier) = executions.split_last().unwrap();
    for hist in earlier {
        assert!(matches!(hist.last(), Some(Event::OrchestrationContinuedAsNew { .. })));
    }
    assert!(matches!(last.last(), Some(Event::OrchestrationCompleted { .. })));

    // Replaying any recorded execution makes no new decisions
    for hist in &executions {
        let policy = config.wait;
        let (_h, actions, _logs, out) = run_turn(hist.clone(), move |ctx| async move {
            workflow::data_or_timer(ctx, input, policy, "NewData".to_string()).await
        });
        assert!(out.is_some());
        assert!(actions.iter().all(|a| matches!(a, Action::ContinueAsNew { .. })), "{actions:?}");
    }

    rt.shutdown().await;
}

/// Signal through the singleton entry point; the payload is greeted by
/// `SayHello` before the instance eventually expires.
#[tokio::test]
async fn sample_signal_runs_say_hello() {
    let config = common::fast_config(400);
    let rt = runtime::Runtime::start(
        workflow::activity_registry(&config),
        workflow::orchestration_registry(&config),
    )
    .await;
    let client = SingletonClient::new(rt.clone(), config);

    let handle = client.start_or_signal().await.unwrap();
    assert_eq!(handle.instance, "SingletonId");
    assert!(handle.created);
    assert!(handle.payload.starts_with("DATA:"));
    assert_eq!(handle.disposition, SignalDisposition::Enqueued);

    let status = handle.status_query.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: EXPIRED_OUTPUT.to_string()
        }
    );

    let greeting = format!("Hello {}!", handle.payload);
    let executions = common::all_executions(&rt, "SingletonId").await;
    let greeted = executions.iter().flatten().any(|e| {
        matches!(e, Event::ActivityCompleted { result, .. } if *result == greeting)
    });
    assert!(greeted, "no SayHello completion for {}", handle.payload);
    // The signal round cancelled its timer
    assert!(executions[0].iter().any(|e| matches!(e, Event::TimerCancelled { .. })));

    rt.shutdown().await;
}

/// Concurrent admission never creates two instances, and every signal is
/// greeted exactly once.
#[tokio::test]
async fn singleton_under_concurrent_admission() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let config = common::fast_config(1_500);
    let rt = start_runtime(store.clone(), &config).await;

    // Racing creators at the runtime level
    let input = WorkflowInput {
        expiration_ms: common::now_ms() + 60_000,
    };
    let creators = (0..8).map(|_| {
        let rt = rt.clone();
        async move {
            rt.ensure_orchestration_typed("inst-race", ORCHESTRATION_NAME, &input)
                .await
        }
    });
    let results = futures::future::join_all(creators).await;
    assert_eq!(results.iter().filter(|r| matches!(r, Ok(true))).count(), 1);
    assert_eq!(results.iter().filter(|r| matches!(r, Ok(false))).count(), 7);

    // Racing signals through the entry point
    let client = Arc::new(SingletonClient::new(rt.clone(), config));
    let calls = (0..5).map(|_| {
        let client = client.clone();
        async move { client.start_or_signal().await }
    });
    let handles: Vec<_> = futures::future::join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(handles.iter().filter(|h| h.created).count(), 1);
    assert!(handles.iter().all(|h| h.disposition == SignalDisposition::Enqueued));

    let mut instances = store.list_instances().await;
    instances.sort();
    assert_eq!(instances, vec!["SingletonId".to_string(), "inst-race".to_string()]);

    let status = rt
        .wait_for_orchestration("SingletonId", Duration::from_secs(10))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { .. }));

    let greeted: Vec<String> = common::all_executions(&rt, "SingletonId")
        .await
        .iter()
        .flat_map(|h| common::say_hello_inputs(h))
        .collect();
    let sent: HashSet<String> = handles.iter().map(|h| h.payload.clone()).collect();
    assert_eq!(greeted.len(), 5, "{greeted:?}");
    assert_eq!(greeted.into_iter().collect::<HashSet<_>>(), sent);

    rt.shutdown().await;
}

/// A terminated instance is not recreated; signals to it are dropped.
#[tokio::test]
async fn terminated_instance_drops_signal() {
    let config = common::fast_config(50);
    let rt = runtime::Runtime::start(
        workflow::activity_registry(&config),
        workflow::orchestration_registry(&config),
    )
    .await;
    let client = SingletonClient::new(rt.clone(), config);

    let first = client
        .ensure_and_signal("inst-done", common::now_ms(), "early")
        .await
        .unwrap();
    assert!(first.created);
    let status = first.status_query.wait(Duration::from_secs(5)).await.unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { .. }));
    let executions_before = rt.list_executions("inst-done").await.len();

    let again = client
        .ensure_and_signal("inst-done", common::now_ms() + 60_000, "late")
        .await
        .unwrap();
    assert!(!again.created);
    assert_eq!(again.disposition, SignalDisposition::DroppedTerminal);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rt.list_executions("inst-done").await.len(), executions_before);
    assert_eq!(again.status_query.current().await, status);

    assert!(rt.raise_event("inst-missing", "NewData", "x").await.is_err());

    rt.shutdown().await;
}

/// An unfinished instance resumes when a new runtime opens the same
/// filesystem store.
#[tokio::test]
async fn resume_after_restart_fs() {
    let td = tempfile::tempdir().unwrap();
    let config = common::fast_config(400);

    let store1 = Arc::new(FsHistoryStore::new(td.path(), true)) as Arc<dyn HistoryStore>;
    let rt1 = start_runtime(store1.clone(), &config).await;
    let input = WorkflowInput {
        expiration_ms: common::now_ms() + 400,
    };
    rt1.clone()
        .ensure_orchestration_typed("inst-resume", ORCHESTRATION_NAME, &input)
        .await
        .unwrap();
    let armed = common::wait_for_history(
        store1.clone(),
        "inst-resume",
        |h| h.iter().any(|e| matches!(e, Event::TimerCreated { .. })),
        2_000,
    )
    .await;
    assert!(armed, "timer was never created");
    rt1.shutdown().await;

    let store2 = Arc::new(FsHistoryStore::new(td.path(), false)) as Arc<dyn HistoryStore>;
    let rt2 = start_runtime(store2, &config).await;
    let status = rt2
        .wait_for_orchestration("inst-resume", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: EXPIRED_OUTPUT.to_string()
        }
    );
    rt2.shutdown().await;
}

/// A failing side effect fails the instance; nothing retries it.
#[tokio::test]
async fn activity_failure_fails_instance() {
    let config = common::fast_config(5_000);
    let activities = ActivityRegistry::builder()
        .register(SAY_HELLO, |_name: String| async move { Err::<String, String>("boom".to_string()) })
        .build();
    let orchestrations = workflow::register_orchestrations(OrchestrationRegistry::builder(), &config).build();
    let rt = runtime::Runtime::start(Arc::new(activities), orchestrations).await;
    let client = SingletonClient::new(rt.clone(), config);

    let handle = client.start_or_signal().await.unwrap();
    let status = handle.status_query.wait(Duration::from_secs(5)).await.unwrap();
    match status {
        OrchestrationStatus::Failed { error } => assert!(error.contains("activity failed: boom"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(rt.list_executions("SingletonId").await, vec![1]);

    rt.shutdown().await;
}
