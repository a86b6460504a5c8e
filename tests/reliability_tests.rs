use data_or_timer::providers::HistoryStore;
use data_or_timer::providers::fs::FsHistoryStore;
use data_or_timer::providers::{QueueKind, WorkItem};
use data_or_timer::runtime::registry::ActivityRegistry;
use data_or_timer::runtime::{self, OrchestrationStatus};
use data_or_timer::workflow::{self, EXPIRED_OUTPUT, ORCHESTRATION_NAME, WorkflowInput};
use data_or_timer::{Event, OrchestrationContext, OrchestrationRegistry};
use std::sync::Arc as StdArc;
use std::time::Duration;
mod common;

fn count_events<F: Fn(&Event) -> bool>(hist: &[Event], pred: F) -> usize {
    hist.iter().filter(|e| pred(e)).count()
}

async fn wait_for_output(store: StdArc<dyn HistoryStore>, inst: &str, expected: &str) -> bool {
    common::wait_for_history(
        store,
        inst,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::OrchestrationCompleted { output } if output == expected))
        },
        5_000,
    )
    .await
}

#[tokio::test]
async fn duplicate_raise_id_is_recorded_once_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    // Stays open after the first event so a late duplicate has somewhere to land
    let orch = |ctx: OrchestrationContext, _input: String| async move {
        let first = ctx.schedule_wait("Evt").into_event().await?;
        ctx.schedule_wait("Done").into_event().await?;
        Ok(first)
    };
    let orchestration_registry = OrchestrationRegistry::builder().register("WaitTwice", orch).build();
    let rt = runtime::Runtime::start_with_store(
        store.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        orchestration_registry,
    )
    .await;

    let inst = "inst-raise-dup";
    rt.clone().ensure_orchestration(inst, "WaitTwice", "").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), inst, "Evt", 2_000).await);

    rt.raise_event_with_id(inst, "Evt", "ok", "raise-1").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::ExternalEvent { name, .. } if name == "Evt")),
            2_000
        )
        .await
    );
    // Redelivery of the same raise after it was recorded
    rt.raise_event_with_id(inst, "Evt", "ok", "raise-1").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), inst, "Done", 2_000).await);
    rt.raise_event(inst, "Done", "").await.unwrap();

    assert!(wait_for_output(store.clone(), inst, "ok").await, "timeout waiting for completion");
    let hist = store.read(inst).await;
    assert_eq!(
        count_events(&hist, |e| matches!(e, Event::ExternalEvent { name, .. } if name == "Evt")),
        1
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn timer_duplicate_workitems_dedup_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    let orch = |ctx: OrchestrationContext, _input: String| async move {
        let now = ctx.utc_now_ms().await?;
        ctx.schedule_timer_at(now + 100).into_timer().await?;
        Ok("t".to_string())
    };
    let orchestration_registry = OrchestrationRegistry::builder().register("OneTimer", orch).build();
    let rt = runtime::Runtime::start_with_store(
        store.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        orchestration_registry,
    )
    .await;

    let inst = "inst-timer-dup";
    let _h = rt.clone().start_orchestration(inst, "OneTimer", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::TimerCreated { .. })),
            2_000
        )
        .await
    );
    let (id, fire_at_ms) = store
        .read(inst)
        .await
        .iter()
        .find_map(|e| match e {
            Event::TimerCreated { id, fire_at_ms } => Some((*id, *fire_at_ms)),
            _ => None,
        })
        .unwrap();

    // The timer service delivers its own TimerFired as well
    let wi = WorkItem::TimerFired {
        instance: inst.to_string(),
        execution_id: 1,
        id,
        fire_at_ms,
    };
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi).await;

    assert!(wait_for_output(store.clone(), inst, "t").await, "timeout waiting for completion");
    let hist = store.read(inst).await;
    assert_eq!(count_events(&hist, |e| matches!(e, Event::TimerFired { .. })), 1);

    rt.shutdown().await;
}

#[tokio::test]
async fn activity_duplicate_completion_workitems_dedup_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    // Slow enough to inject completions before the worker reports
    let activity_registry = ActivityRegistry::builder()
        .register("SlowEcho", |input: String| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(input)
        })
        .build();
    let orch = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("SlowEcho", "x").into_activity().await
    };
    let orchestration_registry = OrchestrationRegistry::builder().register("OneSlowAct", orch).build();
    let rt =
        runtime::Runtime::start_with_store(store.clone(), StdArc::new(activity_registry), orchestration_registry).await;

    let inst = "inst-act-dup";
    let _h = rt.clone().start_orchestration(inst, "OneSlowAct", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h
                .iter()
                .any(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "SlowEcho")),
            2_000
        )
        .await
    );
    let id = store
        .read(inst)
        .await
        .iter()
        .find_map(|e| match e {
            Event::ActivityScheduled { id, name, .. } if name == "SlowEcho" => Some(*id),
            _ => None,
        })
        .unwrap();

    let wi = WorkItem::ActivityCompleted {
        instance: inst.to_string(),
        execution_id: 1,
        id,
        result: "x".to_string(),
    };
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi).await;

    assert!(wait_for_output(store.clone(), inst, "x").await, "timeout waiting for completion");
    // Let the real worker completion arrive too
    tokio::time::sleep(Duration::from_millis(300)).await;
    let hist = store.read(inst).await;
    assert_eq!(
        count_events(&hist, |e| matches!(e, Event::ActivityCompleted { id: cid, .. } if *cid == id)),
        1
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn stale_timer_from_previous_execution_is_ignored() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    let orch = |ctx: OrchestrationContext, input: String| async move {
        if input.is_empty() {
            ctx.continue_as_new("second");
            return Ok(String::new());
        }
        ctx.schedule_wait("Done").into_event().await
    };
    let orchestration_registry = OrchestrationRegistry::builder().register("CanOnce", orch).build();
    let rt = runtime::Runtime::start_with_store(
        store.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        orchestration_registry,
    )
    .await;

    let inst = "inst-stale-timer";
    rt.clone().ensure_orchestration(inst, "CanOnce", "").await.unwrap();
    assert!(common::wait_for_executions(&rt, inst, 2, 2_000).await);
    assert!(common::wait_for_subscription(store.clone(), inst, "Done", 2_000).await);

    // Addressed to execution 1, which has already continued
    let stale = WorkItem::TimerFired {
        instance: inst.to_string(),
        execution_id: 1,
        id: 1,
        fire_at_ms: 0,
    };
    store.enqueue_work(QueueKind::Orchestrator, stale).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rt.raise_event(inst, "Done", "fin").await.unwrap();

    let status = rt.wait_for_orchestration(inst, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "fin".to_string()
        }
    );
    let second = rt.get_execution_history(inst, 2).await;
    assert_eq!(count_events(&second, |e| matches!(e, Event::TimerFired { .. })), 0);
    let first = rt.get_execution_history(inst, 1).await;
    assert!(matches!(first.last(), Some(Event::OrchestrationContinuedAsNew { .. })));

    rt.shutdown().await;
}

#[tokio::test]
async fn abandoned_work_item_is_redelivered_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(td.path(), true);

    let wi = WorkItem::ExternalRaised {
        instance: "inst".to_string(),
        name: "Evt".to_string(),
        data: "ok".to_string(),
        raise_id: "r1".to_string(),
    };
    store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await.unwrap();

    // Locked items are hidden until released
    let (item, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(item, wi);
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

    // A crash before ack returns the item to the front
    store.abandon(QueueKind::Orchestrator, &token).await.unwrap();
    let (again, token2) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(again, wi);
    assert_ne!(token, token2);

    store.ack(QueueKind::Orchestrator, &token2).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

#[tokio::test]
async fn locked_items_return_to_queue_on_reopen_fs() {
    let td = tempfile::tempdir().unwrap();
    let raised = |data: &str| WorkItem::ExternalRaised {
        instance: "inst".to_string(),
        name: "NewData".to_string(),
        data: data.to_string(),
        raise_id: format!("raise-{data}"),
    };
    {
        let store = FsHistoryStore::new(td.path(), true);
        for data in ["A", "B", "C"] {
            store.enqueue_work(QueueKind::Orchestrator, raised(data)).await.unwrap();
        }
        // A and B are in flight when the process goes away
        store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    }

    let store = FsHistoryStore::new(td.path(), false);
    let mut order = Vec::new();
    while let Some((item, token)) = store.dequeue_peek_lock(QueueKind::Orchestrator).await {
        order.push(item);
        store.ack(QueueKind::Orchestrator, &token).await.unwrap();
    }
    assert_eq!(order, vec![raised("A"), raised("B"), raised("C")]);

    // Nothing is recovered twice
    let store = FsHistoryStore::new(td.path(), false);
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

#[tokio::test]
async fn signal_locked_at_restart_is_greeted_fs() {
    let td = tempfile::tempdir().unwrap();
    let config = common::fast_config(1_000);
    let inst = "inst-inflight";

    let store1 = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    let rt1 = runtime::Runtime::start_with_store(
        store1.clone(),
        workflow::activity_registry(&config),
        workflow::orchestration_registry(&config),
    )
    .await;
    let input = WorkflowInput {
        expiration_ms: common::now_ms() + 1_000,
    };
    rt1.clone()
        .ensure_orchestration_typed(inst, ORCHESTRATION_NAME, &input)
        .await
        .unwrap();
    assert!(common::wait_for_subscription(store1.clone(), inst, &config.event_name, 2_000).await);
    rt1.shutdown().await;

    // The dispatcher had taken the signal but the instance never recorded it
    let signal = WorkItem::ExternalRaised {
        instance: inst.to_string(),
        name: config.event_name.clone(),
        data: "DATA:inflight".to_string(),
        raise_id: "raise-inflight".to_string(),
    };
    store1.enqueue_work(QueueKind::Orchestrator, signal.clone()).await.unwrap();
    while let Some((item, _token)) = store1.dequeue_peek_lock(QueueKind::Orchestrator).await {
        if item == signal {
            break;
        }
    }

    let store2 = StdArc::new(FsHistoryStore::new(td.path(), false)) as StdArc<dyn HistoryStore>;
    let rt2 = runtime::Runtime::start_with_store(
        store2,
        workflow::activity_registry(&config),
        workflow::orchestration_registry(&config),
    )
    .await;
    let status = rt2.wait_for_orchestration(inst, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: EXPIRED_OUTPUT.to_string()
        }
    );
    let greeted = common::all_executions(&rt2, inst)
        .await
        .iter()
        .flatten()
        .any(|e| matches!(e, Event::ActivityCompleted { result, .. } if result == "Hello DATA:inflight!"));
    assert!(greeted, "in-flight signal was lost across the restart");

    rt2.shutdown().await;
}
