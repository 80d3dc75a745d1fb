//! End-to-end replay behavior: idempotent steps across suspend/resume,
//! identical fault re-raising, pruning of step-scoped resources, and
//! history disposal on delete.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chronicle_core::prelude::*;
use serde_json::{json, Value};

fn greeting_workflow(
    counter: Arc<AtomicU32>,
) -> impl Fn(WorkflowCtx) -> TaskFuture + Send + Sync + 'static {
    move |ctx| {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            let inbox = ctx.queue("inbox", None).await?;

            let greet_counter = Arc::clone(&counter);
            let greeting: String = ctx
                .step("greet", || async move {
                    greet_counter.fetch_add(1, Ordering::SeqCst);
                    Ok("hello".to_string())
                })
                .await?;

            let item = inbox.get(&ctx).await?;
            let name = item.as_str().unwrap_or("?").to_string();

            let echo_counter = Arc::clone(&counter);
            let echoed: String = ctx
                .step("echo", || async move {
                    echo_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("{greeting}, {name}"))
                })
                .await?;

            inbox.remove(&ctx).await?;
            Ok(json!({ "echoed": echoed }))
        })
    }
}

async fn greeting_historian(
    store: Arc<InMemoryBlobStore>,
    counter: Arc<AtomicU32>,
) -> Historian {
    Historian::new(
        "demo",
        store,
        greeting_workflow(counter),
        Value::Null,
        HistorianConfig::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn steps_run_once_across_suspend_and_resume() {
    let store = Arc::new(InMemoryBlobStore::new());
    let counter = Arc::new(AtomicU32::new(0));

    let historian = greeting_historian(Arc::clone(&store), Arc::clone(&counter)).await;
    assert_eq!(historian.status(), WorkflowStatus::Pending);

    assert!(matches!(
        historian.run().await.unwrap(),
        RunOutcome::Suspended
    ));
    assert_eq!(historian.status(), WorkflowStatus::Suspended);
    // Only the step before the empty queue ran.
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    historian
        .record_external_event("inbox", None, "put", vec![json!("world")])
        .await
        .unwrap();

    // Fresh Historian over the same store, as after a process restart.
    let resumed = greeting_historian(Arc::clone(&store), Arc::clone(&counter)).await;
    assert_eq!(resumed.status(), WorkflowStatus::Suspended);

    let outcome = resumed.run().await.unwrap();
    let RunOutcome::Completed(value) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(value, json!({ "echoed": "hello, world" }));
    // The suspended run re-ran nothing it had already recorded: exactly
    // the same invocation count an uninterrupted run would show.
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn finished_workflows_replay_without_side_effects() {
    let store = Arc::new(InMemoryBlobStore::new());
    let counter = Arc::new(AtomicU32::new(0));

    let historian = greeting_historian(Arc::clone(&store), Arc::clone(&counter)).await;
    historian.run().await.unwrap();
    historian
        .record_external_event("inbox", None, "put", vec![json!("world")])
        .await
        .unwrap();
    let RunOutcome::Completed(first) = historian.run().await.unwrap() else {
        panic!("expected completion");
    };
    let invocations = counter.load(Ordering::SeqCst);

    // Replaying the finished history produces the same value and invokes
    // no step function again.
    let replayed = greeting_historian(Arc::clone(&store), Arc::clone(&counter)).await;
    let RunOutcome::Completed(second) = replayed.run().await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(first, second);
    assert_eq!(counter.load(Ordering::SeqCst), invocations);
}

#[tokio::test]
async fn faults_replay_identically_until_deleted() {
    let store = Arc::new(InMemoryBlobStore::new());
    let counter = Arc::new(AtomicU32::new(0));

    let failing = move |counter: Arc<AtomicU32>| {
        move |ctx: WorkflowCtx| -> TaskFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                let c = Arc::clone(&counter);
                let _: Value = ctx
                    .step("explode", || async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(WorkflowError::Fault(
                            WorkflowFault::new("boom", "the charge failed")
                                .with_details(json!({ "attempt": 1 })),
                        ))
                    })
                    .await?;
                Ok(Value::Null)
            })
        }
    };

    let historian = Historian::new(
        "fragile",
        Arc::clone(&store),
        failing(Arc::clone(&counter)),
        Value::Null,
        HistorianConfig::default(),
    )
    .await
    .unwrap();

    let RunOutcome::Errored(fault) = historian.run().await.unwrap() else {
        panic!("expected a fault");
    };
    assert_eq!(fault.kind, "boom");
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // The same fault resurfaces on resume, with the body never re-run.
    let resumed = Historian::new(
        "fragile",
        Arc::clone(&store),
        failing(Arc::clone(&counter)),
        Value::Null,
        HistorianConfig::default(),
    )
    .await
    .unwrap();
    let RunOutcome::Errored(again) = resumed.run().await.unwrap() else {
        panic!("expected a fault");
    };
    assert_eq!(again, fault);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

fn scratch_workflow() -> impl Fn(WorkflowCtx) -> TaskFuture + Send + Sync + 'static {
    |ctx| {
        Box::pin(async move {
            let board = ctx.state("board", None, json!(0)).await?;

            let step_ctx = ctx.clone();
            let step_board = board.clone();
            let total: i64 = ctx
                .step("accumulate", || async move {
                    let scratch = step_ctx.queue("scratch", None).await?;
                    scratch.put(&step_ctx, json!(1)).await?;
                    scratch.put(&step_ctx, json!(2)).await?;
                    let a = scratch.get(&step_ctx).await?;
                    let b = scratch.get(&step_ctx).await?;
                    let total = a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0);
                    step_board.set(&step_ctx, json!(total)).await?;
                    scratch.remove(&step_ctx).await?;
                    Ok(total)
                })
                .await?;

            board.remove(&ctx).await?;
            Ok(json!(total))
        })
    }
}

#[tokio::test]
async fn finished_steps_prune_their_scoped_resources() {
    let store = Arc::new(InMemoryBlobStore::new());
    let historian = Historian::new(
        "pruner",
        Arc::clone(&store),
        scratch_workflow(),
        Value::Null,
        HistorianConfig::default(),
    )
    .await
    .unwrap();

    let RunOutcome::Completed(value) = historian.run().await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(value, json!(3));

    let history = historian.history().await;
    // Nothing about the step-scoped queue survives its step.
    assert!(history
        .iter()
        .all(|r| r.resource_ref().map(|(name, _)| name) != Some("scratch")));
    // The board was created outside the step, so its event inside the
    // step is retained.
    assert!(history.iter().any(|r| matches!(
        r,
        HistoryRecord::ResourceEvent { name, action, .. }
            if name == "board" && action == "set"
    )));

    // And the pruned history still replays to the same value.
    let replayed = Historian::new(
        "pruner",
        Arc::clone(&store),
        scratch_workflow(),
        Value::Null,
        HistorianConfig::default(),
    )
    .await
    .unwrap();
    let RunOutcome::Completed(second) = replayed.run().await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(second, json!(3));
}

#[tokio::test]
async fn delete_discards_history() {
    let store = Arc::new(InMemoryBlobStore::new());
    let counter = Arc::new(AtomicU32::new(0));

    let historian = greeting_historian(Arc::clone(&store), counter).await;
    historian.run().await.unwrap();
    assert!(store.len() > 0);

    historian.delete().await.unwrap();
    assert_eq!(store.len(), 0);
    assert_eq!(historian.status(), WorkflowStatus::Cancelled);
    assert!(historian.get_resources(None).is_empty());
}

#[tokio::test]
async fn delete_can_archive_history() {
    let store = Arc::new(InMemoryBlobStore::new());
    let counter = Arc::new(AtomicU32::new(0));

    let historian = Historian::new(
        "keeper",
        Arc::clone(&store),
        greeting_workflow(counter),
        Value::Null,
        HistorianConfig {
            cancel_policy: CancelPolicy::Archive,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    historian.run().await.unwrap();
    historian.delete().await.unwrap();

    assert_eq!(store.len(), 1);
    let archive = store.read_blob("archive:keeper").await.unwrap();
    assert_eq!(archive["workflow_id"], "keeper");
    assert!(archive["records"].as_array().is_some_and(|r| !r.is_empty()));
}

#[tokio::test]
async fn suspend_without_active_run_is_a_no_op() {
    let store = Arc::new(InMemoryBlobStore::new());
    let counter = Arc::new(AtomicU32::new(0));
    let historian = greeting_historian(store, counter).await;

    historian.suspend();
    assert_eq!(historian.status(), WorkflowStatus::Pending);
}
