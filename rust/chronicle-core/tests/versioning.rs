//! Version-guarded regions: histories recorded under an old version keep
//! replaying the old logic after a redeploy, while freshly entered regions
//! pick up the new logic.

use std::sync::Arc;

use chronicle_core::prelude::*;
use serde_json::{json, Value};

/// Consumes three items from the feed. From version 2 on, new items get
/// an exclamation suffix.
fn feed_workflow(
    deployed: &'static str,
) -> impl Fn(WorkflowCtx) -> TaskFuture + Send + Sync + 'static {
    move |ctx| {
        Box::pin(async move {
            let feed = ctx.queue("feed", None).await?;
            let mut collected = Vec::new();
            for _ in 0..3 {
                let item = feed.get(&ctx).await?;
                let version = ctx.get_version("item-format", deployed).await?;
                let text = item.as_str().unwrap_or_default().to_string();
                collected.push(if version < VersionTag::new("2") {
                    text
                } else {
                    format!("{text}!")
                });
            }
            feed.remove(&ctx).await?;
            Ok(json!(collected))
        })
    }
}

async fn feed_historian(store: Arc<InMemoryBlobStore>, deployed: &'static str) -> Historian {
    Historian::new(
        "feed",
        store,
        feed_workflow(deployed),
        Value::Null,
        HistorianConfig::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn suspended_regions_keep_their_recorded_version_across_redeploy() {
    let store = Arc::new(InMemoryBlobStore::new());

    // Two of the three expected items are consumed under version 1.
    let v1 = feed_historian(Arc::clone(&store), "1").await;
    v1.run().await.unwrap();
    for item in ["one", "two"] {
        v1.record_external_event("feed", None, "put", vec![json!(item)])
            .await
            .unwrap();
        assert!(matches!(v1.run().await.unwrap(), RunOutcome::Suspended));
    }
    drop(v1);

    // Redeploy: version 2 appends a suffix to newly formatted items. The
    // third item arrives only after the upgrade.
    let v2 = feed_historian(Arc::clone(&store), "2").await;
    v2.record_external_event("feed", None, "put", vec![json!("three")])
        .await
        .unwrap();
    let RunOutcome::Completed(value) = v2.run().await.unwrap() else {
        panic!("expected completion");
    };

    // The first two items replay under the recorded version 1; only the
    // item handled by freshly executed logic carries the suffix.
    assert_eq!(value, json!(["one", "two", "three!"]));
}

#[tokio::test]
async fn completed_regions_replay_their_version_verbatim() {
    let store = Arc::new(InMemoryBlobStore::new());

    let v1 = feed_historian(Arc::clone(&store), "1").await;
    v1.run().await.unwrap();
    for item in ["one", "two", "three"] {
        v1.record_external_event("feed", None, "put", vec![json!(item)])
            .await
            .unwrap();
        v1.run().await.unwrap();
    }
    drop(v1);

    // Even replayed wholesale under version 2, the finished history keeps
    // its recorded formatting.
    let v2 = feed_historian(Arc::clone(&store), "2").await;
    let RunOutcome::Completed(value) = v2.run().await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(value, json!(["one", "two", "three"]));
}

#[tokio::test]
async fn fresh_workflows_use_the_deployed_version() {
    let store = Arc::new(InMemoryBlobStore::new());

    let v2 = feed_historian(Arc::clone(&store), "2").await;
    v2.run().await.unwrap();
    for item in ["one", "two", "three"] {
        v2.record_external_event("feed", None, "put", vec![json!(item)])
            .await
            .unwrap();
        v2.run().await.unwrap();
    }

    let replayed = feed_historian(store, "2").await;
    let RunOutcome::Completed(value) = replayed.run().await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(value, json!(["one!", "two!", "three!"]));
}
