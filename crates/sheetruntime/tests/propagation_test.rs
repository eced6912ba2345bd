mod common;

use common::chain;
use sheetcore::{Column, DataType, EntityId, EventStatus, StatusEvent, WorkflowRef};
use sheetruntime::propagation::{EnqueueOutcome, PropagationQueue, TaskStatus};
use sheetruntime::{MemoryStore, PropagationConfig, SchemaRegistry, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn amount() -> Vec<Column> {
    vec![Column::new("amount", DataType::Number)]
}

async fn setup() -> (SchemaRegistry, Arc<PropagationQueue>, WorkflowRef) {
    let store = Arc::new(MemoryStore::new());
    let workflow = WorkflowRef::draft("prop");
    store
        .save_graph(&chain(workflow.clone(), &["a", "b"]))
        .await
        .unwrap();
    let registry = SchemaRegistry::new(store);
    let queue = Arc::new(PropagationQueue::new(
        registry.clone(),
        PropagationConfig::default(),
    ));
    (registry, queue, workflow)
}

#[tokio::test]
async fn test_read_your_writes() {
    let (registry, _, workflow) = setup().await;

    registry
        .put_schema(&workflow, "a", None, amount())
        .await
        .unwrap();
    let first = registry.get_schema(&workflow, "a", None).await.unwrap().unwrap();
    assert_eq!(first.columns, amount());

    let replaced = vec![Column::new("total", DataType::Number).nullable()];
    registry
        .put_schema(&workflow, "a", None, replaced.clone())
        .await
        .unwrap();
    let second = registry.get_schema(&workflow, "a", None).await.unwrap().unwrap();
    assert_eq!(second.columns, replaced);
    assert!(second.updated_at >= first.updated_at);

    // Named sheets live under their own key
    assert!(registry
        .get_schema(&workflow, "a", Some("Q1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_resolve_walks_upstream_without_writing() {
    let (registry, _, workflow) = setup().await;
    registry
        .put_schema(&workflow, "a", None, amount())
        .await
        .unwrap();

    let resolved = registry.resolve_schema(&workflow, "b").await.unwrap().unwrap();
    assert_eq!(resolved.node_id, "a");
    assert_eq!(resolved.columns, amount());
    assert!(registry.get_schema(&workflow, "b", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_edge_propagates_schema() {
    let (registry, queue, workflow) = setup().await;
    registry
        .put_schema(&workflow, "a", None, amount())
        .await
        .unwrap();

    let outcome = queue.enqueue(&workflow, "a", "b", None).await;
    let step = queue.process_next().await.unwrap();

    assert_eq!(step.task_id, outcome.task_id().unwrap());
    assert_eq!(step.status, TaskStatus::Success);
    let target = registry.get_schema(&workflow, "b", None).await.unwrap().unwrap();
    assert_eq!(target.columns, amount());
}

#[tokio::test]
async fn test_duplicate_enqueue_is_refreshed() {
    let (_, queue, workflow) = setup().await;

    let first = queue.enqueue(&workflow, "a", "b", None).await;
    let second = queue.enqueue(&workflow, "a", "b", None).await;
    assert!(matches!(first, EnqueueOutcome::Queued(_)));
    assert_eq!(second, EnqueueOutcome::Updated(first.task_id().unwrap()));

    // A different sheet is a different task
    let sheet = queue.enqueue(&workflow, "a", "b", Some("Q1")).await;
    assert!(matches!(sheet, EnqueueOutcome::Queued(_)));

    let open = queue
        .tasks()
        .await
        .into_iter()
        .filter(|t| !t.status.is_terminal())
        .count();
    assert_eq!(open, 2);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_five_attempts() {
    let (tx, mut rx) = broadcast::channel::<StatusEvent>(16);
    // Empty store: the source never gets a schema
    let queue = PropagationQueue::new(
        SchemaRegistry::new(Arc::new(MemoryStore::new())),
        PropagationConfig::default(),
    )
    .with_events(Arc::new(tx));
    let workflow = WorkflowRef::draft("never-ready");

    let id = queue
        .enqueue(&workflow, "a", "b", None)
        .await
        .task_id()
        .unwrap();

    let mut delays = Vec::new();
    loop {
        let step = queue.process_next().await.unwrap();
        assert!(step.attempts <= 5);
        match step.retry_in {
            Some(delay) => {
                delays.push(delay.as_secs());
                // Not due before the backoff elapses
                assert!(queue.process_next().await.is_none());
                tokio::time::advance(delay).await;
            }
            None => break,
        }
    }

    assert_eq!(delays, vec![2, 4, 8, 16]);
    let task = queue.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 5);
    assert!(task.last_error.unwrap().contains("no schema"));

    let warning = rx.recv().await.unwrap();
    assert_eq!(warning.status, EventStatus::Warning);
    assert_eq!(warning.entity_id, EntityId::Node("b".into()));
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_suppresses_repeat_propagation() {
    let (registry, queue, workflow) = setup().await;
    registry
        .put_schema(&workflow, "a", None, amount())
        .await
        .unwrap();

    queue.enqueue(&workflow, "a", "b", None).await;
    assert_eq!(queue.drain().await, 1);

    assert_eq!(
        queue.enqueue(&workflow, "a", "b", None).await,
        EnqueueOutcome::Suppressed
    );
    assert!(matches!(
        queue.enqueue_forced(&workflow, "a", "b", None).await,
        EnqueueOutcome::Queued(_)
    ));
    queue.drain().await;

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(matches!(
        queue.enqueue(&workflow, "a", "b", None).await,
        EnqueueOutcome::Queued(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_forced_enqueue_during_cooldown_still_deduplicates() {
    let (registry, queue, workflow) = setup().await;
    registry
        .put_schema(&workflow, "a", None, amount())
        .await
        .unwrap();
    queue.enqueue(&workflow, "a", "b", None).await;
    assert_eq!(queue.drain().await, 1);

    // Inside the cooldown window
    let forced = queue.enqueue_forced(&workflow, "a", "b", None).await;
    let EnqueueOutcome::Queued(id) = forced else {
        panic!("expected a new task, got {:?}", forced);
    };
    assert_eq!(
        queue.enqueue_forced(&workflow, "a", "b", None).await,
        EnqueueOutcome::Updated(id)
    );
    // A live task wins over the cooldown check for plain enqueues too
    assert_eq!(
        queue.enqueue(&workflow, "a", "b", None).await,
        EnqueueOutcome::Updated(id)
    );

    let live: Vec<_> = queue
        .tasks()
        .await
        .into_iter()
        .filter(|t| !t.status.is_terminal())
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, id);

    assert_eq!(queue.drain().await, 1);
    assert_eq!(queue.task(id).await.unwrap().status, TaskStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_finished_tasks_are_purged() {
    let (registry, queue, workflow) = setup().await;
    registry
        .put_schema(&workflow, "a", None, amount())
        .await
        .unwrap();
    queue.enqueue(&workflow, "a", "b", None).await;
    queue.drain().await;

    tokio::time::advance(Duration::from_secs(60 * 60)).await;
    assert_eq!(queue.purge_expired().await, 0);

    tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
    assert_eq!(queue.purge_expired().await, 1);
    assert!(queue.tasks().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_worker_retries_until_source_ready() {
    let (registry, queue, workflow) = setup().await;
    let cancel = CancellationToken::new();
    let worker = queue.spawn_worker(cancel.clone()).unwrap();
    assert!(queue.spawn_worker(cancel.clone()).is_none());

    let id = queue
        .enqueue(&workflow, "a", "b", None)
        .await
        .task_id()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(queue.task(id).await.unwrap().attempts, 1);

    registry
        .put_schema(&workflow, "a", None, amount())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let task = queue.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert!(registry.get_schema(&workflow, "b", None).await.unwrap().is_some());

    cancel.cancel();
    worker.await.unwrap();
}
