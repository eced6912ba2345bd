use async_trait::async_trait;
use serde_json::json;
use sheetcore::{EntityId, EventStatus, ExecutionStatus, NodeStatus, StatusEvent, WorkflowRef};
use sheetruntime::{
    ChannelConfig, ChannelError, ChannelKey, EventStream, LocalTransport, StatusChannel,
    StatusTracker, StatusTransport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Transport whose first connection fails and whose streams can be cut
struct FlakyTransport {
    connects: AtomicUsize,
    streams: std::sync::Mutex<Vec<mpsc::UnboundedSender<StatusEvent>>>,
}

impl FlakyTransport {
    fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            streams: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn drop_connections(&self) {
        self.streams.lock().unwrap().clear();
    }
}

#[async_trait]
impl StatusTransport for FlakyTransport {
    fn publish(&self, event: StatusEvent) -> Result<(), ChannelError> {
        for tx in self.streams.lock().unwrap().iter() {
            let _ = tx.send(event.clone());
        }
        Ok(())
    }

    async fn connect(&self, _key: &ChannelKey) -> Result<EventStream, ChannelError> {
        if self.connects.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ChannelError::ConnectionFailed("broker down".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

fn node_event(status: NodeStatus) -> StatusEvent {
    StatusEvent::node(Uuid::new_v4(), "filter", status)
}

#[test]
fn test_event_wire_shape() {
    let exec = Uuid::nil();
    let event = StatusEvent::node(exec, "filter", NodeStatus::Running).with_progress(40.0);
    let value = serde_json::to_value(&event).unwrap();

    assert_eq!(value["entityId"], json!({"kind": "node", "id": "filter"}));
    assert_eq!(value["executionId"], json!(exec.to_string()));
    assert_eq!(value["status"], json!("running"));
    assert_eq!(value["progress"], json!(40.0));
    assert!(value.get("message").is_none());
}

#[tokio::test]
async fn test_subscription_filters_by_key() {
    let channel = StatusChannel::local(ChannelConfig::default());
    let workflow = WorkflowRef::draft("w1");
    let mut sub = channel
        .subscribe(ChannelKey::Workflow(workflow.clone()), "ui")
        .await;

    channel.emit(node_event(NodeStatus::Running).in_workflow(WorkflowRef::draft("other")));
    channel.emit(node_event(NodeStatus::Completed).in_workflow(workflow.clone()));

    let event = sub.recv().await.unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert_eq!(event.workflow, Some(workflow));
}

#[tokio::test]
async fn test_subscribe_is_idempotent() {
    let channel = StatusChannel::local(ChannelConfig::default());
    let key = ChannelKey::Entity(EntityId::Node("filter".into()));

    let mut first = channel.subscribe(key.clone(), "ui").await;
    let mut second = channel.subscribe(key.clone(), "ui").await;
    let _other = channel.subscribe(key.clone(), "log").await;
    assert_eq!(channel.active_subscriptions(), 2);

    channel.emit(node_event(NodeStatus::Running));
    assert_eq!(first.recv().await.unwrap().status, EventStatus::Running);
    assert_eq!(second.recv().await.unwrap().status, EventStatus::Running);

    first.close();
    assert!(second.is_closed());
    assert!(second.recv().await.is_none());
    assert_eq!(channel.active_subscriptions(), 1);

    channel.close_all();
    assert_eq!(channel.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_dropping_last_handle_releases_connection() {
    let channel = StatusChannel::local(ChannelConfig::default());
    let exec = Uuid::new_v4();
    let key = ChannelKey::Execution(exec);

    let first = channel.subscribe(key.clone(), "ui").await;
    let mut second = channel.subscribe(key.clone(), "ui").await;
    assert_eq!(channel.active_subscriptions(), 1);

    // Another handle still holds the connection open
    drop(first);
    assert_eq!(channel.active_subscriptions(), 1);
    assert!(!second.is_closed());

    channel.emit(StatusEvent::execution(exec, ExecutionStatus::Running));
    assert_eq!(second.recv().await.unwrap().status, EventStatus::Running);

    drop(second);
    assert_eq!(channel.active_subscriptions(), 0);

    // A fresh subscription opens a new connection
    let third = channel.subscribe(key.clone(), "ui").await;
    assert!(!third.is_closed());
    assert_eq!(channel.active_subscriptions(), 1);
    third.close();
    assert_eq!(channel.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_failure_and_drop() {
    let transport = Arc::new(FlakyTransport::new());
    let channel = StatusChannel::new(transport.clone(), ChannelConfig::default());
    let mut sub = channel.subscribe(ChannelKey::All, "ui").await;

    // First attempt failed; the retry happens after the reconnect delay
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_secs(5) + Duration::from_millis(10)).await;
    assert_eq!(transport.connects.load(Ordering::SeqCst), 2);

    channel.emit(node_event(NodeStatus::Running));
    assert_eq!(sub.recv().await.unwrap().status, EventStatus::Running);

    transport.drop_connections();
    tokio::time::sleep(Duration::from_secs(5) + Duration::from_millis(10)).await;
    assert_eq!(transport.connects.load(Ordering::SeqCst), 3);

    channel.emit(node_event(NodeStatus::Completed));
    assert_eq!(sub.recv().await.unwrap().status, EventStatus::Completed);

    sub.close();
}

#[tokio::test]
async fn test_stream_adapter() {
    let channel = StatusChannel::new(
        Arc::new(LocalTransport::new(16)),
        ChannelConfig::default(),
    );
    let exec = Uuid::new_v4();
    let sub = channel.subscribe(ChannelKey::Execution(exec), "cli").await;

    channel.emit(StatusEvent::execution(exec, ExecutionStatus::Running));
    channel.emit(StatusEvent::execution(exec, ExecutionStatus::Completed));

    let statuses: Vec<EventStatus> = sub.into_stream().take(2).map(|e| e.status).collect().await;
    assert_eq!(statuses, vec![EventStatus::Running, EventStatus::Completed]);
}

#[test]
fn test_tracker_drops_repeats() {
    let mut tracker = StatusTracker::new();
    let exec = Uuid::new_v4();
    let running = StatusEvent::node(exec, "filter", NodeStatus::Running);

    assert!(tracker.observe(&running));
    assert!(!tracker.observe(&running.clone()));
    assert!(tracker.observe(&running.clone().with_progress(50.0)));
    assert!(!tracker.observe(&running.clone().with_progress(50.0)));

    let done = StatusEvent::node(exec, "filter", NodeStatus::Completed);
    assert!(tracker.observe(&done));
    assert_eq!(
        tracker.status_of(&EntityId::Node("filter".into()), Some(exec)),
        Some(EventStatus::Completed)
    );

    // Same node in another execution is tracked separately
    assert!(tracker.observe(&StatusEvent::node(Uuid::new_v4(), "filter", NodeStatus::Running)));
}
