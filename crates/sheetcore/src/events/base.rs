use crate::{ExecutionId, ExecutionStatus, NodeId, NodeStatus, WorkflowRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// What a status event is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityId {
    Execution(ExecutionId),
    Node(NodeId),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Execution(id) => write!(f, "execution:{}", id),
            EntityId::Node(id) => write!(f, "node:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
    Progress,
    Info,
    Warning,
}

impl From<NodeStatus> for EventStatus {
    fn from(s: NodeStatus) -> Self {
        match s {
            NodeStatus::Pending => EventStatus::Pending,
            NodeStatus::Running => EventStatus::Running,
            NodeStatus::Completed => EventStatus::Completed,
            NodeStatus::Failed => EventStatus::Failed,
            NodeStatus::Skipped => EventStatus::Skipped,
        }
    }
}

impl From<ExecutionStatus> for EventStatus {
    fn from(s: ExecutionStatus) -> Self {
        match s {
            ExecutionStatus::Pending => EventStatus::Pending,
            ExecutionStatus::Running => EventStatus::Running,
            ExecutionStatus::Completed => EventStatus::Completed,
            ExecutionStatus::Failed => EventStatus::Failed,
            ExecutionStatus::Cancelled => EventStatus::Cancelled,
        }
    }
}

/// Event delivered to realtime subscribers.
///
/// Wire shape: `{entityId, status, progress?, message?}` plus routing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowRef>,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(entity_id: EntityId, status: impl Into<EventStatus>) -> Self {
        Self {
            entity_id,
            execution_id: None,
            workflow: None,
            status: status.into(),
            progress: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn execution(execution_id: ExecutionId, status: impl Into<EventStatus>) -> Self {
        Self::new(EntityId::Execution(execution_id), status).in_execution(execution_id)
    }

    pub fn node(
        execution_id: ExecutionId,
        node_id: impl Into<NodeId>,
        status: impl Into<EventStatus>,
    ) -> Self {
        Self::new(EntityId::Node(node_id.into()), status).in_execution(execution_id)
    }

    pub fn in_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn in_workflow(mut self, workflow: WorkflowRef) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, percent: f64) -> Self {
        self.progress = Some(percent);
        self
    }
}

/// Anything that can accept status events without blocking
pub trait EventSink: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

impl EventSink for broadcast::Sender<StatusEvent> {
    fn publish(&self, event: StatusEvent) {
        // No receivers is fine
        let _ = self.send(event);
    }
}

struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: StatusEvent) {}
}

/// Event emitter handed to node handlers for progress updates
#[derive(Clone)]
pub struct NodeEmitter {
    execution_id: ExecutionId,
    node_id: NodeId,
    workflow: Option<WorkflowRef>,
    sink: Arc<dyn EventSink>,
}

impl NodeEmitter {
    pub fn new(
        execution_id: ExecutionId,
        node_id: impl Into<NodeId>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            workflow: None,
            sink,
        }
    }

    /// Emitter whose events go nowhere
    pub fn detached(node_id: impl Into<NodeId>) -> Self {
        Self::new(ExecutionId::nil(), node_id, Arc::new(NullSink))
    }

    pub fn for_workflow(mut self, workflow: WorkflowRef) -> Self {
        self.workflow = Some(workflow);
        self
    }

    fn event(&self, status: EventStatus) -> StatusEvent {
        let event = StatusEvent::node(self.execution_id, self.node_id.clone(), status);
        match &self.workflow {
            Some(w) => event.in_workflow(w.clone()),
            None => event,
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.sink
            .publish(self.event(EventStatus::Info).with_message(message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.sink
            .publish(self.event(EventStatus::Warning).with_message(message));
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        let mut event = self.event(EventStatus::Progress).with_progress(percent);
        event.message = message;
        self.sink.publish(event);
    }
}
