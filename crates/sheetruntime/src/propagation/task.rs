use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sheetcore::{NodeId, WorkflowRef};
use std::fmt;
use uuid::Uuid;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Identity used for deduplication and cooldown
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropagationKey {
    pub workflow: WorkflowRef,
    pub source: NodeId,
    pub target: NodeId,
    pub sheet_name: Option<String>,
}

impl fmt::Display for PropagationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.workflow, self.source, self.target)?;
        if let Some(sheet) = &self.sheet_name {
            write!(f, "[{}]", sheet)?;
        }
        Ok(())
    }
}

/// Request to copy a source node's schema onto a target node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationTask {
    pub id: TaskId,
    pub workflow: WorkflowRef,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
    pub attempts: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PropagationTask {
    pub(crate) fn new(key: &PropagationKey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow: key.workflow.clone(),
            source: key.source.clone(),
            target: key.target.clone(),
            sheet_name: key.sheet_name.clone(),
            attempts: 0,
            status: TaskStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> PropagationKey {
        PropagationKey {
            workflow: self.workflow.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            sheet_name: self.sheet_name.clone(),
        }
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new task was created
    Queued(TaskId),
    /// An equivalent live task was refreshed instead
    Updated(TaskId),
    /// The pair propagated within the cooldown window
    Suppressed,
}

impl EnqueueOutcome {
    pub fn task_id(self) -> Option<TaskId> {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Updated(id) => Some(id),
            EnqueueOutcome::Suppressed => None,
        }
    }
}
