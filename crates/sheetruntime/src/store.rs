//! Persistent store contract and the in-memory implementation.

use async_trait::async_trait;
use sheetcore::{
    ExecutionId, SchemaKey, SchemaRecord, StoreError, WorkflowExecution, WorkflowGraph,
    WorkflowRef,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Row storage for graphs, schema records and executions.
///
/// Every write is a single-row upsert keyed as described on each method.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert keyed by `graph.workflow`.
    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<(), StoreError>;

    async fn get_graph(&self, workflow: &WorkflowRef) -> Result<Option<WorkflowGraph>, StoreError>;

    /// Atomic upsert keyed by (workflow, node, sheet).
    async fn upsert_schema(&self, record: SchemaRecord) -> Result<(), StoreError>;

    async fn get_schema(&self, key: &SchemaKey) -> Result<Option<SchemaRecord>, StoreError>;

    /// Every sheet recorded for one node.
    async fn list_schemas(
        &self,
        workflow: &WorkflowRef,
        node_id: &str,
    ) -> Result<Vec<SchemaRecord>, StoreError>;

    /// Upsert keyed by execution id. A terminal record may not change status.
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: ExecutionId)
        -> Result<Option<WorkflowExecution>, StoreError>;

    async fn list_executions(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Give a draft graph a permanent id, carrying its schema records along.
    async fn promote_draft(&self, draft: &WorkflowRef) -> Result<WorkflowRef, StoreError>;
}

/// Store backed by process memory. Each instance is independent.
#[derive(Default)]
pub struct MemoryStore {
    graphs: RwLock<HashMap<WorkflowRef, WorkflowGraph>>,
    schemas: RwLock<HashMap<SchemaKey, SchemaRecord>>,
    executions: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<(), StoreError> {
        self.graphs
            .write()
            .await
            .insert(graph.workflow.clone(), graph.clone());
        Ok(())
    }

    async fn get_graph(&self, workflow: &WorkflowRef) -> Result<Option<WorkflowGraph>, StoreError> {
        Ok(self.graphs.read().await.get(workflow).cloned())
    }

    async fn upsert_schema(&self, record: SchemaRecord) -> Result<(), StoreError> {
        self.schemas.write().await.insert(record.key(), record);
        Ok(())
    }

    async fn get_schema(&self, key: &SchemaKey) -> Result<Option<SchemaRecord>, StoreError> {
        Ok(self.schemas.read().await.get(key).cloned())
    }

    async fn list_schemas(
        &self,
        workflow: &WorkflowRef,
        node_id: &str,
    ) -> Result<Vec<SchemaRecord>, StoreError> {
        let schemas = self.schemas.read().await;
        let mut records: Vec<SchemaRecord> = schemas
            .values()
            .filter(|r| &r.workflow == workflow && r.node_id == node_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.sheet_name.cmp(&b.sheet_name));
        Ok(records)
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if let Some(existing) = executions.get(&execution.id) {
            if existing.status.is_terminal() && existing.status != execution.status {
                return Err(StoreError::Conflict(format!(
                    "execution {} is already {}",
                    execution.id, existing.status
                )));
            }
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn list_executions(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut list: Vec<WorkflowExecution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| &e.workflow == workflow)
            .cloned()
            .collect();
        list.sort_by_key(|e| e.started_at);
        Ok(list)
    }

    async fn promote_draft(&self, draft: &WorkflowRef) -> Result<WorkflowRef, StoreError> {
        if !draft.is_draft() {
            return Err(StoreError::Conflict(format!(
                "workflow {} is already persisted",
                draft
            )));
        }

        let mut graphs = self.graphs.write().await;
        let mut graph = graphs
            .remove(draft)
            .ok_or_else(|| StoreError::NotFound(draft.to_string()))?;
        let promoted = WorkflowRef::new_persisted();
        graph.workflow = promoted.clone();
        graphs.insert(promoted.clone(), graph);

        let mut schemas = self.schemas.write().await;
        let moved: Vec<SchemaKey> = schemas
            .keys()
            .filter(|k| &k.workflow == draft)
            .cloned()
            .collect();
        for key in moved {
            if let Some(mut record) = schemas.remove(&key) {
                record.workflow = promoted.clone();
                schemas.insert(record.key(), record);
            }
        }

        Ok(promoted)
    }
}
