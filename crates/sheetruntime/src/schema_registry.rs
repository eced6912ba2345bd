use crate::store::Store;
use chrono::Utc;
use sheetcore::{Column, RegistryError, SchemaKey, SchemaRecord, WorkflowGraph, WorkflowRef};
use std::collections::HashSet;
use std::sync::Arc;

/// Column schemas produced by nodes, keyed by (workflow, node, sheet)
#[derive(Clone)]
pub struct SchemaRegistry {
    store: Arc<dyn Store>,
}

impl SchemaRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Latest committed record for the key, if any.
    pub async fn get_schema(
        &self,
        workflow: &WorkflowRef,
        node_id: &str,
        sheet_name: Option<&str>,
    ) -> Result<Option<SchemaRecord>, RegistryError> {
        let key = SchemaKey::new(workflow, node_id, sheet_name);
        Ok(self.store.get_schema(&key).await?)
    }

    /// Replace the record for the key. Last writer wins.
    pub async fn put_schema(
        &self,
        workflow: &WorkflowRef,
        node_id: &str,
        sheet_name: Option<&str>,
        columns: Vec<Column>,
    ) -> Result<SchemaRecord, RegistryError> {
        let record = SchemaRecord {
            workflow: workflow.clone(),
            node_id: node_id.to_string(),
            sheet_name: sheet_name.map(str::to_string),
            columns,
            updated_at: Utc::now(),
        };
        self.store.upsert_schema(record.clone()).await?;
        tracing::debug!(
            workflow = %workflow,
            node_id,
            sheet = ?sheet_name,
            columns = record.columns.len(),
            "schema stored"
        );
        Ok(record)
    }

    /// The node's own schema, or the first one found walking its inputs.
    ///
    /// Incoming edges are followed depth-first in edge order and the first
    /// node holding a record wins. The target's own record is never written.
    pub async fn resolve_schema(
        &self,
        workflow: &WorkflowRef,
        node_id: &str,
    ) -> Result<Option<SchemaRecord>, RegistryError> {
        if let Some(own) = self.direct(workflow, node_id).await? {
            return Ok(Some(own));
        }
        match self.store.get_graph(workflow).await? {
            Some(graph) => self.walk_upstream(&graph, node_id).await,
            None => Ok(None),
        }
    }

    /// First record found upstream of `node_id`, ignoring the node's own.
    pub async fn resolve_upstream(
        &self,
        graph: &WorkflowGraph,
        node_id: &str,
    ) -> Result<Option<SchemaRecord>, RegistryError> {
        self.walk_upstream(graph, node_id).await
    }

    /// Record for a specific sheet, falling back to plain resolution.
    pub async fn resolve_sheet(
        &self,
        workflow: &WorkflowRef,
        node_id: &str,
        sheet_name: Option<&str>,
    ) -> Result<Option<SchemaRecord>, RegistryError> {
        if sheet_name.is_some() {
            if let Some(record) = self.get_schema(workflow, node_id, sheet_name).await? {
                return Ok(Some(record));
            }
        }
        self.resolve_schema(workflow, node_id).await
    }

    /// Unnamed sheet first, then sheets in name order.
    async fn direct(
        &self,
        workflow: &WorkflowRef,
        node_id: &str,
    ) -> Result<Option<SchemaRecord>, RegistryError> {
        let records = self.store.list_schemas(workflow, node_id).await?;
        Ok(records.into_iter().next())
    }

    async fn walk_upstream(
        &self,
        graph: &WorkflowGraph,
        node_id: &str,
    ) -> Result<Option<SchemaRecord>, RegistryError> {
        let mut visited: HashSet<&str> = HashSet::from([node_id]);
        let mut stack: Vec<&str> = graph.incoming(node_id).map(|e| e.source.as_str()).collect();
        stack.reverse();

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(record) = self.direct(&graph.workflow, current).await? {
                tracing::debug!(node_id, from = current, "schema resolved upstream");
                return Ok(Some(record));
            }
            let before = stack.len();
            stack.extend(graph.incoming(current).map(|e| e.source.as_str()));
            stack[before..].reverse();
        }
        Ok(None)
    }
}
