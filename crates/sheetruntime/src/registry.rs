use sheetcore::{GraphError, NodeCategory, NodeHandler, NodeType, WorkflowGraph};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata about a registered node type
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub node_type: NodeType,
    pub category: NodeCategory,
    pub description: String,
}

/// Registry of handlers, one per node type
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        let node_type = handler.node_type();
        tracing::info!("Registering node type: {}", node_type);
        self.handlers.insert(node_type, handler);
    }

    pub fn get(&self, node_type: NodeType) -> Option<&Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type)
    }

    pub fn info(&self) -> Vec<HandlerInfo> {
        self.handlers
            .values()
            .map(|h| HandlerInfo {
                node_type: h.node_type(),
                category: h.node_type().category(),
                description: h.description().to_string(),
            })
            .collect()
    }

    /// Check that every node has a handler and an acceptable configuration.
    pub fn check(&self, graph: &WorkflowGraph) -> Result<(), GraphError> {
        for node in &graph.nodes {
            let handler = self.get(node.node_type).ok_or_else(|| {
                GraphError::Invalid(format!(
                    "no handler registered for node {} of type {}",
                    node.id, node.node_type
                ))
            })?;
            handler
                .validate_config(&node.config)
                .map_err(|e| GraphError::Invalid(format!("node {}: {}", node.id, e)))?;
        }
        Ok(())
    }
}
