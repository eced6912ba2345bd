use crate::registry::HandlerRegistry;
use sheetcore::{Node, NodeContext, NodeError, NodeOutput};
use std::sync::Arc;
use std::time::Instant;

/// Dispatches one node to the handler registered for its type.
///
/// Retrying and persistence belong to the engine; this only looks up,
/// validates, runs and logs.
#[derive(Clone)]
pub struct NodeExecutor {
    registry: Arc<HandlerRegistry>,
}

impl NodeExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    #[tracing::instrument(
        name = "node_execute",
        skip(self, node, ctx),
        fields(node_id = %node.id, node_type = %node.node_type)
    )]
    pub async fn execute(&self, node: &Node, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let handler = self.registry.get(node.node_type).ok_or_else(|| {
            NodeError::Configuration(format!(
                "no handler registered for node type {}",
                node.node_type
            ))
        })?;
        handler.validate_config(&node.config)?;

        let start = Instant::now();
        let result = handler.execute(ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::debug!(duration_ms, "handler finished"),
            Err(e) => tracing::debug!(duration_ms, error = %e, kind = ?e.kind(), "handler failed"),
        }
        result
    }
}
