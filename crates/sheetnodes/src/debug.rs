use async_trait::async_trait;
use serde_json::Value;
use sheetcore::{NodeContext, NodeError, NodeHandler, NodeOutput, NodeType};

/// Logs its inputs and passes table data through
pub struct LogHandler;

#[async_trait]
impl NodeHandler for LogHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Log
    }

    fn description(&self) -> &str {
        "Log input values for debugging"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)");

        ctx.events.info(format!("LOG: {}", message));
        tracing::info!(node_id = %ctx.node_id, "{}", message);

        let mut handles: Vec<&String> = ctx.inputs.keys().collect();
        handles.sort();
        for key in handles {
            let value = &ctx.inputs[key];
            let summary = match value {
                Value::Array(rows) => format!("{} rows", rows.len()),
                other => other.to_string(),
            };
            ctx.events.info(format!("  {}: {}", key, summary));
        }

        match ctx.inputs.get("data") {
            Some(Value::Array(rows)) => Ok(NodeOutput::explained(rows.clone(), message)),
            _ => Ok(NodeOutput::Text {
                text: message.to_string(),
            }),
        }
    }
}
