use async_trait::async_trait;
use serde_json::Value;
use sheetcore::{Config, NodeContext, NodeError, NodeHandler, NodeOutput, NodeType};
use tokio::time::{sleep, Duration};

/// Waits, then passes its `data` input through
pub struct DelayHandler;

fn delay_ms(config: &Config) -> Result<u64, NodeError> {
    match config.get("delay_ms") {
        None => Ok(1000),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| NodeError::config(format!("delay_ms must be a whole number, got {}", value))),
    }
}

#[async_trait]
impl NodeHandler for DelayHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Delay
    }

    fn description(&self) -> &str {
        "Delay execution for specified milliseconds"
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        delay_ms(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = delay_ms(&ctx.config)?;
        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {}
        }

        match ctx.inputs.get("data") {
            Some(Value::Array(rows)) => Ok(NodeOutput::table(rows.clone())),
            Some(other) => Ok(NodeOutput::ports().with_port("data", other.clone())),
            None => Ok(NodeOutput::table(Vec::new())),
        }
    }
}
