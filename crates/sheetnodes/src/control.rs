use crate::transform::Condition;
use async_trait::async_trait;
use serde_json::Value;
use sheetcore::{Config, NodeContext, NodeError, NodeHandler, NodeOutput, NodeType};

const DEFAULT_BATCH_SIZE: u64 = 10;

/// Splits its input rows into fixed-size batches.
///
/// Outputs `data` (all rows, unchanged), `batches` and `count`.
pub struct LoopHandler;

fn batch_size(config: &Config) -> Result<u64, NodeError> {
    match config.get("batch_size") {
        None => Ok(DEFAULT_BATCH_SIZE),
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => Ok(n),
            _ => Err(NodeError::config(format!(
                "batch_size must be a positive integer, got {}",
                value
            ))),
        },
    }
}

#[async_trait]
impl NodeHandler for LoopHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Loop
    }

    fn description(&self) -> &str {
        "Split rows into batches"
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        batch_size(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let size = batch_size(&ctx.config)? as usize;
        let rows = match ctx.inputs.get("data") {
            Some(_) => ctx.input_rows("data")?,
            None => Vec::new(),
        };

        let batches: Vec<Value> = rows
            .chunks(size)
            .map(|chunk| Value::Array(chunk.to_vec()))
            .collect();
        ctx.events.info(format!(
            "{} rows in {} batches of up to {}",
            rows.len(),
            batches.len(),
            size
        ));

        Ok(NodeOutput::ports()
            .with_port("count", batches.len())
            .with_port("batches", batches)
            .with_port("data", rows))
    }
}

/// Concatenates the rows arriving on every input, in handle order
pub struct MergeHandler;

#[async_trait]
impl NodeHandler for MergeHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Merge
    }

    fn description(&self) -> &str {
        "Combine rows from several inputs"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut handles: Vec<&String> = ctx.inputs.keys().collect();
        handles.sort();

        let mut rows = Vec::new();
        for handle in &handles {
            match &ctx.inputs[*handle] {
                Value::Array(items) => rows.extend(items.iter().cloned()),
                Value::Null => {}
                other => rows.push(other.clone()),
            }
        }

        let explanation = format!("Merged {} rows from {} inputs", rows.len(), handles.len());
        Ok(NodeOutput::explained(rows, explanation))
    }
}

/// Routes each input row to the `true` or `false` output
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Conditional
    }

    fn description(&self) -> &str {
        "Split rows on a condition"
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        Condition::from_config(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let condition = Condition::from_config(&ctx.config)?;
        let rows = ctx.input_rows("data")?;

        let (matched, rest): (Vec<Value>, Vec<Value>) =
            rows.into_iter().partition(|row| condition.matches(row));
        ctx.events.info(format!(
            "{} rows matched, {} did not",
            matched.len(),
            rest.len()
        ));

        Ok(NodeOutput::ports()
            .with_port("matched", matched.len())
            .with_port("true", matched)
            .with_port("false", rest))
    }
}
