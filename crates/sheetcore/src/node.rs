use crate::{Column, Config, NodeEmitter, NodeError, NodeId, NodeType, WorkflowRef};
use crate::ExecutionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Core trait implemented by every node type's handler
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node type this handler runs
    fn node_type(&self) -> NodeType;

    /// One-line description shown when listing node types
    fn description(&self) -> &str {
        ""
    }

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: reject a configuration before anything runs
    fn validate_config(&self, _config: &Config) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each handler
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub workflow: WorkflowRef,
    pub node_id: NodeId,

    /// Values arriving on each target handle
    pub inputs: HashMap<String, Value>,

    /// Schema resolved for the node's input, when known
    pub input_schema: Option<Vec<Column>>,

    /// Static configuration for this node
    pub config: Config,

    /// Event emitter for real-time updates
    pub events: NodeEmitter,

    /// Cancellation token for graceful shutdown
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(workflow: WorkflowRef, node_id: impl Into<NodeId>, events: NodeEmitter) -> Self {
        Self {
            execution_id: ExecutionId::nil(),
            workflow,
            node_id: node_id.into(),
            inputs: HashMap::new(),
            input_schema: None,
            config: Config::new(),
            events,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_input(mut self, handle: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(handle.into(), value.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    pub fn require_config_str(&self, name: &str) -> Result<&str, NodeError> {
        let value = self.require_config(name)?;
        value.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: type_name(value).to_string(),
        })
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    /// Rows arriving on `handle`, which must hold an array.
    pub fn input_rows(&self, handle: &str) -> Result<Vec<Value>, NodeError> {
        match self.require_input(handle)? {
            Value::Array(rows) => Ok(rows.clone()),
            other => Err(NodeError::InvalidInputType {
                field: handle.to_string(),
                expected: "array".to_string(),
                actual: type_name(other).to_string(),
            }),
        }
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Output from node execution, shaped by node category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutput {
    /// Tabular data from input, processing and control nodes
    Table {
        data: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet_name: Option<String>,
    },
    /// A file written by a generator node
    File {
        file_id: String,
        filename: String,
        size: u64,
    },
    /// Free text, e.g. an AI answer
    Text { text: String },
    /// Named values, one per source handle
    Ports { values: HashMap<String, Value> },
}

impl NodeOutput {
    pub fn table(data: Vec<Value>) -> Self {
        NodeOutput::Table {
            data,
            explanation: None,
            sheet_name: None,
        }
    }

    pub fn explained(data: Vec<Value>, explanation: impl Into<String>) -> Self {
        NodeOutput::Table {
            data,
            explanation: Some(explanation.into()),
            sheet_name: None,
        }
    }

    pub fn ports() -> Self {
        NodeOutput::Ports {
            values: HashMap::new(),
        }
    }

    pub fn with_port(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        if let NodeOutput::Ports { values } = &mut self {
            values.insert(port.into(), value.into());
        }
        self
    }

    /// Rows carried by a table output
    pub fn rows(&self) -> Option<&[Value]> {
        match self {
            NodeOutput::Table { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Value exposed on a source handle.
    ///
    /// `output` always yields the whole object. Table outputs also answer
    /// `data` and `explanation`, file outputs their field names, text `text`.
    pub fn port(&self, handle: &str) -> Option<Value> {
        if handle == "output" {
            return match self {
                NodeOutput::Table { data, .. } => Some(Value::Array(data.clone())),
                NodeOutput::Text { text } => Some(Value::String(text.clone())),
                other => serde_json::to_value(other).ok(),
            };
        }
        match self {
            NodeOutput::Table {
                data, explanation, ..
            } => match handle {
                "data" => Some(Value::Array(data.clone())),
                "explanation" => explanation.clone().map(Value::String),
                _ => None,
            },
            NodeOutput::File {
                file_id,
                filename,
                size,
            } => match handle {
                "file_id" => Some(json!(file_id)),
                "filename" => Some(json!(filename)),
                "size" => Some(json!(size)),
                _ => None,
            },
            NodeOutput::Text { text } => (handle == "text").then(|| Value::String(text.clone())),
            NodeOutput::Ports { values } => values.get(handle).cloned(),
        }
    }

    /// Whole output as JSON, used for execution-level outputs
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ports() {
        let out = NodeOutput::explained(vec![json!({"a": 1})], "kept 1 row");
        assert_eq!(out.port("data"), Some(json!([{"a": 1}])));
        assert_eq!(out.port("output"), Some(json!([{"a": 1}])));
        assert_eq!(out.port("explanation"), Some(json!("kept 1 row")));
        assert_eq!(out.port("missing"), None);
    }

    #[test]
    fn file_output_shape() {
        let out = NodeOutput::File {
            file_id: "f1".into(),
            filename: "report.csv".into(),
            size: 42,
        };
        assert_eq!(
            out.to_json(),
            json!({"kind": "file", "file_id": "f1", "filename": "report.csv", "size": 42})
        );
        assert_eq!(out.port("size"), Some(json!(42)));
    }
}
