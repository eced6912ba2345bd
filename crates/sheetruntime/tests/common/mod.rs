#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use sheetcore::{
    Node, NodeContext, NodeError, NodeHandler, NodeOutput, NodeType, WorkflowGraph, WorkflowRef,
};
use sheetruntime::HandlerRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Handler whose behavior is driven by node config:
///
/// - `rows`: emit these rows as a table
/// - `fail`: `"validation" | "transient" | "fatal"`, fail every call
/// - `fail_times`: fail transiently this many times, then succeed
/// - `sleep_ms`: sleep before answering
/// - `gate`: signal `entered`, then wait for a permit on `gate`
///
/// Otherwise rows on the `data` input pass through.
pub struct Scripted {
    node_type: NodeType,
    recorder: Recorder,
}

#[derive(Clone)]
pub struct Recorder {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub gate: Arc<Semaphore>,
    pub entered: Arc<Notify>,
    failures: Arc<Mutex<HashMap<String, u64>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new(Semaphore::new(0)),
            entered: Arc::new(Notify::new()),
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, node: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == node).count()
    }
}

#[async_trait]
impl NodeHandler for Scripted {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn description(&self) -> &str {
        "scripted test handler"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.recorder.calls.lock().unwrap().push(ctx.node_id.clone());

        if ctx.config.get("gate").is_some() {
            self.recorder.entered.notify_one();
            let permit = self.recorder.gate.acquire().await.unwrap();
            permit.forget();
        }
        if let Some(ms) = ctx.config.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        match ctx.config.get("fail").and_then(Value::as_str) {
            Some("validation") => return Err(NodeError::config("column 'amount' does not exist")),
            Some("transient") => return Err(NodeError::transient("provider timeout")),
            Some("fatal") => return Err(NodeError::fatal("unexpected fault")),
            _ => {}
        }
        if let Some(times) = ctx.config.get("fail_times").and_then(Value::as_u64) {
            let mut failures = self.recorder.failures.lock().unwrap();
            let seen = failures.entry(ctx.node_id.clone()).or_default();
            if *seen < times {
                *seen += 1;
                return Err(NodeError::transient("flaky upstream"));
            }
        }

        if let Some(Value::Array(rows)) = ctx.config.get("rows") {
            return Ok(NodeOutput::table(rows.clone()));
        }
        let rows = match ctx.inputs.get("data") {
            Some(Value::Array(rows)) => rows.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };
        Ok(NodeOutput::table(rows))
    }
}

/// Registry with a scripted handler for every node type
pub fn scripted_registry(recorder: &Recorder) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for node_type in NodeType::ALL {
        registry.register(Arc::new(Scripted {
            node_type,
            recorder: recorder.clone(),
        }));
    }
    registry
}

/// Linear chain `ids[0] -> ids[1] -> ...` over the `data` handle
pub fn chain(workflow: WorkflowRef, ids: &[&str]) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new(workflow, "chain");
    for id in ids {
        graph.add_node(Node::new(*id, NodeType::DataTransform)).unwrap();
    }
    for pair in ids.windows(2) {
        graph.connect(pair[0], "data", pair[1], "data").unwrap();
    }
    graph
}

pub fn amount_rows() -> Value {
    json!([{"amount": 10}, {"amount": 25}])
}
