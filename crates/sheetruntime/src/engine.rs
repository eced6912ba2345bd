use crate::channel::StatusChannel;
use crate::config::EngineConfig;
use crate::executor::NodeExecutor;
use crate::plan::ExecutionPlan;
use crate::propagation::PropagationQueue;
use crate::schema_registry::SchemaRegistry;
use crate::store::Store;
use serde_json::{Map, Value};
use sheetcore::{
    infer_columns, ExecutionId, ExecutionStatus, FlowError, GraphError, LogLevel, Node,
    NodeContext, NodeEmitter, NodeError, NodeOutput, NodeStatus, NodeType, StatusEvent, WorkflowExecution,
    WorkflowGraph, WorkflowRef,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Runs workflow graphs node by node in dependency order.
///
/// Each execution is sequential; separate executions run independently.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    executor: NodeExecutor,
    schemas: SchemaRegistry,
    propagation: Option<Arc<PropagationQueue>>,
    channel: Arc<StatusChannel>,
    config: EngineConfig,
    active: Mutex<HashMap<ExecutionId, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Handle for an execution running in the background
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    join: JoinHandle<Result<WorkflowExecution, FlowError>>,
}

impl ExecutionHandle {
    /// Wait for the execution to reach a terminal status
    pub async fn wait(self) -> Result<WorkflowExecution, FlowError> {
        self.join
            .await
            .map_err(|e| FlowError::Execution(format!("Task join error: {}", e)))?
    }
}

struct Prepared {
    execution: WorkflowExecution,
    graph: WorkflowGraph,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        executor: NodeExecutor,
        channel: Arc<StatusChannel>,
        config: EngineConfig,
    ) -> Self {
        let schemas = SchemaRegistry::new(Arc::clone(&store));
        Self {
            store,
            executor,
            schemas,
            propagation: None,
            channel,
            config,
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Notify this queue whenever a node produces a new schema
    pub fn with_propagation(mut self, queue: Arc<PropagationQueue>) -> Self {
        self.propagation = Some(queue);
        self
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Run a stored workflow to completion.
    #[instrument(name = "workflow_execute", skip(self, inputs), fields(workflow = %workflow))]
    pub async fn execute(
        &self,
        workflow: &WorkflowRef,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowExecution, FlowError> {
        let prepared = self.prepare(workflow, inputs).await?;
        self.run(prepared).await
    }

    /// Start a stored workflow in the background.
    ///
    /// The execution record exists (status `pending`) by the time this returns.
    pub async fn start(
        self: &Arc<Self>,
        workflow: &WorkflowRef,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionHandle, FlowError> {
        let prepared = self.prepare(workflow, inputs).await?;
        let execution_id = prepared.execution.id;
        let engine = Arc::clone(self);
        let join = tokio::spawn(async move { engine.run(prepared).await });
        Ok(ExecutionHandle { execution_id, join })
    }

    /// Request cancellation. Running nodes finish; nothing new is scheduled.
    ///
    /// Returns false if the execution is unknown or already finished.
    pub async fn cancel(&self, execution_id: ExecutionId) -> bool {
        match self.active.lock().await.get(&execution_id) {
            Some(token) => {
                info!(execution_id = %execution_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active execution and interrupt running handlers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for token in self.active.lock().await.values() {
            token.cancel();
        }
    }

    pub async fn execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, FlowError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    async fn prepare(
        &self,
        workflow: &WorkflowRef,
        inputs: Map<String, Value>,
    ) -> Result<Prepared, FlowError> {
        let graph = self
            .store
            .get_graph(workflow)
            .await?
            .ok_or_else(|| GraphError::NotFound(workflow.to_string()))?;

        let execution =
            WorkflowExecution::new(workflow.clone(), graph.nodes.iter().map(|n| n.id.clone()), inputs);
        self.persist(&execution).await?;
        self.publish(&execution, StatusEvent::execution(execution.id, ExecutionStatus::Pending));

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .await
            .insert(execution.id, cancel.clone());

        Ok(Prepared {
            execution,
            graph,
            cancel,
        })
    }

    async fn run(&self, prepared: Prepared) -> Result<WorkflowExecution, FlowError> {
        let Prepared {
            mut execution,
            graph,
            cancel,
        } = prepared;
        let execution_id = execution.id;

        let result = self.drive(&mut execution, &graph, &cancel).await;
        self.active.lock().await.remove(&execution_id);
        match result {
            Ok(()) => {}
            // Rejected before any node ran; the failed record is already stored
            Err(e @ FlowError::Graph(_)) => return Err(e),
            Err(e) => self.abort(&mut execution, &e).await,
        }

        if let Err(e) = self.write_back(&execution).await {
            warn!(workflow = %execution.workflow, error = %e, "node status not saved to graph");
        }
        Ok(execution)
    }

    /// Save the execution record, retrying backend failures with the node
    /// retry backoff.
    async fn persist(&self, execution: &WorkflowExecution) -> Result<(), FlowError> {
        let max_attempts = self.config.node_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.save_execution(execution).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        execution_id = %execution.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "execution record not saved; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// End an execution whose progress could not be stored.
    ///
    /// The running node fails, unscheduled nodes are skipped and the run is
    /// marked failed. Saving that record is a single best-effort attempt.
    async fn abort(&self, execution: &mut WorkflowExecution, err: &FlowError) {
        let reason = format!("Execution aborted: {}", err);
        let now = chrono::Utc::now();
        let sweep_pending = !execution.status.is_terminal();
        let mut changed = Vec::new();
        for (node_id, run) in execution.nodes.iter_mut() {
            let next = match run.status {
                NodeStatus::Running => NodeStatus::Failed,
                NodeStatus::Pending if sweep_pending => NodeStatus::Skipped,
                _ => continue,
            };
            run.status = next;
            run.completed_at = Some(now);
            if next == NodeStatus::Failed {
                run.error = Some(reason.clone());
            }
            changed.push((node_id.clone(), next));
        }
        execution.transition(ExecutionStatus::Failed);
        execution.log(LogLevel::Error, None, reason.clone());
        error!(execution_id = %execution.id, error = %err, "execution aborted");

        if let Err(e) = self.store.save_execution(execution).await {
            error!(execution_id = %execution.id, error = %e, "terminal execution record not saved");
        }
        for (node_id, status) in changed {
            let event = StatusEvent::node(execution.id, node_id, status);
            let event = if status == NodeStatus::Failed {
                event.with_message(reason.clone())
            } else {
                event
            };
            self.publish(execution, event);
        }
        self.publish(execution, StatusEvent::execution(execution.id, execution.status));
    }

    /// Copy each node's final status and schema onto the current stored graph.
    ///
    /// Edits made while the run was in flight are kept; a graph that is gone
    /// (deleted or promoted to a permanent id) is left alone.
    async fn write_back(&self, execution: &WorkflowExecution) -> Result<(), FlowError> {
        let workflow = &execution.workflow;
        let mut schemas = HashMap::new();
        for node_id in execution.nodes.keys() {
            if let Some(record) = self.schemas.get_schema(workflow, node_id, None).await? {
                schemas.insert(node_id.clone(), record.columns);
            }
        }

        let Some(mut graph) = self.store.get_graph(workflow).await? else {
            debug!(workflow = %workflow, "graph no longer stored; status not written back");
            return Ok(());
        };
        for node in &mut graph.nodes {
            let Some(status) = execution.node_status(&node.id) else {
                continue;
            };
            node.last_status = Some(status);
            if let Some(columns) = schemas.remove(&node.id) {
                node.schema = Some(columns);
            }
        }
        self.store.save_graph(&graph).await?;
        Ok(())
    }

    async fn drive(
        &self,
        execution: &mut WorkflowExecution,
        graph: &WorkflowGraph,
        cancel: &CancellationToken,
    ) -> Result<(), FlowError> {
        execution.transition(ExecutionStatus::Running);
        execution.log(LogLevel::Info, None, format!("Execution of {} started", graph.name));
        self.persist(execution).await?;
        self.publish(execution, StatusEvent::execution(execution.id, ExecutionStatus::Running));
        info!(execution_id = %execution.id, workflow = %graph.workflow, "workflow_started");

        let plan = match ExecutionPlan::build(graph) {
            Ok(plan) => plan,
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "workflow rejected");
                execution.log(LogLevel::Error, None, e.to_string());
                self.finish(execution, ExecutionStatus::Failed).await?;
                return Err(e.into());
            }
        };

        let mut outputs: HashMap<String, NodeOutput> = HashMap::new();
        for node_id in plan.order() {
            if cancel.is_cancelled() {
                execution.log(
                    LogLevel::Warn,
                    None,
                    "Execution cancelled; remaining nodes were not scheduled",
                );
                break;
            }
            let Some(node) = graph.find_node(node_id) else {
                continue;
            };

            let blocked: Vec<&String> = plan
                .dependencies(node_id)
                .into_iter()
                .filter(|dep| {
                    execution
                        .node_status(dep)
                        .is_some_and(NodeStatus::blocks_dependents)
                })
                .collect();
            if let Some(first) = blocked.first() {
                let reason = format!("Skipped: upstream node {} did not complete", first);
                self.mark_skipped(execution, node_id, reason).await?;
                continue;
            }

            let inputs = resolve_inputs(graph, &plan, node_id, &outputs, &execution.inputs);
            if let Some(output) = self.run_node(execution, graph, node, inputs).await? {
                self.record_schema(graph, node_id, &output).await;
                outputs.insert(node_id.clone(), output);
            }
        }

        for node_id in plan.order() {
            if plan.dependents(node_id).is_empty() {
                if let Some(output) = outputs.get(node_id) {
                    execution.outputs.insert(node_id.clone(), output.to_json());
                }
            }
        }

        let status = if cancel.is_cancelled() {
            ExecutionStatus::Cancelled
        } else if execution.count(NodeStatus::Failed) > 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        self.finish(execution, status).await
    }

    async fn finish(
        &self,
        execution: &mut WorkflowExecution,
        status: ExecutionStatus,
    ) -> Result<(), FlowError> {
        execution.transition(status);
        execution.log(
            match status {
                ExecutionStatus::Failed => LogLevel::Error,
                ExecutionStatus::Cancelled => LogLevel::Warn,
                _ => LogLevel::Info,
            },
            None,
            format!("Execution {}", status),
        );
        self.persist(execution).await?;
        self.publish(execution, StatusEvent::execution(execution.id, status));

        let duration_ms = execution
            .completed_at
            .map(|end| (end - execution.started_at).num_milliseconds())
            .unwrap_or_default();
        info!(
            execution_id = %execution.id,
            status = %status,
            completed = execution.count(NodeStatus::Completed),
            failed = execution.count(NodeStatus::Failed),
            skipped = execution.count(NodeStatus::Skipped),
            duration_ms,
            "workflow_finished"
        );
        Ok(())
    }

    async fn mark_skipped(
        &self,
        execution: &mut WorkflowExecution,
        node_id: &str,
        reason: String,
    ) -> Result<(), FlowError> {
        let run = execution.node_mut(node_id);
        run.status = NodeStatus::Skipped;
        run.completed_at = Some(chrono::Utc::now());
        execution.log(LogLevel::Warn, Some(node_id), reason.clone());
        self.persist(execution).await?;
        self.publish(
            execution,
            StatusEvent::node(execution.id, node_id, NodeStatus::Skipped).with_message(reason),
        );
        info!(execution_id = %execution.id, node_id, "node_skipped");
        Ok(())
    }

    /// Run one node with the transient-retry policy. `None` when it failed.
    async fn run_node(
        &self,
        execution: &mut WorkflowExecution,
        graph: &WorkflowGraph,
        node: &Node,
        inputs: HashMap<String, Value>,
    ) -> Result<Option<NodeOutput>, FlowError> {
        let node_id = node.id.as_str();
        {
            let run = execution.node_mut(node_id);
            run.status = NodeStatus::Running;
            run.started_at = Some(chrono::Utc::now());
        }
        self.persist(execution).await?;
        self.publish(execution, StatusEvent::node(execution.id, node_id, NodeStatus::Running));
        info!(execution_id = %execution.id, node_id, node_type = %node.node_type, "node_started");

        let input_schema = match self.schemas.resolve_upstream(graph, node_id).await {
            Ok(record) => record.map(|r| r.columns),
            Err(e) => {
                warn!(node_id, error = %e, "input schema unavailable");
                None
            }
        };

        let max_attempts = self.config.node_max_attempts.max(1);
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let ctx = NodeContext {
                execution_id: execution.id,
                workflow: graph.workflow.clone(),
                node_id: node.id.clone(),
                inputs: inputs.clone(),
                input_schema: input_schema.clone(),
                config: node.config.clone(),
                events: NodeEmitter::new(
                    execution.id,
                    node.id.clone(),
                    Arc::clone(&self.channel) as Arc<dyn sheetcore::EventSink>,
                )
                .for_workflow(graph.workflow.clone()),
                cancellation: self.shutdown.child_token(),
            };

            match self.executor.execute(node, ctx).await {
                Ok(output) => break Ok(output),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        node_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "node failed transiently; retrying"
                    );
                    execution.log(
                        LogLevel::Warn,
                        Some(node_id),
                        format!("Attempt {} failed: {}; retrying", attempt, e),
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        execution.node_mut(node_id).attempts = attempt;
        match result {
            Ok(output) => {
                let run = execution.node_mut(node_id);
                run.status = NodeStatus::Completed;
                run.completed_at = Some(chrono::Utc::now());
                run.output = Some(output.clone());
                run.error = None;
                execution.log(LogLevel::Info, Some(node_id), "Node completed");
                self.persist(execution).await?;
                self.publish(
                    execution,
                    StatusEvent::node(execution.id, node_id, NodeStatus::Completed),
                );
                info!(execution_id = %execution.id, node_id, attempts = attempt, "node_completed");
                Ok(Some(output))
            }
            Err(e) => {
                self.mark_failed(execution, node_id, &e).await?;
                Ok(None)
            }
        }
    }

    async fn mark_failed(
        &self,
        execution: &mut WorkflowExecution,
        node_id: &str,
        err: &NodeError,
    ) -> Result<(), FlowError> {
        let run = execution.node_mut(node_id);
        run.status = NodeStatus::Failed;
        run.completed_at = Some(chrono::Utc::now());
        run.error = Some(err.to_string());
        execution.log(
            LogLevel::Error,
            Some(node_id),
            format!("Node failed ({:?}): {}", err.kind(), err),
        );
        self.persist(execution).await?;
        self.publish(
            execution,
            StatusEvent::node(execution.id, node_id, NodeStatus::Failed).with_message(err.to_string()),
        );
        error!(execution_id = %execution.id, node_id, error = %err, "node_failed");
        Ok(())
    }

    /// Store the schema of a table output and queue it for downstream nodes.
    async fn record_schema(&self, graph: &WorkflowGraph, node_id: &str, output: &NodeOutput) {
        let NodeOutput::Table {
            data, sheet_name, ..
        } = output
        else {
            return;
        };
        let columns = infer_columns(data);
        if columns.is_empty() {
            return;
        }

        let sheet = sheet_name.as_deref();
        if let Err(e) = self
            .schemas
            .put_schema(&graph.workflow, node_id, sheet, columns)
            .await
        {
            warn!(node_id, error = %e, "schema not recorded");
            return;
        }

        if let Some(queue) = &self.propagation {
            for edge in graph.outgoing(node_id) {
                queue
                    .enqueue(&graph.workflow, node_id, &edge.target, sheet)
                    .await;
            }
        }
    }

    fn publish(&self, execution: &WorkflowExecution, event: StatusEvent) {
        self.channel
            .emit(event.in_workflow(execution.workflow.clone()));
    }
}

/// Inputs for a node, keyed by target handle.
///
/// Nodes without upstream dependencies also receive the execution's initial
/// inputs.
fn resolve_inputs(
    graph: &WorkflowGraph,
    plan: &ExecutionPlan,
    node_id: &str,
    outputs: &HashMap<String, NodeOutput>,
    initial: &Map<String, Value>,
) -> HashMap<String, Value> {
    let mut inputs = HashMap::new();
    if plan.dependencies(node_id).is_empty() {
        inputs.extend(initial.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let merging = graph
        .find_node(node_id)
        .is_some_and(|n| n.node_type == NodeType::Merge);
    for edge in graph.incoming(node_id) {
        if plan.is_feedback(edge) {
            continue;
        }
        let Some(value) = outputs
            .get(&edge.source)
            .and_then(|out| out.port(&edge.source_handle))
        else {
            continue;
        };
        // Merge nodes collect every source on a handle, in edge order
        if merging {
            if let Some(existing) = inputs.remove(&edge.target_handle) {
                let mut rows = into_rows(existing);
                rows.extend(into_rows(value));
                inputs.insert(edge.target_handle.clone(), Value::Array(rows));
                continue;
            }
        }
        inputs.insert(edge.target_handle.clone(), value);
    }
    inputs
}

fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        other => vec![other],
    }
}
