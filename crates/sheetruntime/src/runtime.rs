use crate::channel::{ChannelKey, StatusChannel, StatusTransport, Subscription};
use crate::config::RuntimeConfig;
use crate::engine::{ExecutionHandle, WorkflowEngine};
use crate::executor::NodeExecutor;
use crate::propagation::{EnqueueOutcome, PropagationQueue};
use crate::registry::HandlerRegistry;
use crate::schema_registry::SchemaRegistry;
use crate::store::{MemoryStore, Store};
use serde_json::{Map, Value};
use sheetcore::{
    Edge, EventSink, ExecutionId, FlowError, WorkflowExecution, WorkflowGraph, WorkflowRef,
};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Main entry point: wires the store, handlers, engine, propagation queue and
/// status channel together.
pub struct SheetRuntime {
    config: RuntimeConfig,
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    schemas: SchemaRegistry,
    propagation: Arc<PropagationQueue>,
    channel: Arc<StatusChannel>,
    engine: Arc<WorkflowEngine>,
    workers: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SheetRuntime {
    /// Runtime with default settings and an in-memory store
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: HandlerRegistry, config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(registry), config)
    }

    /// Share an already built registry
    pub fn with_registry(registry: Arc<HandlerRegistry>, config: RuntimeConfig) -> Self {
        let channel = Arc::new(StatusChannel::local(config.channel.clone()));
        Self::assemble(registry, Arc::new(MemoryStore::new()), channel, config)
    }

    /// Runtime over caller-provided storage and event transport
    pub fn with_parts(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn Store>,
        transport: Arc<dyn StatusTransport>,
        config: RuntimeConfig,
    ) -> Self {
        let channel = Arc::new(StatusChannel::new(transport, config.channel.clone()));
        Self::assemble(registry, store, channel, config)
    }

    fn assemble(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn Store>,
        channel: Arc<StatusChannel>,
        config: RuntimeConfig,
    ) -> Self {
        let schemas = SchemaRegistry::new(Arc::clone(&store));
        let propagation = Arc::new(
            PropagationQueue::new(schemas.clone(), config.propagation.clone())
                .with_events(Arc::clone(&channel) as Arc<dyn EventSink>),
        );
        let engine = Arc::new(
            WorkflowEngine::new(
                Arc::clone(&store),
                NodeExecutor::new(Arc::clone(&registry)),
                Arc::clone(&channel),
                config.engine.clone(),
            )
            .with_propagation(Arc::clone(&propagation)),
        );

        Self {
            config,
            store,
            registry,
            schemas,
            propagation,
            channel,
            engine,
            workers: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Start the propagation worker. Calling it again has no effect.
    pub fn start_workers(&self) {
        if let Some(handle) = self.propagation.spawn_worker(self.workers.child_token()) {
            info!("propagation worker started");
            let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
            *worker = Some(handle);
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn propagation(&self) -> &Arc<PropagationQueue> {
        &self.propagation
    }

    pub fn channel(&self) -> &Arc<StatusChannel> {
        &self.channel
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Validate and store a graph, replacing any previous version.
    pub async fn save_workflow(&self, graph: &WorkflowGraph) -> Result<(), FlowError> {
        graph.validate()?;
        self.registry.check(graph)?;
        self.store.save_graph(graph).await?;
        info!(workflow = %graph.workflow, nodes = graph.nodes.len(), "workflow saved");
        Ok(())
    }

    /// Add an edge to a stored graph and queue the target for a schema update.
    pub async fn connect(
        &self,
        workflow: &WorkflowRef,
        edge: Edge,
    ) -> Result<EnqueueOutcome, FlowError> {
        let mut graph = self
            .store
            .get_graph(workflow)
            .await?
            .ok_or_else(|| sheetcore::GraphError::NotFound(workflow.to_string()))?;
        let (source, target) = (edge.source.clone(), edge.target.clone());
        graph.add_edge(edge)?;
        self.store.save_graph(&graph).await?;

        Ok(self
            .propagation
            .enqueue_forced(workflow, &source, &target, None)
            .await)
    }

    pub async fn execute(
        &self,
        workflow: &WorkflowRef,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowExecution, FlowError> {
        self.engine.execute(workflow, inputs).await
    }

    pub async fn start(
        &self,
        workflow: &WorkflowRef,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionHandle, FlowError> {
        self.engine.start(workflow, inputs).await
    }

    pub async fn cancel(&self, execution_id: ExecutionId) -> bool {
        self.engine.cancel(execution_id).await
    }

    pub async fn execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, FlowError> {
        self.engine.execution(execution_id).await
    }

    pub async fn subscribe(&self, key: ChannelKey, subscriber: impl Into<String>) -> Subscription {
        self.channel.subscribe(key, subscriber).await
    }

    /// Give a draft workflow its permanent id
    pub async fn promote_draft(&self, draft: &WorkflowRef) -> Result<WorkflowRef, FlowError> {
        let promoted = self.store.promote_draft(draft).await?;
        info!(draft = %draft, workflow = %promoted, "draft promoted");
        Ok(promoted)
    }

    /// Stop workers, cancel executions and close subscriptions.
    pub async fn shutdown(&self) {
        self.workers.cancel();
        self.engine.shutdown().await;
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.channel.close_all();
        info!("runtime stopped");
    }
}
