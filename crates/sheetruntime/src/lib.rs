//! Workflow execution runtime
//!
//! This crate runs workflow graphs: the schema registry and propagation
//! queue, the node executor, the workflow engine and the realtime status
//! channel, wired together by [`SheetRuntime`].

mod channel;
mod config;
mod engine;
mod executor;
mod plan;
pub mod propagation;
mod registry;
mod runtime;
mod schema_registry;
mod store;

pub use channel::{
    ChannelError, ChannelKey, EventStream, LocalTransport, StatusChannel, StatusTracker,
    StatusTransport, Subscription,
};
pub use config::{ChannelConfig, EngineConfig, PropagationConfig, RuntimeConfig};
pub use engine::{ExecutionHandle, WorkflowEngine};
pub use executor::NodeExecutor;
pub use plan::ExecutionPlan;
pub use propagation::{EnqueueOutcome, PropagationQueue, PropagationTask, TaskStatus};
pub use registry::{HandlerInfo, HandlerRegistry};
pub use runtime::SheetRuntime;
pub use schema_registry::SchemaRegistry;
pub use store::{MemoryStore, Store};
