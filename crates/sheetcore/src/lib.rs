//! Core abstractions for the sheet workflow engine
//!
//! This crate provides the graph, node, schema and execution types plus the
//! handler and service traits every other crate depends on.

mod error;
pub mod events;
mod execution;
mod node;
mod schema;
pub mod services;
mod workflow;

pub use error::{ErrorKind, FlowError, GraphError, NodeError, RegistryError, StoreError};
pub use events::*;
pub use execution::{
    ExecutionId, ExecutionStatus, LogEntry, LogLevel, NodeRun, NodeStatus, WorkflowExecution,
};
pub use node::{type_name, NodeContext, NodeHandler, NodeOutput};
pub use schema::{infer_columns, Column, DataType, SchemaKey, SchemaRecord};
pub use workflow::{
    Config, Edge, Node, NodeCategory, NodeId, NodeType, Position, WorkflowGraph, WorkflowId,
    WorkflowRef,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
