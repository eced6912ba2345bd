use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Schema registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How the engine should react to a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration. Never retried.
    Validation,
    /// Network, provider or storage hiccup. Retried with bounded backoff.
    Transient,
    /// Unexpected fault. Halts the node, unaffected branches keep going.
    Fatal,
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Execution failed: {0}")]
    Fatal(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::MissingInput(_)
            | NodeError::InvalidInputType { .. }
            | NodeError::Configuration(_) => ErrorKind::Validation,
            NodeError::Transient(_) | NodeError::Timeout { .. } => ErrorKind::Transient,
            NodeError::Fatal(_) | NodeError::Cancelled => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn config(message: impl Into<String>) -> Self {
        NodeError::Configuration(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        NodeError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        NodeError::Fatal(message.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cycle detected among nodes: {}", nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node {node} is still referenced by {edges} edge(s)")]
    NodeInUse { node: String, edges: usize },

    #[error("Input '{handle}' of node {target} is already fed by {existing}; add a merge node")]
    DuplicateInput {
        target: String,
        handle: String,
        existing: String,
    },

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
}

#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("Schema store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Backend hiccups may succeed when retried; conflicts never do
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        RegistryError::Unavailable(e.to_string())
    }
}
