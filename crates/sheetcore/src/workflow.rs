use crate::{Column, GraphError, NodeStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = String;
pub type Config = serde_json::Map<String, serde_json::Value>;

/// Identity of a workflow graph.
///
/// A graph built in the editor lives under a local draft id until it is saved;
/// saving assigns a permanent id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRef {
    Draft(String),
    Persisted(WorkflowId),
}

impl WorkflowRef {
    pub fn draft(local_id: impl Into<String>) -> Self {
        WorkflowRef::Draft(local_id.into())
    }

    pub fn new_persisted() -> Self {
        WorkflowRef::Persisted(Uuid::new_v4())
    }

    pub fn is_draft(&self) -> bool {
        matches!(self, WorkflowRef::Draft(_))
    }

    pub fn persisted_id(&self) -> Option<WorkflowId> {
        match self {
            WorkflowRef::Persisted(id) => Some(*id),
            WorkflowRef::Draft(_) => None,
        }
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowRef::Draft(id) => write!(f, "draft:{}", id),
            WorkflowRef::Persisted(id) => write!(f, "{}", id),
        }
    }
}

/// Coarse grouping of node types, used for display and listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Input,
    Processing,
    Ai,
    Output,
    Integration,
    Control,
    Utility,
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeCategory::Input => "input",
            NodeCategory::Processing => "processing",
            NodeCategory::Ai => "ai",
            NodeCategory::Output => "output",
            NodeCategory::Integration => "integration",
            NodeCategory::Control => "control",
            NodeCategory::Utility => "utility",
        };
        f.write_str(name)
    }
}

/// Every node type the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    FileInput,
    DataTransform,
    AiAnalysis,
    SpreadsheetGenerator,
    HttpIntegration,
    Loop,
    Merge,
    Conditional,
    Log,
    Delay,
}

impl NodeType {
    pub const ALL: [NodeType; 10] = [
        NodeType::FileInput,
        NodeType::DataTransform,
        NodeType::AiAnalysis,
        NodeType::SpreadsheetGenerator,
        NodeType::HttpIntegration,
        NodeType::Loop,
        NodeType::Merge,
        NodeType::Conditional,
        NodeType::Log,
        NodeType::Delay,
    ];

    pub fn category(self) -> NodeCategory {
        match self {
            NodeType::FileInput => NodeCategory::Input,
            NodeType::DataTransform => NodeCategory::Processing,
            NodeType::AiAnalysis => NodeCategory::Ai,
            NodeType::SpreadsheetGenerator => NodeCategory::Output,
            NodeType::HttpIntegration => NodeCategory::Integration,
            NodeType::Loop | NodeType::Merge | NodeType::Conditional => NodeCategory::Control,
            NodeType::Log | NodeType::Delay => NodeCategory::Utility,
        }
    }

    pub fn is_control(self) -> bool {
        self.category() == NodeCategory::Control
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::FileInput => "file_input",
            NodeType::DataTransform => "data_transform",
            NodeType::AiAnalysis => "ai_analysis",
            NodeType::SpreadsheetGenerator => "spreadsheet_generator",
            NodeType::HttpIntegration => "http_integration",
            NodeType::Loop => "loop",
            NodeType::Merge => "merge",
            NodeType::Conditional => "conditional",
            NodeType::Log => "log",
            NodeType::Delay => "delay",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete workflow graph as edited in the builder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub workflow: WorkflowRef,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn new(workflow: WorkflowRef, name: impl Into<String>) -> Self {
        Self {
            workflow,
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        if self.find_node(&node.id).is_some() {
            return Err(GraphError::DuplicateNode(node.id));
        }
        let id = node.id.clone();
        self.nodes.push(node);
        Ok(id)
    }

    /// Add an edge after checking both endpoints and the single-source input rule.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        if self.edges.contains(&edge) {
            return Ok(());
        }
        self.check_edge(&edge, &self.edges)?;
        self.edges.push(edge);
        Ok(())
    }

    pub fn connect(
        &mut self,
        source: impl Into<NodeId>,
        source_handle: impl Into<String>,
        target: impl Into<NodeId>,
        target_handle: impl Into<String>,
    ) -> Result<(), GraphError> {
        self.add_edge(Edge::new(source, source_handle, target, target_handle))
    }

    pub fn remove_edge(&mut self, edge: &Edge) -> bool {
        let before = self.edges.len();
        self.edges.retain(|e| e != edge);
        self.edges.len() != before
    }

    /// Remove a node. Fails while any edge still references it.
    pub fn remove_node(&mut self, id: &str) -> Result<Node, GraphError> {
        let edges = self
            .edges
            .iter()
            .filter(|e| e.source == id || e.target == id)
            .count();
        if edges > 0 {
            return Err(GraphError::NodeInUse {
                node: id.to_string(),
                edges,
            });
        }
        let pos = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        Ok(self.nodes.remove(pos))
    }

    pub fn update_config(
        &mut self,
        id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), GraphError> {
        let node = self
            .find_node_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        node.config.insert(key.into(), value);
        Ok(())
    }

    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Re-check every invariant, e.g. after loading a graph from JSON.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }
        for (i, edge) in self.edges.iter().enumerate() {
            self.check_edge(edge, &self.edges[..i])?;
        }
        Ok(())
    }

    fn check_edge(&self, edge: &Edge, existing: &[Edge]) -> Result<(), GraphError> {
        if self.find_node(&edge.source).is_none() {
            return Err(GraphError::NodeNotFound(edge.source.clone()));
        }
        let target = self
            .find_node(&edge.target)
            .ok_or_else(|| GraphError::NodeNotFound(edge.target.clone()))?;
        if edge.source == edge.target && target.node_type != NodeType::Loop {
            return Err(GraphError::InvalidConnection(format!(
                "node {} cannot feed itself",
                edge.source
            )));
        }
        if target.node_type == NodeType::Merge {
            return Ok(());
        }
        if let Some(other) = existing.iter().find(|e| {
            e.target == edge.target
                && e.target_handle == edge.target_handle
                && e.source != edge.source
        }) {
            return Err(GraphError::DuplicateInput {
                target: edge.target.clone(),
                handle: edge.target_handle.clone(),
                existing: other.source.clone(),
            });
        }
        Ok(())
    }
}

/// Node in a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Config,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Vec<Column>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            name: None,
            config: Config::new(),
            schema: None,
            last_status: None,
            position: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Directed link between two node handles
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub source_handle: String,
    pub target: NodeId,
    pub target_handle: String,
}

impl Edge {
    pub fn new(
        source: impl Into<NodeId>,
        source_handle: impl Into<String>,
        target: impl Into<NodeId>,
        target_handle: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_handle: source_handle.into(),
            target: target.into(),
            target_handle: target_handle.into(),
        }
    }
}

/// Node position in the visual editor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}
