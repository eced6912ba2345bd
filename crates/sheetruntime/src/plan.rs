use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use sheetcore::{Edge, GraphError, NodeId, NodeType, WorkflowGraph};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Execution order for one workflow graph.
///
/// Edges that close a cycle through a loop or merge node are feedback edges:
/// they carry data but do not order execution. Any other cycle is rejected.
#[derive(Debug)]
pub struct ExecutionPlan {
    order: Vec<NodeId>,
    dag: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    feedback: Vec<Edge>,
}

impl ExecutionPlan {
    pub fn build(workflow: &WorkflowGraph) -> Result<Self, GraphError> {
        let mut full = DiGraph::<NodeId, ()>::new();
        let mut index = HashMap::new();
        for node in &workflow.nodes {
            let idx = full.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        let mut resolved = Vec::with_capacity(workflow.edges.len());
        for edge in &workflow.edges {
            let from = *index
                .get(&edge.source)
                .ok_or_else(|| GraphError::NodeNotFound(edge.source.clone()))?;
            let to = *index
                .get(&edge.target)
                .ok_or_else(|| GraphError::NodeNotFound(edge.target.clone()))?;
            full.update_edge(from, to, ());
            resolved.push((edge, from, to));
        }

        let mut dag = full.clone();
        dag.clear_edges();
        let mut feedback = Vec::new();
        for (edge, from, to) in resolved {
            let accepts_feedback = workflow
                .find_node(&edge.target)
                .is_some_and(|n| matches!(n.node_type, NodeType::Loop | NodeType::Merge));
            if accepts_feedback && has_path_connecting(&full, to, from, None) {
                feedback.push(edge.clone());
            } else {
                dag.update_edge(from, to, ());
            }
        }

        let order = kahn(&dag)?;
        Ok(Self {
            order,
            dag,
            index,
            feedback,
        })
    }

    /// Nodes in execution order
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn is_feedback(&self, edge: &Edge) -> bool {
        self.feedback.contains(edge)
    }

    pub fn feedback_edges(&self) -> &[Edge] {
        &self.feedback
    }

    /// Direct upstream nodes that must finish first
    pub fn dependencies(&self, node_id: &str) -> Vec<&NodeId> {
        self.neighbors(node_id, Direction::Incoming)
    }

    pub fn dependents(&self, node_id: &str) -> Vec<&NodeId> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    /// Every node reachable from `node_id`, excluding itself
    pub fn reachable_from(&self, node_id: &str) -> HashSet<NodeId> {
        let mut reached = HashSet::new();
        let Some(&start) = self.index.get(node_id) else {
            return reached;
        };
        let mut dfs = Dfs::new(&self.dag, start);
        while let Some(idx) = dfs.next(&self.dag) {
            if idx != start {
                reached.insert(self.dag[idx].clone());
            }
        }
        reached
    }

    fn neighbors(&self, node_id: &str, dir: Direction) -> Vec<&NodeId> {
        match self.index.get(node_id) {
            Some(&idx) => {
                let mut found: Vec<NodeIndex> = self.dag.neighbors_directed(idx, dir).collect();
                found.sort();
                found.into_iter().map(|i| &self.dag[i]).collect()
            }
            None => Vec::new(),
        }
    }
}

/// Kahn's algorithm; ties go to the node added to the graph first.
fn kahn(dag: &DiGraph<NodeId, ()>) -> Result<Vec<NodeId>, GraphError> {
    let mut indegree: Vec<usize> = dag
        .node_indices()
        .map(|i| dag.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<NodeIndex> = dag
        .node_indices()
        .filter(|i| indegree[i.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(dag.node_count());
    while let Some(idx) = ready.pop_first() {
        order.push(dag[idx].clone());
        for next in dag.neighbors_directed(idx, Direction::Outgoing) {
            indegree[next.index()] -= 1;
            if indegree[next.index()] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() < dag.node_count() {
        let nodes = dag
            .node_indices()
            .filter(|i| indegree[i.index()] > 0)
            .map(|i| dag[i].clone())
            .collect();
        return Err(GraphError::Cycle { nodes });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetcore::{Node, WorkflowRef};

    fn graph(nodes: &[(&str, NodeType)], edges: &[(&str, &str)]) -> WorkflowGraph {
        let mut g = WorkflowGraph::new(WorkflowRef::draft("t"), "t");
        for (id, ty) in nodes {
            g.nodes.push(Node::new(*id, *ty));
        }
        for (from, to) in edges {
            g.edges.push(Edge::new(*from, "data", *to, format!("in-{}", from)));
        }
        g
    }

    #[test]
    fn orders_diamond() {
        let g = graph(
            &[
                ("d", NodeType::Log),
                ("b", NodeType::Log),
                ("c", NodeType::Log),
                ("a", NodeType::Log),
            ],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let plan = ExecutionPlan::build(&g).unwrap();
        assert_eq!(plan.order(), &["a", "b", "c", "d"]);
        assert_eq!(plan.dependencies("d"), vec!["b", "c"]);
    }

    #[test]
    fn rejects_plain_cycle() {
        let g = graph(
            &[("a", NodeType::Log), ("b", NodeType::Log), ("c", NodeType::Log)],
            &[("a", "b"), ("b", "c"), ("c", "b")],
        );
        match ExecutionPlan::build(&g) {
            Err(GraphError::Cycle { nodes }) => assert_eq!(nodes, vec!["b", "c"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn loop_back_edge_is_feedback() {
        let g = graph(
            &[
                ("src", NodeType::FileInput),
                ("loop", NodeType::Loop),
                ("body", NodeType::DataTransform),
            ],
            &[("src", "loop"), ("loop", "body"), ("body", "loop")],
        );
        let plan = ExecutionPlan::build(&g).unwrap();
        assert_eq!(plan.order(), &["src", "loop", "body"]);
        assert_eq!(plan.feedback_edges().len(), 1);
        assert_eq!(plan.dependencies("loop"), vec!["src"]);
    }

    #[test]
    fn reachability() {
        let g = graph(
            &[
                ("a", NodeType::Log),
                ("b", NodeType::Log),
                ("c", NodeType::Log),
                ("x", NodeType::Log),
            ],
            &[("a", "b"), ("b", "c")],
        );
        let plan = ExecutionPlan::build(&g).unwrap();
        let reached = plan.reachable_from("a");
        assert_eq!(reached.len(), 2);
        assert!(reached.contains("b") && reached.contains("c"));
        assert!(plan.reachable_from("x").is_empty());
    }
}
