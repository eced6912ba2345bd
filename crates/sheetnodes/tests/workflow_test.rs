use serde_json::{json, Map, Value};
use sheetcore::services::FileStore;
use sheetcore::{
    DataType, ExecutionStatus, Node, NodeStatus, NodeType, WorkflowGraph, WorkflowRef,
};
use sheetnodes::{standard_registry, MemoryFileStore, Services};
use sheetruntime::SheetRuntime;
use std::sync::Arc;
use std::time::Duration;

fn runtime_with_files() -> (SheetRuntime, Arc<MemoryFileStore>) {
    let files = Arc::new(MemoryFileStore::new());
    let services = Services::new(files.clone());
    (SheetRuntime::new(standard_registry(&services)), files)
}

async fn upload_sales(files: &MemoryFileStore) {
    let sheets = json!({
        "Sales": [
            {"region": "north", "amount": 120},
            {"region": "south", "amount": 40},
            {"region": "north", "amount": 75},
        ]
    });
    files
        .upload("uploads/sales.json", serde_json::to_vec(&sheets).unwrap())
        .await
        .unwrap();
}

/// upload -> filter -> generate
fn report_graph(workflow: WorkflowRef, column: &str) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new(workflow, "north report");
    graph
        .add_node(
            Node::new("upload", NodeType::FileInput)
                .with_config("file_id", "uploads/sales.json")
                .with_config("sheet_name", "Sales"),
        )
        .unwrap();
    graph
        .add_node(Node::new("filter", NodeType::DataTransform).with_config(
            "operations",
            json!([{"op": "filter", "column": column, "operator": "eq", "value": "north"}]),
        ))
        .unwrap();
    graph
        .add_node(
            Node::new("generate", NodeType::SpreadsheetGenerator)
                .with_config("filename", "north.csv"),
        )
        .unwrap();
    graph.connect("upload", "data", "filter", "data").unwrap();
    graph.connect("filter", "data", "generate", "data").unwrap();
    graph
}

#[tokio::test]
async fn test_report_workflow_writes_csv() {
    let (rt, files) = runtime_with_files();
    upload_sales(&files).await;
    let workflow = WorkflowRef::new_persisted();
    rt.save_workflow(&report_graph(workflow.clone(), "region"))
        .await
        .unwrap();

    let execution = rt.execute(&workflow, Map::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.count(NodeStatus::Completed), 3);

    let expected_path = format!("generated/{}/north.csv", execution.id);
    assert_eq!(files.paths().await, vec![expected_path.clone(), "uploads/sales.json".to_string()]);
    let csv = String::from_utf8(files.download(&expected_path).await.unwrap()).unwrap();
    assert_eq!(csv, "region,amount\nnorth,120\nnorth,75\n");

    // Only the sink contributes to execution outputs
    let output = execution.outputs.get("generate").unwrap();
    assert_eq!(output["filename"], json!("north.csv"));
    assert!(!execution.outputs.contains_key("filter"));

    // The upload's schema is recorded under its sheet
    let record = rt
        .schemas()
        .get_schema(&workflow, "upload", Some("Sales"))
        .await
        .unwrap()
        .unwrap();
    let names: Vec<&str> = record.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["region", "amount"]);
    assert_eq!(record.columns[1].data_type, DataType::Number);
}

#[tokio::test]
async fn test_missing_column_fails_filter_and_skips_generate() {
    let (rt, files) = runtime_with_files();
    upload_sales(&files).await;
    let workflow = WorkflowRef::new_persisted();
    rt.save_workflow(&report_graph(workflow.clone(), "territory"))
        .await
        .unwrap();

    let execution = rt.execute(&workflow, Map::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.node_status("upload"), Some(NodeStatus::Completed));
    let filter = execution.node("filter").unwrap();
    assert_eq!(filter.status, NodeStatus::Failed);
    assert_eq!(filter.attempts, 1);
    assert!(filter.error.as_deref().unwrap().contains("territory"));
    assert_eq!(execution.node_status("generate"), Some(NodeStatus::Skipped));
    assert_eq!(files.paths().await, vec!["uploads/sales.json".to_string()]);
}

#[tokio::test]
async fn test_missing_upload_skips_everything_downstream() {
    let (rt, files) = runtime_with_files();
    let workflow = WorkflowRef::draft("scratch");
    rt.save_workflow(&report_graph(workflow.clone(), "region"))
        .await
        .unwrap();

    let execution = rt.execute(&workflow, Map::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.node_status("upload"), Some(NodeStatus::Failed));
    assert_eq!(execution.node_status("filter"), Some(NodeStatus::Skipped));
    assert_eq!(execution.node_status("generate"), Some(NodeStatus::Skipped));
    assert!(files.paths().await.is_empty());
}

#[tokio::test]
async fn test_conditional_routes_each_branch() {
    let (rt, _files) = runtime_with_files();
    let workflow = WorkflowRef::new_persisted();
    let mut graph = WorkflowGraph::new(workflow.clone(), "split");
    graph
        .add_node(Node::new("rows", NodeType::FileInput).with_config(
            "rows",
            json!([{"amount": 5}, {"amount": 50}, {"amount": 500}]),
        ))
        .unwrap();
    graph
        .add_node(
            Node::new("branch", NodeType::Conditional)
                .with_config("column", "amount")
                .with_config("operator", "gt")
                .with_config("value", 10),
        )
        .unwrap();
    graph
        .add_node(Node::new("big", NodeType::Log).with_config("message", "big"))
        .unwrap();
    graph
        .add_node(Node::new("small", NodeType::Log).with_config("message", "small"))
        .unwrap();
    graph.connect("rows", "data", "branch", "data").unwrap();
    graph.connect("branch", "true", "big", "data").unwrap();
    graph.connect("branch", "false", "small", "data").unwrap();
    rt.save_workflow(&graph).await.unwrap();

    let execution = rt.execute(&workflow, Map::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let rows_of = |id: &str| -> Value {
        execution.node(id).unwrap().output.as_ref().unwrap().port("data").unwrap()
    };
    assert_eq!(rows_of("big"), json!([{"amount": 50}, {"amount": 500}]));
    assert_eq!(rows_of("small"), json!([{"amount": 5}]));
}

#[tokio::test]
async fn test_merge_combines_two_sources() {
    let (rt, _files) = runtime_with_files();
    let workflow = WorkflowRef::new_persisted();
    let mut graph = WorkflowGraph::new(workflow.clone(), "merge");
    graph
        .add_node(Node::new("east", NodeType::FileInput).with_config("rows", json!([{"id": 1}])))
        .unwrap();
    graph
        .add_node(Node::new("west", NodeType::FileInput).with_config("rows", json!([{"id": 2}, {"id": 3}])))
        .unwrap();
    graph.add_node(Node::new("all", NodeType::Merge)).unwrap();
    graph.connect("east", "data", "all", "data").unwrap();
    graph.connect("west", "data", "all", "data").unwrap();
    rt.save_workflow(&graph).await.unwrap();

    let execution = rt.execute(&workflow, Map::new()).await.unwrap();

    let merged = execution.outputs.get("all").unwrap();
    assert_eq!(merged["data"], json!([{"id": 1}, {"id": 2}, {"id": 3}]));
}

#[tokio::test(start_paused = true)]
async fn test_delay_node_holds_the_branch() {
    let (rt, _files) = runtime_with_files();
    let workflow = WorkflowRef::new_persisted();
    let mut graph = WorkflowGraph::new(workflow.clone(), "slow");
    graph
        .add_node(Node::new("rows", NodeType::FileInput).with_config("rows", json!([{"id": 1}])))
        .unwrap();
    graph
        .add_node(Node::new("wait", NodeType::Delay).with_config("delay_ms", 2_000))
        .unwrap();
    graph
        .add_node(Node::new("batch", NodeType::Loop).with_config("batch_size", 1))
        .unwrap();
    graph.connect("rows", "data", "wait", "data").unwrap();
    graph.connect("wait", "data", "batch", "data").unwrap();
    rt.save_workflow(&graph).await.unwrap();

    let started = tokio::time::Instant::now();
    let execution = rt.execute(&workflow, Map::new()).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let batch = execution.node("batch").unwrap().output.as_ref().unwrap();
    assert_eq!(batch.port("count"), Some(json!(1)));
}
