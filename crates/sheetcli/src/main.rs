use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use sheetcore::{
    EntityId, EventStatus, Node, NodeType, StatusEvent, WorkflowGraph, WorkflowRef,
};
use sheetnodes::{standard_registry, HttpAiGateway, LocalFileStore, Services};
use sheetruntime::{ChannelKey, ExecutionPlan, RuntimeConfig, SheetRuntime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sheetflow")]
#[command(about = "Spreadsheet workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Initial inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime settings as a JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory that file ids resolve against
        #[arg(long, default_value = ".")]
        files: PathBuf,

        /// Show debug logs
        #[arg(short, long)]
        verbose: bool,
    },

    /// Check a workflow file for structural errors and cycles
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create an example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            files,
            verbose,
        } => {
            init_tracing(verbose);
            run_workflow(&file, input, config, files).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(&file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }
    }

    Ok(())
}

fn load_graph(file: &Path) -> Result<WorkflowGraph> {
    tracing::debug!(file = %file.display(), "loading workflow");
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a workflow", file.display()))
}

fn parse_inputs(input: Option<String>) -> Result<Map<String, Value>> {
    let Some(text) = input else {
        return Ok(Map::new());
    };
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        _ => bail!("Input must be a JSON object"),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_json_file(&path)
            .with_context(|| format!("cannot load config {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn services(files: PathBuf) -> Services {
    let services = Services::new(Arc::new(LocalFileStore::new(files)));
    match HttpAiGateway::openai_from_env() {
        Some(gateway) => services.with_ai(Arc::new(gateway)),
        None => services,
    }
}

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn ends_execution(event: &StatusEvent) -> bool {
    matches!(event.entity_id, EntityId::Execution(_))
        && matches!(
            event.status,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Cancelled
        )
}

fn describe(event: &StatusEvent) -> String {
    let subject = match &event.entity_id {
        EntityId::Execution(_) => "workflow".to_string(),
        EntityId::Node(id) => format!("node {}", id),
    };
    let detail = event.message.as_deref().unwrap_or("");
    match event.status {
        EventStatus::Progress => {
            format!("  [{}] {:.0}% {}", subject, event.progress.unwrap_or(0.0), detail)
        }
        EventStatus::Info => format!("  [{}] {}", subject, detail),
        EventStatus::Warning => format!("  [{}] warning: {}", subject, detail),
        status => {
            let label = serde_json::to_value(status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            format!("{} {} {}", subject, label, detail)
        }
    }
}

async fn run_workflow(
    file: &Path,
    input: Option<String>,
    config: Option<PathBuf>,
    files: PathBuf,
) -> Result<()> {
    let graph = load_graph(file)?;
    let inputs = parse_inputs(input)?;
    let config = load_config(config)?;

    println!("Workflow: {} ({})", graph.name, graph.workflow);
    println!("  Nodes: {}", graph.nodes.len());
    println!("  Edges: {}", graph.edges.len());
    println!();

    let registry = standard_registry(&services(files));
    let runtime = SheetRuntime::with_config(registry, config);
    runtime.save_workflow(&graph).await?;
    runtime.start_workers();

    let mut subscription = runtime
        .subscribe(ChannelKey::Workflow(graph.workflow.clone()), "cli")
        .await;
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            println!("{}", describe(&event));
            if ends_execution(&event) {
                break;
            }
        }
    });

    let result = runtime.execute(&graph.workflow, inputs).await;
    // Let the printer catch up with the final status before closing the channel
    if tokio::time::timeout(DRAIN_TIMEOUT, printer).await.is_err() {
        tracing::debug!("status stream did not finish before shutdown");
    }
    runtime.shutdown().await;
    let execution = result?;

    println!();
    println!("Execution {}: {}", execution.id, execution.status);
    for (node_id, run) in &execution.nodes {
        match &run.error {
            Some(error) => println!("  {} {} ({})", node_id, run.status, error),
            None => println!("  {} {}", node_id, run.status),
        }
    }

    if !execution.outputs.is_empty() {
        println!();
        println!("Outputs:");
        for (node_id, output) in &execution.outputs {
            println!("  {}: {}", node_id, output);
        }
    }

    Ok(())
}

fn validate_workflow(file: &Path) -> Result<()> {
    let graph = load_graph(file)?;
    graph.validate()?;
    standard_registry(&Services::in_memory()).check(&graph)?;
    let plan = ExecutionPlan::build(&graph)?;

    println!("Workflow is valid: {}", graph.name);
    println!("  Order: {}", plan.order().join(" -> "));
    if !plan.feedback_edges().is_empty() {
        println!("  Feedback edges: {}", plan.feedback_edges().len());
    }
    Ok(())
}

fn list_nodes() {
    println!("Available node types:");
    println!();

    let registry = standard_registry(&Services::in_memory());
    for info in registry.info() {
        println!("  {} ({})", info.node_type, info.category);
        println!("    {}", info.description);
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut graph = WorkflowGraph::new(WorkflowRef::draft("example"), "Regional report");
    graph.description = Some("Filters uploaded sales rows and writes a CSV".to_string());

    graph.add_node(
        Node::new("upload", NodeType::FileInput)
            .with_name("Sales upload")
            .with_config("file_id", "sales.json")
            .with_position(100.0, 100.0),
    )?;
    graph.add_node(
        Node::new("filter", NodeType::DataTransform)
            .with_name("North only")
            .with_config(
                "operations",
                json!([{"op": "filter", "column": "region", "operator": "eq", "value": "north"}]),
            )
            .with_position(300.0, 100.0),
    )?;
    graph.add_node(
        Node::new("generate", NodeType::SpreadsheetGenerator)
            .with_name("Report")
            .with_config("filename", "north.csv")
            .with_position(500.0, 100.0),
    )?;
    graph.connect("upload", "data", "filter", "data")?;
    graph.connect("filter", "data", "generate", "data")?;

    std::fs::write(output, serde_json::to_string_pretty(&graph)?)?;

    println!("Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  sheetflow run --file {}", output.display());
    Ok(())
}
