//! flowrun: runs a workflow document from the command line and prints the
//! run's events as JSON lines.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use flowdispatch::capability::{ModelPricing, ScoredChunk, ScriptedChat, StaticDataset};
use flowdispatch::{
    parse_workflow, Capabilities, DslFormat, EngineConfig, NodeExecutorRegistry, RunEvent,
    RunOutcome, RunRequest, RunSnapshot, WorkflowError, WorkflowResult, WorkflowRunner,
};

#[derive(Parser)]
#[command(name = "flowrun")]
#[command(about = "Run workflow documents and stream their events", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a workflow document without running it
    Validate {
        /// Workflow document (.json, .yaml or .toml)
        workflow: PathBuf,
    },
    /// Run a workflow document
    Run {
        /// Workflow document (.json, .yaml or .toml)
        workflow: PathBuf,
        /// The user's question
        #[arg(short, long, default_value = "")]
        query: String,
        /// Run variable as KEY=VALUE; VALUE is parsed as JSON when possible
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// JSON run request; --query and --var are applied on top
        #[arg(long)]
        request: Option<PathBuf>,
        /// Engine configuration (.json or .toml)
        #[arg(short, long, env = "FLOWRUN_CONFIG")]
        config: Option<PathBuf>,
        /// Model price table (JSON object keyed by model id)
        #[arg(long)]
        pricing: Option<PathBuf>,
        /// Dataset chunks returned for every search (JSON array)
        #[arg(long)]
        dataset: Option<PathBuf>,
        /// Resume from a snapshot written by --save-snapshot
        #[arg(long, requires = "reply")]
        resume: Option<PathBuf>,
        /// Reply to the paused interactive node (JSON)
        #[arg(long)]
        reply: Option<String>,
        /// Where to write the snapshot if the run pauses
        #[arg(long)]
        save_snapshot: Option<PathBuf>,
    },
}

fn read(path: &Path) -> WorkflowResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| WorkflowError::InternalError(format!("{}: {}", path.display(), e)))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> WorkflowResult<T> {
    serde_json::from_str(&read(path)?)
        .map_err(|e| WorkflowError::DslParseError(format!("{}: {}", path.display(), e)))
}

fn parse_var(raw: &str) -> WorkflowResult<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| WorkflowError::DslParseError(format!("expected KEY=VALUE, got '{}'", raw)))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn load_config(path: Option<&Path>) -> WorkflowResult<EngineConfig> {
    match path {
        None => Ok(EngineConfig::default()),
        Some(path) => match DslFormat::from_path(path) {
            DslFormat::Toml => EngineConfig::from_toml(&read(path)?),
            _ => EngineConfig::from_json(&read(path)?),
        },
    }
}

fn validate(workflow: &Path) -> WorkflowResult<ExitCode> {
    let schema = parse_workflow(&read(workflow)?, DslFormat::from_path(workflow))?;
    let registry = NodeExecutorRegistry::with_builtins();
    let plugins = schema.plugin_arena(&registry)?;
    let graph = schema.into_graph(&registry)?;
    println!(
        "ok: {} nodes, {} edges, {} plugins",
        graph.nodes().len(),
        graph.edges().len(),
        plugins.len()
    );
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::too_many_arguments)]
async fn run(
    workflow: &Path,
    query: String,
    vars: Vec<String>,
    request: Option<PathBuf>,
    config: Option<PathBuf>,
    pricing: Option<PathBuf>,
    dataset: Option<PathBuf>,
    resume: Option<(PathBuf, String)>,
    save_snapshot: Option<PathBuf>,
) -> WorkflowResult<ExitCode> {
    let schema = parse_workflow(&read(workflow)?, DslFormat::from_path(workflow))?;
    let mut request: RunRequest = match request {
        Some(path) => read_json(&path)?,
        None => RunRequest::default(),
    };
    if !query.is_empty() {
        request.query = query;
    }
    for raw in &vars {
        let (key, value) = parse_var(raw)?;
        request.variables.insert(key, value);
    }

    let pricing: ModelPricing = match pricing {
        Some(path) => read_json(&path)?,
        None => ModelPricing::default(),
    };
    let chunks: Vec<ScoredChunk> = match dataset {
        Some(path) => read_json(&path)?,
        None => Vec::new(),
    };
    // No model provider is wired into the CLI: the scripted chat echoes the
    // question back.
    let capabilities = Capabilities::default()
        .with_chat(Arc::new(ScriptedChat::new()))
        .with_dataset(Arc::new(StaticDataset::new(chunks)))
        .with_pricing(pricing);

    let registry = Arc::new(NodeExecutorRegistry::with_builtins());
    let runner = WorkflowRunner::from_schema(schema, registry)?
        .capabilities(capabilities)
        .config(load_config(config.as_deref())?)
        .build();
    let mut handle = match resume {
        Some((path, reply)) => {
            let snapshot = RunSnapshot::from_json(&read(&path)?)?;
            let reply = serde_json::from_str(&reply).unwrap_or(Value::String(reply));
            runner.resume(request, snapshot, reply)
        }
        None => runner.spawn(request),
    };
    tracing::info!(run_id = %handle.run_id(), workflow = %workflow.display(), "run spawned");

    while let Some(event) = handle.next_event().await {
        // Snapshots go to --save-snapshot, not the terminal.
        let line = match &event {
            RunEvent::RunPause { interactive, .. } => {
                serde_json::json!({ "event": "run_pause", "interactive": interactive }).to_string()
            }
            other => serde_json::to_string(other)
                .map_err(|e| WorkflowError::InternalError(e.to_string()))?,
        };
        println!("{}", line);
    }

    match handle.outcome().await? {
        RunOutcome::Completed(_) => Ok(ExitCode::SUCCESS),
        RunOutcome::Paused { snapshot, .. } => {
            if let Some(path) = save_snapshot {
                std::fs::write(&path, snapshot.to_json()?).map_err(|e| {
                    WorkflowError::InternalError(format!("{}: {}", path.display(), e))
                })?;
                tracing::info!(path = %path.display(), "snapshot saved");
            }
            Ok(ExitCode::from(2))
        }
        RunOutcome::Failed { .. } => Ok(ExitCode::FAILURE),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Validate { workflow } => validate(&workflow),
        Commands::Run {
            workflow,
            query,
            vars,
            request,
            config,
            pricing,
            dataset,
            resume,
            reply,
            save_snapshot,
        } => {
            let resume = resume.zip(reply);
            run(
                &workflow,
                query,
                vars,
                request,
                config,
                pricing,
                dataset,
                resume,
                save_snapshot,
            )
            .await
        }
    };
    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error ({}): {}", error.kind(), error);
            ExitCode::FAILURE
        }
    }
}
