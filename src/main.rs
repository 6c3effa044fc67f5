//! Toolbrain CLI.
//!
//! Thin front-end over the library: every subcommand goes through the same
//! supervisor and orchestrator API an embedding service would use.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use toolbrain::agent_core::{ConversationOrchestrator, WorkflowTracker};
use toolbrain::config::{self, BrainConfig};
use toolbrain::inference::OpenAiCompatClient;
use toolbrain::mcp_client::Supervisor;
use toolbrain::LogOptions;

#[derive(Parser)]
#[command(name = "toolbrain")]
#[command(about = "Tool-server supervisor and tool-use orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to toolbrain.yaml in this or a parent directory)
    #[arg(long, global = true, env = "TOOLBRAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Log to the data directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tools every live server exposes
    Tools,

    /// Invoke one tool and print its result
    Call {
        /// Qualified tool name, e.g. `echo_ping`
        name: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
    },

    /// Run a tool-use conversation, printing each iteration as a JSON line
    Run {
        #[arg(long)]
        prompt: String,

        /// Overrides `llm.model`
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        max_iterations: Option<u32>,

        /// Only offer tools whose qualified name contains one of these
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
    },

    /// Start the configured servers and report their status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    toolbrain::init_tracing(&LogOptions {
        json: cli.log_json,
        log_dir: cli.log_file.then(toolbrain::data_dir),
    })
    .context("failed to initialize logging")?;

    let config_path = match cli.config {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            config::find_config_path(&cwd)?
        }
    };
    let config = BrainConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let supervisor = Arc::new(
        Supervisor::new(config.descriptors(), config.supervisor_settings())
            .context("invalid server configuration")?,
    );

    let result = match cli.command {
        Commands::Tools => list_tools(&supervisor).await,
        Commands::Call { name, arguments } => call(&supervisor, &name, &arguments).await,
        Commands::Run {
            prompt,
            model,
            max_iterations,
            tools,
        } => run(&supervisor, &config, prompt, model, max_iterations, tools).await,
        Commands::Status => status(&supervisor).await,
    };

    supervisor.cleanup().await;
    result
}

async fn list_tools(supervisor: &Arc<Supervisor>) -> Result<()> {
    supervisor.start_all().await;
    for tool in supervisor.list_tools().await {
        println!("{:<32} {}", tool.qualified_name, tool.description);
    }
    Ok(())
}

async fn call(supervisor: &Arc<Supervisor>, name: &str, arguments: &str) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(arguments).context("arguments must be valid JSON")?;
    supervisor.start_all().await;

    let result = supervisor.invoke(name, arguments).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run(
    supervisor: &Arc<Supervisor>,
    config: &BrainConfig,
    prompt: String,
    model: Option<String>,
    max_iterations: Option<u32>,
    tools: Vec<String>,
) -> Result<()> {
    let mut options = config.run_options(prompt);
    if let Some(model) = model {
        options.model = model;
    }
    if let Some(max) = max_iterations {
        options.max_iterations = max;
    }
    options.tool_filter = tools;

    let llm = OpenAiCompatClient::new(&config.llm.base_url, config.llm.api_key())
        .context("failed to build LLM client")?;

    for started in supervisor.initialize().await {
        if let Err(e) = started {
            tracing::warn!(error = %e, "server unavailable for this run");
        }
    }

    let orchestrator = ConversationOrchestrator::new(Arc::new(llm), supervisor.clone());
    let tracker = WorkflowTracker::new(orchestrator, config.tracker_settings());

    let mut records = Box::pin(tracker.stream(options));
    while let Some(item) = records.next().await {
        let record = item?;
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

async fn status(supervisor: &Arc<Supervisor>) -> Result<()> {
    supervisor.start_all().await;
    let report = supervisor.status().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
