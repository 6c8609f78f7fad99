//! Stagecraft CLI
//!
//! Runs the stage pipeline on a request from the terminal and prints the
//! result as JSON on stdout. Logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stagecraft_core::agent::{AgentPort, AgentRoster, ChatCompletionsAgent, ScriptedAgent};
use stagecraft_core::config::PipelineConfig;
use stagecraft_core::pipeline::{PipelineEvent, PipelineOrchestrator, PipelineResult, RunStatus};
use stagecraft_core::stages::STAGES;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_ABORTED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(author, version, about = "Stagecraft - staged code generation pipeline")]
struct Args {
    /// Pipeline configuration file (TOML)
    #[arg(short, long, global = true, env = "STAGECRAFT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the pipeline on a request
    Run {
        /// The request to fulfil
        request: Option<String>,
        /// Read the request from a file instead
        #[arg(long, conflicts_with = "request")]
        request_file: Option<PathBuf>,
        /// Override the review loop iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Write the result JSON to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Result JSON of an earlier run that this request refines
        #[arg(long)]
        previous: Option<PathBuf>,
        /// Use the built-in scripted agent instead of a remote model
        #[arg(long)]
        offline: bool,
    },
    /// Print the effective configuration
    Config,
    /// Print the stage registry with input and output schemas
    Stages,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stagecraft_core=info,stagecraft_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match args.command {
        CliCommand::Config => {
            let config = PipelineConfig::load(args.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Stages => {
            let stages: Vec<_> = STAGES.iter().map(|s| s.describe()).collect();
            println!("{}", serde_json::to_string_pretty(&stages)?);
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Run {
            request,
            request_file,
            max_iterations,
            output,
            previous,
            offline,
        } => {
            let request = read_request(request, request_file.as_deref())?;
            let previous = previous.as_deref().map(read_previous).transpose()?;
            let mut config = PipelineConfig::load(args.config.as_deref())?;
            if let Some(max) = max_iterations {
                config.max_iterations = max;
            }
            run(request, previous, config, output.as_deref(), offline).await
        }
    }
}

fn read_request(request: Option<String>, file: Option<&Path>) -> Result<String> {
    let text = match (request, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display()))?,
        (None, None) => bail!("Provide a request or --request-file"),
    };
    if text.trim().is_empty() {
        bail!("Request is empty");
    }
    Ok(text)
}

fn read_previous(path: &Path) -> Result<PipelineResult> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read previous result {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not a pipeline result", path.display()))
}

async fn run(
    request: String,
    previous: Option<PipelineResult>,
    config: PipelineConfig,
    output: Option<&Path>,
    offline: bool,
) -> Result<ExitCode> {
    let port: Arc<dyn AgentPort> = if offline {
        Arc::new(ScriptedAgent::with_defaults())
    } else {
        Arc::new(ChatCompletionsAgent::from_env(&config.model)?)
    };
    info!(
        provider = config.model.provider.display_name(),
        model = %config.model.model,
        offline,
        follow_up = previous.is_some(),
        "Starting pipeline"
    );

    let (tx, rx) = mpsc::channel(256);
    let forwarder = tokio::spawn(log_events(rx));

    let orchestrator =
        Arc::new(PipelineOrchestrator::new(AgentRoster::uniform(port)).with_event_channel(tx));
    let handle = orchestrator.spawn_with_context(
        request,
        previous.as_ref().map(PipelineResult::as_context),
        config,
    );
    let cancel = handle.cancellation_token();

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let result = handle.join().await.context("Pipeline task failed")?;
    interrupt.abort();
    drop(orchestrator);
    let _ = forwarder.await;

    write_result(&result, output)?;

    let code = match &result.status {
        RunStatus::Completed | RunStatus::Running => ExitCode::SUCCESS,
        RunStatus::Aborted { stage, .. } => {
            let failed = result.stage_results.iter().rev().find(|r| r.stage == *stage);
            if let Some(err) = failed.and_then(|r| r.last_error()) {
                warn!(stage = %stage, class = %err.class, error = %err.message, "Run aborted");
            }
            ExitCode::from(EXIT_ABORTED)
        }
        RunStatus::Cancelled { .. } => ExitCode::from(EXIT_INTERRUPTED),
    };
    Ok(code)
}

async fn log_events(mut rx: mpsc::Receiver<PipelineEvent>) {
    while let Some(event) = rx.recv().await {
        debug!(
            kind = ?event.kind,
            stage = ?event.stage,
            data = %event.data.unwrap_or_default(),
            "Pipeline event"
        );
    }
}

fn write_result(result: &PipelineResult, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write result to {}", path.display()))?;
            info!(path = %path.display(), "Result written");
        }
        None => println!("{}", json),
    }
    Ok(())
}
