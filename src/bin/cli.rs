// CLI binary: panicking on unrecoverable errors is standard for CLI tools.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::unreachable, clippy::indexing_slicing)]

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use paramflow::command::{self, Command, CommandOutput};
use paramflow::settings;
use paramflow::store::AcceptRejectSelector;
use paramflow::{
    generic_executor, FlowError, GenericParameterDefinition, Orchestrator, OrchestratorSettings,
    ParameterDefinition,
};

#[derive(Parser)]
#[command(name = "paramflow-cli", about = "Drive a parameter orchestrator from scripted commands", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding paramflow.json (defaults are used when absent)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Print raw JSON instead of messages
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the namespaces of a model file and run a command script against them
    Run {
        /// Model file: `{"namespaces": [{"namespace", "parameters", ...}]}`
        model: PathBuf,
        /// Script file: a JSON array of commands or one command per line
        script: PathBuf,
        /// Namespaces whose executor always fails
        #[arg(long = "fail-namespace")]
        fail_namespaces: Vec<String>,
    },
    /// List the commands with their parameter schemas
    Tools,
    /// Show the effective settings
    Settings {
        /// Write the effective settings back to the config dir
        #[arg(long)]
        write: bool,
    },
}

// ── Model file ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct ModelFile {
    namespaces: Vec<NamespaceModel>,
}

#[derive(Deserialize)]
struct NamespaceModel {
    namespace: String,
    parameters: Vec<GenericParameterDefinition>,
    #[serde(default)]
    depends_on: Vec<String>,
    /// Force accept/reject mode for every parameter of the namespace.
    #[serde(default)]
    accept_reject: Option<bool>,
    /// Inject this namespace's values into a `Json` parameter of another
    /// namespace: `{"target": "...", "parameter": "..."}`.
    #[serde(default)]
    payload: Option<PayloadModel>,
}

#[derive(Deserialize)]
struct PayloadModel {
    target: String,
    parameter: String,
}

fn load_model(path: &Path) -> ModelFile {
    settings::read_json(path).unwrap_or_else(|e| {
        eprintln!("Failed to load model '{}': {e}", path.display());
        process::exit(1);
    })
}

fn load_script(path: &Path) -> Vec<Command> {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read script '{}': {e}", path.display());
        process::exit(1);
    });
    parse_script(&text).unwrap_or_else(|e| {
        eprintln!("Invalid script '{}': {e}", path.display());
        process::exit(1);
    })
}

fn parse_script(text: &str) -> Result<Vec<Command>, serde_json::Error> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text);
    }
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .map(serde_json::from_str)
        .collect()
}

// ── Setup ────────────────────────────────────────────────────────

fn load_effective_settings(config_dir: Option<&Path>) -> OrchestratorSettings {
    config_dir
        .and_then(settings::load_settings)
        .unwrap_or_default()
}

fn register(orchestrator: &Orchestrator, model: ModelFile, fail_namespaces: &[String]) {
    let mut payloads = Vec::new();
    for ns in model.namespaces {
        let fail = fail_namespaces.contains(&ns.namespace);
        let executor = generic_executor(move |namespace, values, skip_history| async move {
            info!(namespace = %namespace, ?values, skip_history, "executing batch");
            if fail {
                return Err(FlowError::execution(&namespace, "executor configured to fail"));
            }
            Ok(())
        });
        let selector: Option<AcceptRejectSelector> =
            ns.accept_reject.map(|mode| Arc::new(move |_: &ParameterDefinition| mode) as AcceptRejectSelector);
        if let Some(payload) = ns.payload {
            payloads.push((ns.namespace.clone(), payload));
        }
        orchestrator
            .add_generic(&ns.namespace, selector, ns.parameters, executor, &ns.depends_on)
            .unwrap_or_else(|e| {
                eprintln!("Failed to register '{}': {e}", ns.namespace);
                process::exit(1);
            });
    }
    for (source, payload) in payloads {
        let hook = orchestrator.payload_hook(&payload.parameter, &source);
        orchestrator.set_pre_execution_hook(&payload.target, hook);
    }
}

// ── Output ───────────────────────────────────────────────────────

fn print_output(name: &str, output: &CommandOutput, raw: bool) {
    if raw {
        println!("{}", serde_json::to_string(&output.result).unwrap());
    } else {
        println!("[{name}] {}", output.message);
    }
}

fn print_error(name: &str, error: &FlowError, raw: bool) {
    if raw {
        println!("{}", serde_json::json!({ "type": "Error", "data": error.to_string() }));
    } else {
        println!("[{name}] error: {error}");
    }
}

/// Let auto-accepts scheduled by the script settle before the final report.
async fn settle(orchestrator: &Orchestrator) {
    let window = orchestrator.settings().batch_window() * 4 + std::time::Duration::from_millis(50);
    for namespace in orchestrator.namespaces() {
        let Some(wait) = orchestrator.existing_changes(&namespace).and_then(|q| q.wait()) else {
            continue;
        };
        let _ = tokio::time::timeout(window, wait).await;
    }
}

async fn run(orchestrator: &Orchestrator, commands: Vec<Command>, raw: bool) -> bool {
    let mut ok = true;
    for cmd in commands {
        let name = cmd.name();
        match command::dispatch(orchestrator, cmd).await {
            Ok(output) => print_output(name, &output, raw),
            Err(e) => {
                ok = false;
                print_error(name, &e, raw);
            }
        }
    }
    settle(orchestrator).await;

    for namespace in orchestrator.namespaces() {
        let cmd = Command::GetParameters(command::NamespaceParams { namespace });
        if let Ok(output) = command::dispatch(orchestrator, cmd).await {
            print_output("final", &output, raw);
        }
    }
    ok
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    paramflow::telemetry::init(cli.verbose);

    let effective = load_effective_settings(cli.config_dir.as_deref());

    match cli.command {
        Commands::Tools => {
            let catalog = command::tool_catalog();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&catalog).unwrap());
            } else {
                for tool in catalog {
                    println!("{:<16} {}", tool.name, tool.description);
                }
            }
        }
        Commands::Settings { write } => {
            println!("{}", serde_json::to_string_pretty(&effective).unwrap());
            if write {
                let Some(dir) = cli.config_dir.as_deref() else {
                    eprintln!("Error: --write needs --config-dir");
                    process::exit(1);
                };
                if let Err(e) = settings::save_settings(dir, &effective) {
                    eprintln!("Error: {e}");
                    process::exit(1);
                }
            }
        }
        Commands::Run {
            model,
            script,
            fail_namespaces,
        } => {
            let orchestrator = Orchestrator::new(effective);
            register(&orchestrator, load_model(&model), &fail_namespaces);
            let commands = load_script(&script);
            if !run(&orchestrator, commands, cli.json).await {
                process::exit(1);
            }
        }
    }
}
