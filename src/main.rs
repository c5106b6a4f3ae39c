//! FlowRunner Command-Line Interface
//!
//! Runs a workflow definition once with the built-in handlers and prints a
//! summary of the execution record.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner reorder.yaml
//!
//! # Dry run mode (business steps are simulated)
//! flowrunner reorder.yaml --dry-run
//!
//! # Supply input data and keep records on disk
//! flowrunner reorder.yaml --input input.json --state-dir .flowrunner
//!
//! # Override the execution timeout
//! flowrunner reorder.yaml --timeout 30
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::{Map, Value};

use flowrunner::execution::{FileStore, StepExecutionRecord, StepStatus};
use flowrunner::{
    load_workflow, ActionRegistry, Engine, EngineConfig, ExecutionOptions, ExecutionRecord,
    ExecutionStatus, APP_NAME, VERSION,
};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: String,
    input_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
    tenant_id: Option<String>,
    user_id: Option<String>,
    dry_run: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML or JSON file");
    println!();
    println!("Options:");
    println!("  --input PATH        JSON object passed as execution input");
    println!("  --dry-run           Simulate steps with external side effects");
    println!("  --timeout SECS      Execution timeout, overriding the workflow's");
    println!("  --config PATH       Engine configuration YAML");
    println!("  --state-dir PATH    Persist execution records under this directory");
    println!("  --tenant ID         Tenant the execution belongs to");
    println!("  --user ID           Acting user");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner reorder.yaml");
    println!("  flowrunner reorder.yaml --dry-run --input order.json");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", flag))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config {
        workflow_path: DEFAULT_WORKFLOW.to_string(),
        ..Default::default()
    };
    let mut positional_seen = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--verbose" | "-v" => config.verbose = true,
            "--input" => config.input_path = Some(PathBuf::from(next_value(args, &mut i, arg)?)),
            "--config" => config.config_path = Some(PathBuf::from(next_value(args, &mut i, arg)?)),
            "--state-dir" => config.state_dir = Some(PathBuf::from(next_value(args, &mut i, arg)?)),
            "--tenant" => config.tenant_id = Some(next_value(args, &mut i, arg)?.to_string()),
            "--user" => config.user_id = Some(next_value(args, &mut i, arg)?.to_string()),
            "--timeout" => {
                let raw = next_value(args, &mut i, arg)?;
                config.timeout_secs = Some(
                    raw.parse()
                        .map_err(|_| format!("Invalid timeout value: {}", raw))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if positional_seen {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = arg.clone();
                positional_seen = true;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Reads the execution input, an empty object when no file is given.
fn load_input(path: Option<&PathBuf>) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(Map::new());
    };

    let content = fs::read_to_string(path)
        .map_err(|e| format!("Could not read input '{}': {}", path.display(), e))?;
    let input: Map<String, Value> = serde_json::from_str(&content)
        .map_err(|e| format!("Input '{}' is not a JSON object: {}", path.display(), e))?;
    Ok(input)
}

fn status_label(status: ExecutionStatus) -> colored::ColoredString {
    match status {
        ExecutionStatus::Completed => status.as_str().green().bold(),
        ExecutionStatus::Failed | ExecutionStatus::Timeout => status.as_str().red().bold(),
        ExecutionStatus::Cancelled => status.as_str().yellow().bold(),
        _ => status.as_str().normal(),
    }
}

/// Prints the execution summary.
fn print_summary(record: &ExecutionRecord, steps: &[StepExecutionRecord]) {
    println!();
    println!("{}", "Execution Summary".bold());
    println!("  Execution:  {}", record.execution_id);
    println!("  Status:     {}", status_label(record.status));
    println!(
        "  Steps:      {} completed, {} failed, {} skipped of {}",
        record.completed_steps, record.failed_steps, record.skipped_steps, record.total_steps
    );
    if let Some(ms) = record.duration_ms {
        println!("  Duration:   {:.2}s", ms as f64 / 1000.0);
    }
    if let Some(message) = &record.error_message {
        println!(
            "  Error:      {} ({})",
            message.red(),
            record.error_code.as_deref().unwrap_or("-")
        );
    }

    if !steps.is_empty() {
        println!();
        for step in steps {
            let mark = match step.status {
                StepStatus::Completed => "✓".green(),
                StepStatus::Failed => "✗".red(),
            };
            let retry = if step.retry_count > 0 {
                format!(" (retry {})", step.retry_count)
            } else {
                String::new()
            };
            println!(
                "  {} {} [{}] {}ms{}",
                mark, step.step_id, step.step_type, step.duration_ms, retry
            );
        }
    }
    println!();
}

/// Main application entry point.
async fn run() -> Result<ExecutionStatus, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if config.dry_run {
        info!("Mode: DRY RUN (business steps are simulated)");
        println!();
    }

    // Load workflow
    let workflow = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;
    let workflow_id = workflow.id.clone();
    let input = load_input(config.input_path.as_ref())?;

    // Create and configure engine
    let mut engine = Engine::new(engine_config, ActionRegistry::with_builtins());
    if let Some(dir) = &config.state_dir {
        info!("Execution records: {}", dir.display());
        engine = engine.with_store(Arc::new(FileStore::new(dir)));
    }
    let engine = Arc::new(engine);
    engine.register_workflow(workflow).await?;

    let mut options = ExecutionOptions {
        dry_run: config.dry_run,
        debug: config.verbose,
        tenant_id: config.tenant_id.clone(),
        user_id: config.user_id.clone(),
        ..Default::default()
    };
    if let Some(secs) = config.timeout_secs {
        options = options.with_timeout(Duration::from_secs(secs));
    }

    let execution_id = Engine::generate_execution_id();
    let runner = engine.clone();
    let id = execution_id.clone();
    let mut execution =
        tokio::spawn(async move { runner.execute_workflow(&workflow_id, id, input, options).await });

    // Ctrl-C cancels the execution before its next step.
    let record = tokio::select! {
        joined = &mut execution => joined??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, cancelling execution '{}'", execution_id);
            if let Err(e) = engine
                .cancel_execution(&execution_id, Some("interrupted".to_string()))
                .await
            {
                warn!("Could not cancel: {}", e);
            }
            execution.await??
        }
    };

    let steps = engine
        .step_records(&record.tenant_id, &record.execution_id)
        .await?;
    print_summary(&record, &steps);

    Ok(record.status)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(ExecutionStatus::Completed) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
