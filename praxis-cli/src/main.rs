//! Praxis CLI - operator tools for the capability execution engine

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use praxis_core::config::PraxisConfig;
use praxis_core::sandbox::{CODE_INTERPRETER, CodeInterpreter, CodeValidator, SandboxSelector};
use praxis_core::telemetry::init_tracing;
use praxis_core::tools::{DispatchOptions, Dispatcher};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "praxis")]
#[command(about = "Praxis capability execution engine CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults, then this file; no other layers)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,
    /// Check a Python file against the code validator
    Validate {
        /// File to check
        file: PathBuf,
    },
    /// Probe every configured sandbox backend
    Backends,
    /// Run a Python file through the full dispatch path
    Run {
        /// File to run
        file: PathBuf,
        /// Caller identity recorded in the audit trail
        #[arg(long)]
        caller: Option<String>,
        /// Simulation tick recorded in the audit trail
        #[arg(long)]
        tick: Option<u64>,
        /// Execution timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List registered capabilities in function-calling format
    Capabilities,
    /// Version information
    Version,
}

fn load_config(path: Option<&Path>) -> Result<PraxisConfig> {
    let config = match path {
        Some(path) => PraxisConfig::from_file(path)?,
        None => PraxisConfig::load()?,
    };
    Ok(config)
}

fn read_code(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn build_dispatcher(config: &PraxisConfig) -> Result<Dispatcher> {
    let dispatcher = Dispatcher::new(config.dispatcher.clone());
    let selector = Arc::new(SandboxSelector::from_settings(&config.backends));
    let interpreter = CodeInterpreter::new(config.sandbox.clone(), selector);
    dispatcher.register(CodeInterpreter::spec(), Arc::new(interpreter))?;
    Ok(dispatcher)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Version => {
            println!("praxis {}", env!("CARGO_PKG_VERSION"));
            println!("praxis-core {}", praxis_core::VERSION);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Validate { file } => {
            let code = read_code(&file)?;
            let validator = CodeValidator::from_config(&config.sandbox);
            match validator.validate(&code) {
                Ok(()) => println!("{}: ok", file.display()),
                Err(failure) => bail!("{}: {:?}: {}", file.display(), failure.kind, failure),
            }
        }
        Commands::Backends => {
            let selector = SandboxSelector::from_settings(&config.backends);
            let report: Vec<_> = selector
                .probe_all()
                .await
                .into_iter()
                .map(|(kind, available)| json!({ "backend": kind, "available": available }))
                .collect();
            let bound = selector.select().await.map(|b| b.kind());
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "candidates": report, "selected": bound }))?
            );
        }
        Commands::Run {
            file,
            caller,
            tick,
            timeout,
        } => {
            let code = read_code(&file)?;
            let dispatcher = build_dispatcher(&config)?;

            let mut args = json!({ "code": code });
            let mut options = DispatchOptions::new();
            if let Some(secs) = timeout {
                args["timeout"] = json!(secs);
                options = options.with_timeout(Duration::from_secs(secs));
            }
            if let Some(caller) = caller {
                options = options.with_caller(caller);
            }
            if let Some(tick) = tick {
                options = options.with_tick(tick);
            }

            let result = dispatcher.dispatch(CODE_INTERPRETER, args, options).await;
            dispatcher.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Capabilities => {
            let dispatcher = build_dispatcher(&config)?;
            let specs: Vec<_> = dispatcher
                .list_specs()
                .iter()
                .map(|spec| spec.to_openai_function())
                .collect();
            println!("{}", serde_json::to_string_pretty(&specs)?);
        }
    }

    Ok(())
}
