//! split-node binary: scheduler daemon plus operator tooling.
//!
//! ```bash
//! # Run the scheduler on this machine's devices
//! RUST_LOG=info cargo run --bin split-node -- serve --config node.toml
//!
//! # Inspect it
//! cargo run --bin split-node -- status --endpoint tcp://127.0.0.1:7070
//!
//! # Drive a demo generation through it
//! cargo run --bin split-node -- generate "the quick brown fox" --max-tokens 16 --stream
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use split_net::{FrameCodec, NetError, Server};
use split_orchestrator::{GenerateOptions, Orchestrator, OrchestratorError, SyntheticHead, TokenEvent};
use split_scheduler::{DeviceRegistry, PlacementPolicy, ReferenceProvider, Scheduler, SchedulerError};
use split_types::config::{OrchestratorConfig, SchedulerConfig, DEFAULT_LISTEN};
use split_types::{ConfigError, ErrorKind};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "split-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Split-inference scheduler for heterogeneous local devices"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe devices and serve scheduling requests until Ctrl-C.
    Serve {
        /// TOML configuration. Without it: 8 layers, 8 experts, CPU only.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured listen endpoint.
        #[arg(long)]
        listen: Option<String>,
    },

    /// Print a running scheduler's status report as JSON.
    Status {
        #[arg(long, default_value = DEFAULT_LISTEN)]
        endpoint: String,
    },

    /// Generate tokens through a running scheduler with the synthetic head.
    Generate {
        prompt: String,
        #[arg(long, default_value = DEFAULT_LISTEN)]
        endpoint: String,
        #[arg(long, default_value_t = 32)]
        max_tokens: u32,
        /// Must match the scheduler's `model.num_layers`.
        #[arg(long, default_value_t = 8)]
        layers: u32,
        #[arg(long, default_value_t = 8)]
        experts: u32,
        #[arg(long)]
        stop_token: Option<u32>,
        /// Print tokens as they are produced.
        #[arg(long)]
        stream: bool,
    },

    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        config: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    // Default log level: INFO. Override with RUST_LOG=split_scheduler=debug etc.
    // Logs go to stderr so JSON output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Serve { config, listen } => run_serve(config, listen).await,
        Command::Status { endpoint } => run_status(endpoint).await,
        Command::Generate { prompt, endpoint, max_tokens, layers, experts, stop_token, stream } => {
            let options = GenerateOptions { max_new_tokens: max_tokens, stop_token, step_deadline_ms: None };
            run_generate(endpoint, prompt, SyntheticHead::new(layers, experts), options, stream).await
        }
        Command::CheckConfig { config } => run_check_config(config),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", diagnostic(&e));
            ExitCode::FAILURE
        }
    }
}

// ── Serve ─────────────────────────────────────────────────────────────────────

async fn run_serve(config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut cfg = SchedulerConfig::for_model(8, 8);
            cfg.validate()?;
            cfg
        }
    };
    if let Some(listen) = listen {
        config.listen = listen;
        config.validate()?;
    }

    let registry = Arc::new(DeviceRegistry::probe(&config, &ReferenceProvider)?);
    let policy = PlacementPolicy::from_config(&config);
    let endpoint = config.listen.clone();
    let codec = FrameCodec::new(config.limits.max_frame_bytes);
    let reap_every = (config.limits.session_idle_timeout() / 4).max(Duration::from_secs(1));

    let scheduler = Arc::new(Scheduler::new(config, registry, policy));
    let server = Server::bind(&endpoint, Arc::clone(&scheduler), codec)
        .await
        .with_context(|| format!("binding {endpoint}"))?;
    let reaper = scheduler.spawn_reaper(reap_every);

    info!("split-node serving, press Ctrl-C to stop");
    let served = server
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received, shutting down"),
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C; serving until killed");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

    reaper.abort();
    let status = scheduler.status();
    info!(
        total_sessions = status.total_sessions,
        active_sessions = status.active_sessions,
        "scheduler stopped"
    );
    Ok(served?)
}

// ── Status ────────────────────────────────────────────────────────────────────

async fn run_status(endpoint: String) -> Result<()> {
    let orchestrator = Orchestrator::connect(OrchestratorConfig { endpoint, ..OrchestratorConfig::default() }).await?;
    let report = orchestrator.status().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ── Generate ──────────────────────────────────────────────────────────────────

async fn run_generate(
    endpoint: String,
    prompt: String,
    head: SyntheticHead,
    options: GenerateOptions,
    stream: bool,
) -> Result<()> {
    let orchestrator = Orchestrator::connect(OrchestratorConfig { endpoint, ..OrchestratorConfig::default() }).await?;
    let tokens = head.tokenize(&prompt);

    let generation = if stream {
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    TokenEvent::Token { index, token } => println!("token[{index}] = {token}"),
                    TokenEvent::Finished { finish, generated } => println!("finished: {finish} ({generated} tokens)"),
                }
            }
        });
        let generation = orchestrator.generate_streaming(&head, &tokens, &options, tx).await?;
        printer.await?;
        generation
    } else {
        orchestrator.generate(&head, &tokens, &options).await?
    };

    let output = serde_json::json!({
        "session_id": generation.session_id,
        "tokens": generation.tokens,
        "finish": generation.finish.to_string(),
        "summary": generation.summary,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ── Check config ──────────────────────────────────────────────────────────────

fn run_check_config(path: PathBuf) -> Result<()> {
    let config = SchedulerConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?;
    print!("{}", config.to_toml()?);
    Ok(())
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

/// Error taxonomy name for the first cause that carries one.
fn error_kind(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(|cause| {
            if cause.downcast_ref::<ConfigError>().is_some() {
                Some(ErrorKind::ConfigInvalid)
            } else if let Some(e) = cause.downcast_ref::<SchedulerError>() {
                Some(e.kind())
            } else if let Some(e) = cause.downcast_ref::<NetError>() {
                Some(e.kind())
            } else {
                cause.downcast_ref::<OrchestratorError>().map(|e| e.kind())
            }
        })
        .unwrap_or(ErrorKind::ConfigInvalid)
}

fn diagnostic(err: &anyhow::Error) -> String {
    serde_json::json!({
        "error": error_kind(err).to_string(),
        "message": format!("{err:#}"),
    })
    .to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
