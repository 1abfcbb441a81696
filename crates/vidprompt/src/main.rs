//! vidprompt command-line entry point.
//!
//! ```bash
//! # HTTP service
//! GEMINI_API_KEY=... vidprompt serve --bind 0.0.0.0:3000
//!
//! # One pipeline run from the terminal, activity on stderr
//! vidprompt run --video demo.mp4 --prompt "List the steps" -n 5 -k 3 --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use consensus::{ActivityBus, Orchestrator, RunRequest, SharedBackend, SourceArtifact};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use vidprompt::config::{AppConfig, Environment};
use vidprompt::gemini::GeminiBackend;
use vidprompt::sanitize::sanitize_prompt;
use vidprompt::server::{router, AppState};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (overridden by environment and flags)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API
    Serve {
        /// Listen address (overrides VIDPROMPT_BIND)
        #[arg(long)]
        bind: Option<String>,

        /// Deployment environment (overrides VIDPROMPT_ENV)
        #[arg(long)]
        env: Option<Environment>,
    },
    /// Run the pipeline once against a local video
    Run {
        #[arg(long)]
        video: PathBuf,

        /// Instruction given to every generator
        #[arg(long)]
        prompt: String,

        /// Generator count
        #[arg(short = 'n', long)]
        generators: Option<usize>,

        /// Evaluator count
        #[arg(short = 'k', long)]
        evaluators: Option<usize>,

        /// One generation, no consensus
        #[arg(long, default_value_t = false)]
        single_shot: bool,

        /// Print the full decision as JSON on stdout
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn gemini_backend(config: &AppConfig) -> Result<SharedBackend> {
    let api_key = config
        .gemini
        .api_key
        .clone()
        .context("GEMINI_API_KEY is not set")?;
    let backend = GeminiBackend::new(api_key, &config.gemini).context("Failed to build Gemini client")?;
    Ok(Arc::new(backend))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = AppConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Serve { bind, env } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(env) = env {
                config.server.environment = env;
            }
            config.validate()?;
            serve(config).await
        }
        Command::Run {
            video,
            prompt,
            generators,
            evaluators,
            single_shot,
            json,
        } => {
            if let Some(n) = generators {
                config.pipeline.generators = n;
            }
            if let Some(k) = evaluators {
                config.pipeline.evaluators = k;
            }
            run_once(config, video, prompt, single_shot, json).await
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let backend = gemini_backend(&config)?;
    let bind = config.server.bind.clone();
    let environment = config.server.environment;
    let state = AppState::new(backend, config);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(bind = %bind, environment = %environment, "vidprompt listening");

    // Idle runs are also swept when feeds close; this catches runs nobody watched.
    let stop = CancellationToken::new();
    let sweeper = {
        let bus = state.bus.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {
                        let evicted = bus.cleanup_expired();
                        if evicted > 0 {
                            info!(evicted, "evicted idle activity logs");
                        }
                    }
                }
            }
        })
    };

    let bus = state.bus.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutting down");
        stop.cancel();
        // Ends open feeds so graceful shutdown is not held up by them.
        bus.shutdown();
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    let _ = sweeper.await;
    Ok(())
}

async fn run_once(
    config: AppConfig,
    video: PathBuf,
    prompt: String,
    single_shot: bool,
    json: bool,
) -> Result<()> {
    let instruction = sanitize_prompt(&prompt).context("Prompt is empty after sanitizing")?;
    let bytes = tokio::fs::read(&video)
        .await
        .with_context(|| format!("Failed to read {}", video.display()))?;
    let mut artifact = SourceArtifact::new(bytes);
    artifact.file_name = video
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let bus = ActivityBus::with_config(config.bus.clone()).shared();
    let orchestrator = Orchestrator::new(gemini_backend(&config)?).with_bus(bus.clone());
    let run_id = Uuid::new_v4().to_string();

    let (subscription, mut events) = bus.subscribe_channel(&run_id);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => eprintln!("{line}"),
                Err(e) => warn!(error = %e, "unprintable activity event"),
            }
        }
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let request = RunRequest::new(artifact, instruction)
        .with_run_id(run_id.clone())
        .with_config(config.pipeline);

    let outcome = if single_shot {
        orchestrator
            .generate_once(request, &cancel)
            .await
            .map(|text| (text, None))
    } else {
        orchestrator
            .run(request, &cancel)
            .await
            .map(|decision| (decision.text.clone(), Some(decision)))
    };

    // Closing the bus ends the printer once it has drained.
    drop(subscription);
    bus.shutdown();
    let _ = printer.await;

    let (text, decision) = outcome.with_context(|| format!("Run {run_id} failed"))?;
    match (json, decision) {
        (true, Some(decision)) => println!("{}", serde_json::to_string_pretty(&decision)?),
        (true, None) => println!("{}", serde_json::json!({ "prompt": text })),
        (false, decision) => {
            if let Some(reason) = decision.as_ref().and_then(|d| d.reason) {
                warn!(reason = %reason, "no consensus, printing all candidates");
            }
            println!("{text}");
        }
    }
    Ok(())
}
