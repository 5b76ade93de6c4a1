use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use events::Event;
use orchestrator::{Collaborators, JsonFileConfig, ProvisionerConfig, SessionController};
use provision_core::{LogEntry, LogLevel, ProgressSnapshot, SessionParams};
use server::{create_router, state::AppState};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 3001;

#[derive(Parser)]
#[command(name = "provisioner")]
#[command(about = "Resource-rotating provisioning session engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Config file; defaults to .provisioner/config.json in the working directory
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init,
    /// Serve the HTTP control channel
    Serve {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Static frontend to serve on unmatched paths
        #[arg(long)]
        app_dir: Option<PathBuf>,
    },
    /// Run one session in the foreground and stream its log
    Run {
        #[arg(short, long)]
        target: usize,

        #[arg(short = 'j', long, default_value_t = 1)]
        concurrency: i64,

        /// Provision execution contexts hidden
        #[arg(long)]
        hidden: bool,
    },
    /// Show the progress of a running server
    Status {
        #[arg(long, default_value_t = format!("http://localhost:{}", DEFAULT_PORT))]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => ProvisionerConfig::path_in(&std::env::current_dir()?),
    };

    match cli.command {
        Some(Commands::Init) => init_config(&config_path).await,
        Some(Commands::Serve { port, app_dir }) => serve(port, &config_path, app_dir).await,
        Some(Commands::Run {
            target,
            concurrency,
            hidden,
        }) => run(&config_path, target, concurrency, !hidden).await,
        Some(Commands::Status { url }) => status(&url).await,
        None => serve(cli.port, &config_path, None).await,
    }
}

async fn init_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        return Ok(());
    }

    ProvisionerConfig::default()
        .write(config_path)
        .await
        .context("Failed to write config")?;

    println!();
    println!("Created {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Add resources and stage endpoints to the config");
    println!("  2. Run 'provisioner serve' and POST /api/session/start");

    Ok(())
}

async fn build_controller(config_path: &Path) -> Result<SessionController> {
    let config = ProvisionerConfig::read(config_path)
        .await
        .context("Failed to read config")?;

    tracing::info!("Config: {}", config_path.display());
    tracing::info!("Provisioning backend: {}", config.backend.provisioning_url);

    let collaborators =
        Collaborators::from_backend(&config.backend).context("Invalid backend config")?;
    if collaborators.stages.is_empty() {
        tracing::warn!("No stages configured; attempts finish right after provisioning");
    }

    Ok(SessionController::new(
        collaborators,
        Arc::new(JsonFileConfig::new(config_path)),
    ))
}

async fn serve(port: u16, config_path: &Path, app_dir: Option<PathBuf>) -> Result<()> {
    init_tracing();

    let controller = Arc::new(build_controller(config_path).await?);
    let mut state = AppState::new(Arc::clone(&controller)).record_events();
    if let Some(dir) = app_dir {
        state = state.with_app_dir(dir);
    }
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    println!();
    println!("Provisioner");
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://localhost:{}", port);
    println!("  Swagger UI:  http://localhost:{}/swagger-ui", port);
    println!("  Events:      http://localhost:{}/api/events", port);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            if controller.stop().is_ok() {
                tracing::info!("Stop requested on shutdown");
            }
        })
        .await?;

    Ok(())
}

async fn run(config_path: &Path, target: usize, concurrency: i64, visible: bool) -> Result<()> {
    init_tracing();

    let controller = Arc::new(build_controller(config_path).await?);
    controller.set_concurrency(concurrency);
    controller.set_visible(visible);

    let mut events = controller.subscribe();
    let ack = controller.start(target, SessionParams::new()).await?;
    println!("{}", ack.message.bold());

    let stopper = Arc::clone(&controller);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stopper.stop();
        }
    });

    loop {
        match events.recv().await {
            Ok(envelope) => match envelope.event {
                Event::LogAppended { entry, .. } => print_entry(&entry),
                Event::SessionFinished { .. } => break,
                _ => {}
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Log output fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }

    controller.wait().await;
    print_summary(&controller.progress());
    Ok(())
}

fn print_entry(entry: &LogEntry) {
    let time = entry.timestamp.format("%H:%M:%S");
    let message = match entry.level {
        LogLevel::Info => entry.message.normal(),
        LogLevel::Action => entry.message.cyan(),
        LogLevel::Success => entry.message.green(),
        LogLevel::Warning => entry.message.yellow(),
        LogLevel::Error => entry.message.red(),
    };
    println!("{} {}", time.to_string().dimmed(), message);
}

fn print_summary(progress: &ProgressSnapshot) {
    println!();
    println!(
        "Succeeded: {}/{}  Failed: {}  Rotations: {}",
        progress.success_count.to_string().green(),
        progress.target_count,
        progress.failed_count.to_string().red(),
        progress.rotation_count
    );
    if progress.cancel_requested {
        println!("{}", "Stopped before completion".yellow());
    }
    for record in &progress.completed {
        let artifacts = serde_json::to_string(&record.artifacts).unwrap_or_default();
        println!(
            "  #{} on {} after {} attempt(s): {}",
            record.slot + 1,
            record.resource_name,
            record.attempts,
            artifacts
        );
    }
    println!();
}

async fn status(url: &str) -> Result<()> {
    let endpoint = format!("{}/api/session/progress", url.trim_end_matches('/'));
    let progress: ProgressSnapshot = reqwest::get(&endpoint)
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?
        .error_for_status()?
        .json()
        .await
        .context("Unexpected progress response")?;

    println!();
    match progress.session_id {
        Some(id) => println!(
            "Session {} ({})",
            id,
            if progress.running { "running" } else { "idle" }
        ),
        None => println!("No session has run yet"),
    }
    println!(
        "Concurrency: {}  Visible: {}  Active workers: {}",
        progress.concurrency, progress.visible, progress.active_workers
    );
    print_summary(&progress);

    for entry in progress.logs.iter().rev().take(10).rev() {
        print_entry(entry);
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "provisioner=info,orchestrator=info,server=info,tower_http=info".into()),
        )
        .init();
}
