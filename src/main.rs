//! Tandem - compose-style service orchestrator
//!
//! This is the main CLI entry point for Tandem.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tandem::compose::Stack;
use tandem::runtime::{ContainerRuntime, DockerRuntime, MemoryRuntime};
use tandem::settings::{parse_duration, Settings};
use tandem::TandemError;
use tracing_subscriber::EnvFilter;

/// Tandem - run a compose manifest
#[derive(Parser)]
#[command(name = "tandem")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Build, start and supervise the services of a compose manifest", long_about = None)]
struct Cli {
    /// Compose file, repeat to merge overlays (default: compose.yaml, docker-compose.yml, ... in the current directory)
    #[arg(short, long = "file", global = true)]
    files: Vec<PathBuf>,

    /// Project name
    #[arg(short, long = "project-name", global = true)]
    project_name: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Docker binary used to build and run services
    #[arg(long, global = true, default_value = "docker")]
    docker: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, start and supervise every service until interrupted
    Up {
        /// Use existing artifacts instead of building
        #[arg(long)]
        no_build: bool,
        /// Print the start commands without running anything
        #[arg(long)]
        dry_run: bool,
        /// Pause between a process exit and its restart (e.g. 500ms, 2s)
        #[arg(long, value_parser = duration_arg)]
        restart_delay: Option<Duration>,
        /// Grace period before a stopping process is killed
        #[arg(long, value_parser = duration_arg)]
        stop_timeout: Option<Duration>,
    },

    /// Stop and remove the project's processes and network
    Down,

    /// Build service artifacts
    Build {
        /// Services to build (default: all)
        services: Vec<String>,
    },

    /// Validate the manifest and print the resolved launch plan
    Config {
        /// Print JSON instead of YAML
        #[arg(long)]
        json: bool,
    },
}

fn duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let config_error = e
                .downcast_ref::<TandemError>()
                .is_some_and(TandemError::is_config_error);
            if config_error {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let working_dir = std::env::current_dir().context("Failed to read current directory")?;
    let mut settings = Settings::new(working_dir);
    settings.docker_bin = cli.docker.clone();
    if let Some(name) = &cli.project_name {
        settings = settings.project_name(name);
    }

    match cli.command {
        Commands::Up {
            no_build,
            dry_run,
            restart_delay,
            stop_timeout,
        } => {
            if let Some(delay) = restart_delay {
                settings = settings.restart_delay(delay);
            }
            if let Some(timeout) = stop_timeout {
                settings = settings.stop_timeout(timeout);
            }

            if dry_run {
                let runtime = MemoryRuntime::new();
                let mut stack = Stack::load(settings, &cli.files, Arc::new(runtime.clone()))?;
                stack.up(!no_build).await?;
                for launch in runtime.launches() {
                    println!("{} {}", cli.docker, DockerRuntime::run_args(&launch.spec).join(" "));
                }
                stack.down().await?;
                return Ok(());
            }

            let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(&settings.docker_bin));
            let mut stack = Stack::load(settings, &cli.files, runtime)?;
            if let Err(e) = stack.up(!no_build).await {
                if let Err(cleanup) = stack.down().await {
                    tracing::warn!("Cleanup failed: {}", cleanup);
                }
                return Err(e.into());
            }

            shutdown_signal().await;
            tracing::info!("Interrupted, stopping services");
            stack.down().await?;
        }

        Commands::Down => {
            let runtime = Arc::new(DockerRuntime::new(&settings.docker_bin));
            let mut stack = Stack::load(settings, &cli.files, runtime)?;
            stack.down().await?;
            println!("Project {} stopped", stack.plan().project);
        }

        Commands::Build { services } => {
            let runtime = Arc::new(DockerRuntime::new(&settings.docker_bin));
            let stack = Stack::load(settings, &cli.files, runtime)?;
            let artifacts = stack.build(&services).await?;
            for artifact in artifacts.values() {
                match &artifact.digest {
                    Some(digest) => println!("{:<20} {} {}", artifact.service, artifact.image, digest),
                    None => println!("{:<20} {} (prebuilt)", artifact.service, artifact.image),
                }
            }
        }

        Commands::Config { json } => {
            let stack = Stack::load(settings, &cli.files, Arc::new(MemoryRuntime::new()))?;
            let plan = stack.plan();
            if json {
                println!("{}", serde_json::to_string_pretty(plan)?);
            } else {
                print!("{}", serde_yaml::to_string(plan).context("Failed to render plan")?);
            }
        }
    }

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
