use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use softphone::config::ConfigStore;
use softphone::console::{ConsoleOptions, run_console};
use softphone::engine::{ProbeOutcome, locate_engine, probe_engine};
use softphone::ports::suggest_port;

#[derive(Parser)]
#[command(name = "phone")]
#[command(about = "Console softphone driving a pjsua engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.softphone)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive console (default)
    Run(RunArgs),

    /// Check that the configured engine is installed and runnable
    Check,

    /// Print a free local UDP port
    Port,

    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Parser, Default)]
struct RunArgs {
    /// Local SIP port (overrides config and port randomization)
    #[arg(short, long)]
    port: Option<u16>,

    /// Echo every engine output line
    #[arg(long)]
    raw: bool,

    /// Print notifications as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ConfigArgs {
    /// Write the effective configuration to config.toml
    #[arg(long)]
    save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "phone=debug,softphone=debug,engine_process=debug,info"
    } else {
        "phone=info,softphone=info,engine_process=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let store = ConfigStore::open(cli.data_dir.clone())?;

    match cli.command {
        None => run_command(&store, RunArgs::default()).await,
        Some(Commands::Run(args)) => run_command(&store, args).await,
        Some(Commands::Check) => check_command(&store).await,
        Some(Commands::Port) => port_command(),
        Some(Commands::Config(args)) => config_command(&store, args.save),
    }
}

async fn run_command(store: &ConfigStore, args: RunArgs) -> Result<()> {
    info!("Starting phone console");
    run_console(
        store.get(),
        ConsoleOptions {
            port: args.port,
            show_raw: args.raw,
            json: args.json,
        },
    )
    .await
}

async fn check_command(store: &ConfigStore) -> Result<()> {
    let configured = &store.get().engine.path;
    let path = locate_engine(configured).with_context(|| {
        format!(
            "Engine '{}' not found in the working directory or PATH",
            configured
        )
    })?;

    match probe_engine(&path).await? {
        ProbeOutcome::Ready => {
            println!("{}: ok", path.display());
            Ok(())
        }
        ProbeOutcome::Unrecognized(first_line) => anyhow::bail!(
            "{} does not look like pjsua (said: {:?})",
            path.display(),
            first_line
        ),
        ProbeOutcome::TimedOut => {
            anyhow::bail!("{} did not answer --help in time", path.display())
        }
    }
}

fn port_command() -> Result<()> {
    let port = suggest_port().context("Failed to find a free UDP port")?;
    println!("{}", port);
    Ok(())
}

fn config_command(store: &ConfigStore, save: bool) -> Result<()> {
    let text = toml::to_string_pretty(store.get()).context("Failed to serialize config")?;
    println!("# {}", store.config_toml_path().display());
    print!("{}", text);
    if save {
        store.save()?;
    }
    Ok(())
}
