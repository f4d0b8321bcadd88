//! lookoutd - metrics scrape-and-alert daemon
//!
//! Scrapes configured targets, evaluates alerting rules against the scraped
//! samples and delivers notifications to webhook and log receivers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lookout::{ApiServer, DaemonError, Engine, Plan};
use lookout_config::{ConfigHandle, EngineConfig};
use lookout_scrape::HttpFetcher;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "lookoutd")]
#[command(about = "Metrics scrape-and-alert daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "LOOKOUT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/lookout/lookout.toml")]
        config: PathBuf,
    },

    /// Validate a config file without starting anything
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/lookout/lookout.toml")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "lookout.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::CheckConfig { config } => check_config(&config),
        Commands::InitConfig { output, force } => init_config(&output, force),
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("lookout=info".parse()?);
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
    Ok(())
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting lookoutd");

    let handle = ConfigHandle::load(&config_path)?;
    let addr: SocketAddr = handle
        .current()
        .global
        .listen_addr
        .parse()
        .context("invalid global.listen_addr")?;

    let fetcher = Arc::new(HttpFetcher::new()?);
    let engine = Arc::new(Engine::new(handle, fetcher)?);
    engine.start().await?;

    let server = ApiServer::bind(addr).await?;
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(Arc::clone(&engine), async move {
        let _ = stop_rx.wait_for(|stop| *stop).await;
    }));

    let fatal = wait_for_exit(&engine).await?;

    stop_tx.send_replace(true);
    let undelivered = engine.shutdown().await?;
    if undelivered > 0 {
        warn!(undelivered, "notifications left undelivered at shutdown");
    }
    match server_task.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    match fatal {
        Some(reason) => Err(DaemonError::Corrupted { reason }.into()),
        None => {
            info!("lookoutd stopped");
            Ok(())
        }
    }
}

/// Waits for a stop signal or a fatal engine error, reloading on SIGHUP.
///
/// Returns the fatal error, if that is what ended the wait.
#[cfg(unix)]
async fn wait_for_exit(engine: &Engine) -> anyhow::Result<Option<String>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut fatal = engine.fatal();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                return Ok(None);
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
                return Ok(None);
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                if let Err(e) = engine.reload().await {
                    error!(error = %e, "reload failed");
                }
            }
            changed = fatal.changed() => {
                if changed.is_err() {
                    return Ok(None);
                }
                if let Some(reason) = fatal.borrow_and_update().clone() {
                    return Ok(Some(reason));
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_exit(engine: &Engine) -> anyhow::Result<Option<String>> {
    let mut fatal = engine.fatal();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                return Ok(None);
            }
            changed = fatal.changed() => {
                if changed.is_err() {
                    return Ok(None);
                }
                if let Some(reason) = fatal.borrow_and_update().clone() {
                    return Ok(Some(reason));
                }
            }
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::from_file(path)?;
    let plan = Plan::build(&config, chrono::Utc::now())?;

    println!("{}: configuration is valid", path.display());
    println!("  targets:   {}", plan.targets.len());
    println!("  rules:     {}", plan.rules.len());
    println!("  receivers: {}", plan.receivers.len());
    println!("  silences:  {}", plan.silences.len());
    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists, use --force to overwrite", output.display());
    }

    let toml = EngineConfig::example().to_toml()?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, toml)?;

    println!("Config written to {}", output.display());
    Ok(())
}
