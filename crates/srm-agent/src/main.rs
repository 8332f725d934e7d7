//! srm-agent - site resource manager host agent
//!
//! Reports host facts and converges host networking on the frontend's
//! active deltas until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use srm_agent::{FrontendClient, Reporter, RestHooks, Ruler};
use srm_common::{AgentConfig, ConfigCache, ConfigFile, ExitStatus, Supervisor, SupervisorSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Site resource manager host agent
#[derive(Parser, Debug)]
#[command(name = "srm-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent configuration file
    #[arg(short, long, default_value = AgentConfig::DEFAULT_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Facts reporter and ruler (default)
    Run,
    /// Facts reporter only
    Agent,
    /// Ruler only
    Ruler,
}

/// Initializes tracing; `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set tracing subscriber: {}", e);
    }
}

fn supervisor_settings(config: &AgentConfig) -> SupervisorSettings {
    let general = &config.general;
    SupervisorSettings {
        hostname: general.hostname.clone(),
        sleep_ok: Duration::from_secs(general.sleeptimeok),
        sleep_failure: Duration::from_secs(general.sleeptimefailure),
        sentinel_dir: general.privatedir.clone(),
        ..Default::default()
    }
}

async fn run(
    command: Command,
    config: Arc<ConfigCache<AgentConfig>>,
    client: Arc<FrontendClient>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let settings = supervisor_settings(&config.get());
    let hooks = RestHooks::new(Arc::clone(&client));

    let agent_task = (command != Command::Ruler).then(|| {
        let supervisor = Supervisor::new(
            Reporter::new(Arc::clone(&config), Arc::clone(&client)),
            hooks.clone(),
            settings.clone(),
        );
        tokio::spawn(supervisor.run(shutdown.clone()))
    });

    if command != Command::Agent {
        let supervisor = Supervisor::new(
            Ruler::new(Arc::clone(&config), Arc::clone(&client)),
            hooks,
            settings,
        );
        let result = supervisor.run(shutdown.clone()).await;
        // The reporter follows the ruler down.
        shutdown.cancel();
        result.context("ruler")?;
    }

    if let Some(task) = agent_task {
        task.await.context("agent task panicked")?.context("agent")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(ExitStatus::UnknownCommand.code() as u8)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = ConfigCache::<AgentConfig>::open(&args.config);
    let level = config
        .as_ref()
        .map(|c| c.get().general.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    let config = match config {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Failed to load configuration");
            return ExitCode::from(ExitStatus::Config.code() as u8);
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "--- Starting srm-agent ---"
    );

    let client = match FrontendClient::from_config(&config.get()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to set up the frontend client");
            return ExitCode::from(ExitStatus::Config.code() as u8);
        }
    };

    let shutdown = CancellationToken::new();
    let interrupted = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                interrupted.cancel();
                shutdown.cancel();
            }
        });
    }

    let command = args.command.unwrap_or(Command::Run);
    let status = match run(command, config, client, shutdown).await {
        Ok(()) if interrupted.is_cancelled() => ExitStatus::KeyboardInterrupt,
        Ok(()) => ExitStatus::Normal,
        Err(e) => {
            error!(error = %format!("{:#}", e), "srm-agent stopped");
            ExitStatus::Runtime
        }
    };
    info!(code = status.code(), "srm-agent exiting");
    ExitCode::from(status.code() as u8)
}
