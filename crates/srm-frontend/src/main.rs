//! srm-frontend - site resource manager frontend daemon
//!
//! Serves the REST API and runs the lookup service (which drives the policy
//! pass and the per-switch workers) until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use srm_common::{
    ConfigCache, ConfigFile, ExitStatus, FrontendConfig, Supervisor, SupervisorSettings,
};
use srm_frontend::{rest, AppState, AuthService, LookupService};
use srm_store::{SqliteStore, Store, StoreHooks};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Site resource manager frontend
#[derive(Parser, Debug)]
#[command(name = "srm-frontend")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Frontend configuration file
    #[arg(short, long, default_value = FrontendConfig::DEFAULT_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// REST API and lookup service (default)
    Run,
    /// REST API only
    Rest,
    /// Lookup service only
    Lookup,
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

fn supervisor_settings(config: &FrontendConfig) -> SupervisorSettings {
    let services = &config.services;
    SupervisorSettings {
        hostname: config.general.hostname.clone(),
        sleep_ok: services.lookup_interval(),
        sleep_failure: services.sleep_failure(),
        refresh_interval: services.refresh_check_interval(),
        sentinel_dir: config.general.privatedir.clone(),
        warning_threshold: services.warning_threshold,
    }
}

/// Everything opened at startup; failures here are startup failures.
struct Services {
    store: Arc<dyn Store>,
    auth: Option<AuthService>,
}

async fn start(command: Command, config: &FrontendConfig) -> anyhow::Result<Services> {
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::connect(&config.general.database)
            .await
            .context("opening database")?,
    );
    let auth = if command != Command::Lookup {
        Some(
            AuthService::from_config(&config.auth, Arc::clone(&store))
                .context("loading token service keys")?,
        )
    } else {
        None
    };
    if command != Command::Rest {
        config.primary_site().context("resolving the served site")?;
    }
    Ok(Services { store, auth })
}

async fn run(
    command: Command,
    config: Arc<ConfigCache<FrontendConfig>>,
    services: Services,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let current = config.get();
    let Services { store, auth } = services;

    let rest_task = auth.map(|auth| {
        let state = AppState::new(Arc::clone(&store), Arc::clone(&config), Arc::new(auth));
        tokio::spawn(rest::serve(state, shutdown.clone()))
    });

    if command != Command::Rest {
        let (site, _) = current.primary_site()?;
        let lookup = LookupService::new(Arc::clone(&store), Arc::clone(&config), site, shutdown.clone());
        let supervisor = Supervisor::new(
            lookup,
            StoreHooks::new(Arc::clone(&store)),
            supervisor_settings(&current),
        );
        let result = supervisor.run(shutdown.clone()).await;
        // The REST server follows the lookup service down.
        shutdown.cancel();
        result.context("lookup service")?;
    }

    if let Some(task) = rest_task {
        task.await.context("REST task panicked")?.context("REST API")?;
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

    let config = ConfigCache::<FrontendConfig>::open(&args.config);
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
        "--- Starting srm-frontend ---"
    );

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
    let services = match start(command, &config.get()).await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Startup failed");
            return ExitCode::from(ExitStatus::Config.code() as u8);
        }
    };
    let status = match run(command, config, services, shutdown).await {
        Ok(()) if interrupted.is_cancelled() => ExitStatus::KeyboardInterrupt,
        Ok(()) => ExitStatus::Normal,
        Err(e) => {
            error!(error = %format!("{:#}", e), "srm-frontend stopped");
            ExitStatus::Runtime
        }
    };
    info!(code = status.code(), "srm-frontend exiting");
    ExitCode::from(status.code() as u8)
}
