//! The supervision loop shared by every long-running service.
//!
//! A [`Worker`] does one unit of work per call. The [`Supervisor`] runs it
//! forever: report the outcome through [`SupervisorHooks`], sleep according
//! to the outcome, re-read configuration when a refresh was requested.
//!
//! # Lifecycle
//!
//! 1. Check for a refresh request (at most once per refresh interval)
//! 2. `run_once()` to completion; a shutdown request never interrupts it
//! 3. Report OK / WARNING / FAILED with version and runtime
//! 4. Sleep `sleeptimeok` (halved when changes were applied) or
//!    `sleeptimefailure`, waking early on shutdown

use crate::error::{ErrorKind, SrmError, SrmResult};
use crate::warnings::WarningsTracker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variable enabling per-cycle memory logging.
pub const MEMTRACE_ENV: &str = "SRM_MEMTRACE";

/// Process exit codes of the daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Normal,
    /// Configuration or startup failure.
    Config,
    UnknownCommand,
    KeyboardInterrupt,
    /// Unrecoverable runtime error.
    Runtime,
}

impl ExitStatus {
    pub const fn code(&self) -> i32 {
        match self {
            ExitStatus::Normal => 0,
            ExitStatus::Config => 1,
            ExitStatus::UnknownCommand => 2,
            ExitStatus::KeyboardInterrupt => 3,
            ExitStatus::Runtime => 4,
        }
    }
}

/// Health reported in the service state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Ok,
    Warning,
    Failed,
    Keyboardinterrupt,
    Unknown,
}

impl ServiceState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Ok => "OK",
            ServiceState::Warning => "WARNING",
            ServiceState::Failed => "FAILED",
            ServiceState::Keyboardinterrupt => "KEYBOARDINTERRUPT",
            ServiceState::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceState {
    type Err = SrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(ServiceState::Ok),
            "WARNING" => Ok(ServiceState::Warning),
            "FAILED" => Ok(ServiceState::Failed),
            "KEYBOARDINTERRUPT" => Ok(ServiceState::Keyboardinterrupt),
            "UNKNOWN" => Ok(ServiceState::Unknown),
            other => Err(SrmError::bad_request(format!("unknown service state {}", other))),
        }
    }
}

/// One heartbeat row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub hostname: String,
    pub servicename: String,
    pub servicestate: ServiceState,
    pub version: String,
    /// Duration of the last cycle in seconds.
    pub runtime: u64,
    /// Error or escalated warnings of the last cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc: Option<String>,
}

/// What a worker cycle produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Something was written; the next cycle should come sooner.
    pub changes: bool,
    pub warnings: Vec<String>,
}

impl CycleOutcome {
    pub fn changed(changes: bool) -> Self {
        Self {
            changes,
            warnings: Vec::new(),
        }
    }
}

/// A unit of periodic work.
#[async_trait]
pub trait Worker: Send {
    /// Service name used in logs and in the service state table.
    fn name(&self) -> &str;

    /// Performs one cycle.
    async fn run_once(&mut self) -> SrmResult<CycleOutcome>;

    /// Re-reads configuration after a refresh request.
    async fn reload(&mut self) -> SrmResult<()> {
        Ok(())
    }
}

/// Where the supervisor reports and receives control signals.
#[async_trait]
pub trait SupervisorHooks: Send + Sync {
    async fn report_state(&self, report: &StateReport) -> SrmResult<()>;

    /// Consumes a pending refresh request for the service, if any.
    async fn take_refresh_request(&self, hostname: &str, servicename: &str) -> SrmResult<bool>;
}

/// Timings of the supervision loop.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub hostname: String,
    pub sleep_ok: Duration,
    pub sleep_failure: Duration,
    pub refresh_interval: Duration,
    /// Directory scanned for `<service>.reload` sentinel files.
    pub sentinel_dir: PathBuf,
    pub warning_threshold: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            sleep_ok: Duration::from_secs(10),
            sleep_failure: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(300),
            sentinel_dir: PathBuf::from("/tmp"),
            warning_threshold: 5,
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
}

/// Runs a worker forever under the shared supervision rules.
pub struct Supervisor<W: Worker, H: SupervisorHooks> {
    worker: W,
    hooks: H,
    settings: SupervisorSettings,
    warnings: WarningsTracker,
    last_refresh_check: Option<Instant>,
    memtrace: bool,
}

impl<W: Worker, H: SupervisorHooks> Supervisor<W, H> {
    pub fn new(worker: W, hooks: H, settings: SupervisorSettings) -> Self {
        let memtrace = std::env::var(MEMTRACE_ENV).is_ok_and(|v| v == "1");
        Self {
            warnings: WarningsTracker::new(settings.warning_threshold),
            worker,
            hooks,
            settings,
            last_refresh_check: None,
            memtrace,
        }
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn worker_mut(&mut self) -> &mut W {
        &mut self.worker
    }

    fn sentinel_path(&self) -> PathBuf {
        self.settings
            .sentinel_dir
            .join(format!("{}.reload", self.worker.name()))
    }

    async fn check_refresh(&mut self) -> SrmResult<()> {
        if let Some(last) = self.last_refresh_check {
            if last.elapsed() < self.settings.refresh_interval {
                return Ok(());
            }
        }
        self.last_refresh_check = Some(Instant::now());

        let mut requested = match self
            .hooks
            .take_refresh_request(&self.settings.hostname, self.worker.name())
            .await
        {
            Ok(flag) => flag,
            Err(e) => {
                warn!(service = %self.worker.name(), error = %e, "Failed to read refresh requests");
                false
            }
        };
        let sentinel = self.sentinel_path();
        if sentinel.exists() {
            requested = true;
            if let Err(e) = std::fs::remove_file(&sentinel) {
                warn!(path = %sentinel.display(), error = %e, "Failed to remove reload sentinel");
            }
        }
        if requested {
            info!(service = %self.worker.name(), "Refresh requested, reloading configuration");
            self.worker.reload().await?;
        }
        Ok(())
    }

    async fn report(&self, state: ServiceState, runtime: Duration, exc: Option<String>) {
        let report = StateReport {
            hostname: self.settings.hostname.clone(),
            servicename: self.worker.name().to_string(),
            servicestate: state,
            version: env!("CARGO_PKG_VERSION").to_string(),
            runtime: runtime.as_secs(),
            exc,
        };
        if let Err(e) = self.hooks.report_state(&report).await {
            warn!(service = %report.servicename, error = %e, "Failed to report service state");
        }
    }

    fn trace_memory(&self) {
        if !self.memtrace {
            return;
        }
        match std::fs::read_to_string("/proc/self/statm") {
            Ok(statm) => {
                let pages: u64 = statm
                    .split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                info!(service = %self.worker.name(), rss_kb = pages * 4, "Memory trace");
            }
            Err(e) => debug!(error = %e, "Memory trace unavailable"),
        }
    }

    /// Runs one supervised cycle and returns how long to sleep afterwards.
    ///
    /// # Errors
    ///
    /// Only fatal errors are returned; everything else is reported and
    /// turned into a longer sleep.
    pub async fn cycle(&mut self) -> SrmResult<Duration> {
        let started = Instant::now();
        let result = match self.check_refresh().await {
            Ok(()) => self.worker.run_once().await,
            Err(e) => Err(e),
        };
        let runtime = started.elapsed();
        self.trace_memory();

        match result {
            Ok(outcome) => {
                let escalated = self.warnings.observe(outcome.warnings.iter().cloned());
                for warning in &outcome.warnings {
                    warn!(service = %self.worker.name(), "{}", warning);
                }
                if escalated.is_empty() {
                    self.report(ServiceState::Ok, runtime, None).await;
                } else {
                    self.report(ServiceState::Warning, runtime, Some(escalated.join("; ")))
                        .await;
                }
                if outcome.changes {
                    Ok(self.settings.sleep_ok / 2)
                } else {
                    Ok(self.settings.sleep_ok)
                }
            }
            Err(e) => match e.kind() {
                ErrorKind::Warning => {
                    warn!(service = %self.worker.name(), error = %e, "Service warning");
                    let escalated = self.warnings.observe([e.to_string()]);
                    let state = if escalated.is_empty() {
                        ServiceState::Ok
                    } else {
                        ServiceState::Warning
                    };
                    self.report(state, runtime, Some(e.to_string())).await;
                    Ok(self.settings.sleep_ok)
                }
                ErrorKind::Fatal => {
                    error!(service = %self.worker.name(), error = %e, "Fatal error");
                    self.report(ServiceState::Failed, runtime, Some(e.to_string()))
                        .await;
                    Err(e)
                }
                _ => {
                    error!(service = %self.worker.name(), error = %e, "Cycle failed");
                    self.report(ServiceState::Failed, runtime, Some(e.to_string()))
                        .await;
                    Ok(self.settings.sleep_failure)
                }
            },
        }
    }

    /// Runs until `shutdown` is cancelled or a fatal error occurs.
    pub async fn run(mut self, shutdown: CancellationToken) -> SrmResult<StopReason> {
        info!(service = %self.worker.name(), "Starting service loop");
        loop {
            let sleep = self.cycle().await?;
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!(service = %self.worker.name(), "Shutdown requested, stopping service loop");
        self.report(ServiceState::Keyboardinterrupt, Duration::ZERO, None)
            .await;
        Ok(StopReason::Shutdown)
    }
}
