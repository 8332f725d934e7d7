//! Shared runtime of the site resource manager daemons.
//!
//! - [`error`]: [`SrmError`] and the structured [`ErrorInfo`] body
//! - [`shell`]: safe shell command execution with proper quoting
//! - [`config`]: typed YAML configuration with defaults and a reloadable cache
//! - [`supervisor`]: the work / report / sleep loop every service runs under
//! - [`warnings`]: escalation of warnings that persist across cycles
//! - [`retry`]: linear backoff for transient failures
//! - [`timing`]: epoch and HTTP date helpers

pub mod config;
pub mod error;
pub mod retry;
pub mod shell;
pub mod supervisor;
pub mod timing;
pub mod warnings;

pub use config::{AgentConfig, ConfigCache, ConfigFile, FrontendConfig};
pub use error::{ErrorInfo, ErrorKind, SrmError, SrmResult};
pub use retry::{retry, RetryPolicy, Retryable};
pub use supervisor::{
    CycleOutcome, ExitStatus, ServiceState, StateReport, Supervisor, SupervisorHooks,
    SupervisorSettings, Worker,
};
pub use timing::now_epoch;
pub use warnings::WarningsTracker;
