//! Delta admission and lifecycle for the site resource manager.
//!
//! - [`conflict`]: resource checks of a candidate active document
//! - [`state_machine`]: the persisted delta lifecycle
//! - [`policy`]: accepting submissions and merging committed deltas

pub mod conflict;
pub mod policy;
pub mod state_machine;

pub use conflict::{check_active_config, ConflictChecker};
pub use policy::{changed_connections, touched_hosts, DeltaSubmission, PolicyOutcome, PolicyService};
pub use state_machine::{StateMachine, Timers};
