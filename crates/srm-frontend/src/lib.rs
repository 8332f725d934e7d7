//! Site resource manager frontend.
//!
//! - [`lookup`]: periodic model publication and the policy pass
//! - [`provisioning`]: one supervised worker per switch
//! - [`render`]: active deltas to vendor-neutral switch YAML
//! - [`auth`]: x509 challenge login and JWT issuance
//! - [`rest`]: the axum router serving orchestrators and agents

pub mod auth;
pub mod lookup;
pub mod provisioning;
pub mod render;
pub mod rest;

pub use auth::{AuthError, AuthService};
pub use lookup::LookupService;
pub use provisioning::{ProvisioningDispatcher, SwitchWorker};
pub use rest::{router, AppState};
