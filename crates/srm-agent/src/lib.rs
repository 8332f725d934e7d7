//! Site resource manager host agent.
//!
//! - [`reporter`]: host facts reported to the frontend (the `Agent` service)
//! - [`ruler`]: converges vlan interfaces, routing rules and shaping on the
//!   active deltas (the `Ruler` service)
//! - [`client`]: the frontend REST client both services share
//! - [`overlap`], [`vinterfaces`], [`routing`], [`qos`]: the host-side
//!   pieces the Ruler drives

pub mod client;
pub mod commands;
pub mod credentials;
pub mod error;
pub mod facts;
pub mod hooks;
pub mod overlap;
pub mod qos;
pub mod reporter;
pub mod routing;
pub mod ruler;
pub mod vinterfaces;

pub use client::{FrontendClient, TimeStateReport};
pub use credentials::Credentials;
pub use error::{AgentError, AgentResult};
pub use hooks::RestHooks;
pub use overlap::{OverlapLib, Overlaps};
pub use reporter::Reporter;
pub use ruler::Ruler;
