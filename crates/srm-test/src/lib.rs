//! Test fixtures shared by the SiteRM crates.
//!
//! Provides:
//! - a one-site, one-switch frontend configuration
//! - host facts and agent configuration of the data transfer node cabled
//!   to that switch
//! - hand-built active-deltas documents
//! - turtle delta fragments that parse into those documents

pub mod active_deltas;
pub mod deltas;
pub mod fixtures;

pub use fixtures::*;
