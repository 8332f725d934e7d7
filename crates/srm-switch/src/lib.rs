//! Switch automation backends.
//!
//! - [`SwitchBackend`]: the trait the provisioning workers call
//! - [`AnsibleBackend`]: runs vendor playbooks through `ansible-playbook`
//! - [`RawBackend`]: passive devices described only by configuration
//! - [`vendor`]: per-vendor port and vlan interface naming
//! - [`facts`]: normalization of collected facts into `SwitchFacts`

pub mod ansible;
pub mod backend;
pub mod error;
pub mod facts;
pub mod raw;
pub mod vendor;

pub use ansible::{AnsibleBackend, PlaybookRun};
pub use backend::{backend_for, devices_by_backend, ApplyReport, FactsReport, SwitchBackend};
pub use error::{BackendError, BackendResult};
pub use facts::{build_switch_facts, switch_port_name};
pub use raw::RawBackend;
pub use vendor::{normalize_port_name, vlan_key, Vendor};
