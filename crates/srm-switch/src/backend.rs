//! The seam between the frontend workers and switch automation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use srm_common::config::{BackendKind, SwitchConfig};
use srm_common::FrontendConfig;
use srm_types::SwitchFacts;

use crate::ansible::AnsibleBackend;
use crate::error::BackendResult;
use crate::raw::RawBackend;

/// Facts collected in one run. A device either has facts or errors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactsReport {
    pub facts: BTreeMap<String, SwitchFacts>,
    pub errors: BTreeMap<String, Vec<String>>,
}

impl FactsReport {
    pub fn add_error(&mut self, device: &str, error: impl Into<String>) {
        self.errors
            .entry(device.to_string())
            .or_default()
            .push(error.into());
    }
}

/// Outcome of one apply run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub applied: BTreeSet<String>,
    pub errors: BTreeMap<String, Vec<String>>,
}

impl ApplyReport {
    pub fn add_error(&mut self, device: &str, error: impl Into<String>) {
        self.errors
            .entry(device.to_string())
            .or_default()
            .push(error.into());
    }

    pub fn is_ok(&self, device: &str) -> bool {
        self.applied.contains(device) && !self.errors.contains_key(device)
    }
}

/// Collects facts from and pushes desired configuration to switches.
///
/// `desired` maps a device to the document written into its host vars
/// (`interface`, `sense_bgp`, `qos` sections).
#[async_trait]
pub trait SwitchBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_facts(&self, devices: &[String]) -> BackendResult<FactsReport>;

    async fn apply_config(
        &self,
        desired: &BTreeMap<String, serde_yaml::Mapping>,
    ) -> BackendResult<ApplyReport>;
}

/// Devices of `config` grouped by the backend that manages them.
pub fn devices_by_backend(
    config: &FrontendConfig,
    site: &str,
) -> BTreeMap<BackendKind, BTreeMap<String, SwitchConfig>> {
    let mut grouped: BTreeMap<BackendKind, BTreeMap<String, SwitchConfig>> = BTreeMap::new();
    let Some(site) = config.sites.get(site) else {
        return grouped;
    };
    for device in &site.switch {
        if let Some(switch) = config.switches.get(device) {
            grouped
                .entry(switch.backend)
                .or_default()
                .insert(device.clone(), switch.clone());
        }
    }
    grouped
}

/// Builds the backend for one device.
pub fn backend_for(
    config: &FrontendConfig,
    device: &str,
    workdir: PathBuf,
) -> BackendResult<Arc<dyn SwitchBackend>> {
    let switch = config.switches.get(device).ok_or_else(|| {
        crate::error::BackendError::NotConfigured {
            device: device.to_string(),
            message: "no entry under switches".to_string(),
        }
    })?;
    let switches = BTreeMap::from([(device.to_string(), switch.clone())]);
    Ok(match switch.backend {
        BackendKind::Ansible => Arc::new(AnsibleBackend::new(config.ansible.clone(), switches)?),
        BackendKind::Raw => Arc::new(RawBackend::new(switches, workdir)),
    })
}
