//! Passive backend for devices nobody automates.
//!
//! Facts are the ports the configuration declares; applied configs are
//! only written to `<workdir>/RAW-Switch-Config/<device>.yaml` for an
//! operator to pick up.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use serde_yaml::Mapping;
use srm_common::config::SwitchConfig;
use tracing::{debug, info};

use crate::backend::{ApplyReport, FactsReport, SwitchBackend};
use crate::error::{BackendError, BackendResult};
use crate::facts::build_switch_facts;
use crate::vendor::Vendor;

pub const RAW_CONFIG_DIR: &str = "RAW-Switch-Config";

pub struct RawBackend {
    switches: BTreeMap<String, SwitchConfig>,
    workdir: PathBuf,
}

impl RawBackend {
    pub fn new(switches: BTreeMap<String, SwitchConfig>, workdir: PathBuf) -> Self {
        Self { switches, workdir }
    }

    fn config_path(&self, device: &str) -> PathBuf {
        self.workdir.join(RAW_CONFIG_DIR).join(format!("{}.yaml", device))
    }
}

#[async_trait]
impl SwitchBackend for RawBackend {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn get_facts(&self, devices: &[String]) -> BackendResult<FactsReport> {
        let mut report = FactsReport::default();
        for device in devices {
            let Some(config) = self.switches.get(device) else {
                report.add_error(device, "not managed by the raw backend");
                continue;
            };
            // No interfaces are reported, so vendor naming never applies.
            let vendor = config.network_os.parse().unwrap_or(Vendor::Sonic);
            let facts = build_switch_facts(device, vendor, &Value::Null, config);
            debug!(device = %device, ports = facts.ports.len(), "Raw facts from configuration");
            report.facts.insert(device.clone(), facts);
        }
        Ok(report)
    }

    async fn apply_config(&self, desired: &BTreeMap<String, Mapping>) -> BackendResult<ApplyReport> {
        let mut report = ApplyReport::default();
        for (device, config) in desired {
            if !self.switches.contains_key(device) {
                report.add_error(device, "not managed by the raw backend");
                continue;
            }
            let path = self.config_path(device);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| BackendError::io(parent.display().to_string(), e))?;
            }
            fs::write(&path, serde_yaml::to_string(config)?)
                .map_err(|e| BackendError::io(path.display().to_string(), e))?;
            info!(device = %device, path = %path.display(), "Raw config written, nothing applied");
            report.applied.insert(device.clone());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srm_common::config::SwitchPortConfig;

    fn backend(dir: &tempfile::TempDir) -> RawBackend {
        let switch = SwitchConfig {
            ports: BTreeMap::from([(
                "Ethernet0".to_string(),
                SwitchPortConfig {
                    capacity: Some(40_000),
                    hostname: Some("dtn01".to_string()),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };
        RawBackend::new(
            BTreeMap::from([("sw1".to_string(), switch)]),
            dir.path().to_path_buf(),
        )
    }

    #[tokio::test]
    async fn test_facts_come_from_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let report = backend(&dir)
            .get_facts(&["sw1".to_string(), "sw2".to_string()])
            .await
            .unwrap();
        let port = &report.facts["sw1"].ports["Ethernet0"];
        assert_eq!(port.bandwidth, Some(40_000));
        assert_eq!(port.switchport, Some(true));
        assert!(report.facts["sw1"].vlans.is_empty());
        assert!(report.errors.contains_key("sw2"));
    }

    #[tokio::test]
    async fn test_apply_writes_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let desired: Mapping = serde_yaml::from_str("interface:\n  Vlan3001:\n    state: present\n").unwrap();
        let report = backend(&dir)
            .apply_config(&BTreeMap::from([("sw1".to_string(), desired.clone())]))
            .await
            .unwrap();
        assert!(report.is_ok("sw1"));
        let written = fs::read_to_string(dir.path().join(RAW_CONFIG_DIR).join("sw1.yaml")).unwrap();
        assert_eq!(serde_yaml::from_str::<Mapping>(&written).unwrap(), desired);
    }
}
