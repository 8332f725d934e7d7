//! Host agent configuration.

use super::ConfigFile;
use crate::error::{SrmError, SrmResult};
use serde::{Deserialize, Serialize};
use srm_types::{BwParams, IpFamily, VlanRange};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub general: AgentGeneral,
    #[serde(default)]
    pub agent: AgentSection,
    /// Per managed interface settings.
    #[serde(default)]
    pub interfaces: BTreeMap<String, AgentInterfaceConfig>,
    #[serde(default)]
    pub qos: QosConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentGeneral {
    #[serde(default)]
    pub sitename: String,
    /// Frontend base URL.
    #[serde(default)]
    pub webdomain: String,
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_privatedir")]
    pub privatedir: PathBuf,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Address the host registers under; the first managed ipv4 address
    /// when unset.
    #[serde(default)]
    pub ip: Option<String>,
    /// Client certificate presented to the frontend.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Bearer token used when no certificate flow is configured.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_sleeptimeok")]
    pub sleeptimeok: u64,
    #[serde(default = "default_sleeptimefailure")]
    pub sleeptimefailure: u64,
}

/// Behaviour switches of the ruler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Interfaces the agent manages.
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Report facts but never touch host networking.
    #[serde(default)]
    pub norules: bool,
    #[serde(default)]
    pub noqos: bool,
    #[serde(default)]
    pub rate_limit: bool,
    #[serde(rename = "defaultMTU", default = "default_mtu")]
    pub default_mtu: u32,
    #[serde(rename = "defaultTXQueuelen", default = "default_txqueuelen")]
    pub default_txqueuelen: u32,
}

/// Settings of one managed interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInterfaceConfig {
    #[serde(default)]
    pub vlan_range_list: VlanRange,
    #[serde(rename = "ipv4-address-pool", default)]
    pub ipv4_address_pool: Vec<String>,
    #[serde(rename = "ipv6-address-pool", default)]
    pub ipv6_address_pool: Vec<String>,
    #[serde(rename = "bwParams", default)]
    pub bw_params: BwParams,
    /// Interface capacity in mbps; the link speed is used when unset.
    #[serde(rename = "maximumCapacity", default)]
    pub maximum_capacity: Option<u64>,
    /// Bandwidth in mbps kept for traffic outside any request.
    #[serde(rename = "reservedCapacity", default = "default_reserved")]
    pub reserved_capacity: u64,
    #[serde(default)]
    pub vlan_mtu: Option<u32>,
    #[serde(default)]
    pub txqueuelen: Option<u32>,
    /// Routed classes may borrow up to the whole interface.
    #[serde(rename = "allowOvercommit", default = "default_true")]
    pub allow_overcommit: bool,
    /// Remote switch port this interface is cabled to.
    #[serde(rename = "isAlias", default)]
    pub is_alias: Option<String>,
}

impl AgentInterfaceConfig {
    pub fn address_pool(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::Ipv4 => &self.ipv4_address_pool,
            IpFamily::Ipv6 => &self.ipv6_address_pool,
        }
    }
}

/// QoS mode of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosPolicy {
    /// One aggregate on the parent interface; routing rules are managed.
    Hostlevel,
    /// Per namespace ranges configured under `qos.interfaces`.
    Privatens,
}

/// An address range living behind an interface (private namespace setups).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QosInterface {
    #[serde(default)]
    pub ipv4_range: Vec<String>,
    #[serde(default)]
    pub ipv6_range: Vec<String>,
    pub master_intf: String,
}

impl QosInterface {
    pub fn ranges(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::Ipv4 => &self.ipv4_range,
            IpFamily::Ipv6 => &self.ipv6_range,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosConfig {
    /// `hostlevel`, `privatens` or unset.
    #[serde(default)]
    pub policy: Option<String>,
    /// Extra arguments appended to routed interface stanzas.
    #[serde(default)]
    pub qos_params: String,
    /// Allow routed classes to grow proportionally to their share.
    #[serde(default)]
    pub class_max: bool,
    #[serde(default)]
    pub interfaces: BTreeMap<String, QosInterface>,
    #[serde(default = "default_qos_config_path")]
    pub config_path: PathBuf,
    /// Commands run after a new config file is installed.
    #[serde(default = "default_restart_commands")]
    pub restart_commands: Vec<String>,
}

impl QosConfig {
    /// Parsed policy; `None` when unset.
    pub fn policy(&self) -> SrmResult<Option<QosPolicy>> {
        match self.policy.as_deref() {
            None | Some("") | Some("default-not-set") => Ok(None),
            Some("hostlevel") => Ok(Some(QosPolicy::Hostlevel)),
            Some("privatens") => Ok(Some(QosPolicy::Privatens)),
            Some(other) => Err(SrmError::invalid_config(
                "qos.policy",
                format!("QoS policy {} is not supported", other),
            )),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_privatedir() -> PathBuf {
    PathBuf::from("/opt/siterm/agent")
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_sleeptimeok() -> u64 {
    10
}

fn default_sleeptimefailure() -> u64 {
    30
}

fn default_mtu() -> u32 {
    9000
}

fn default_txqueuelen() -> u32 {
    1000
}

fn default_reserved() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_qos_config_path() -> PathBuf {
    PathBuf::from("/etc/firehol/fireqos.conf")
}

fn default_restart_commands() -> Vec<String> {
    vec![
        format!("{} clear_all_qos", crate::shell::FIREQOS_CMD),
        format!("{} start", crate::shell::FIREQOS_CMD),
    ]
}

impl Default for AgentGeneral {
    fn default() -> Self {
        Self {
            sitename: String::new(),
            webdomain: String::new(),
            log_level: default_log_level(),
            privatedir: default_privatedir(),
            hostname: default_hostname(),
            ip: None,
            cert: None,
            key: None,
            token: None,
            sleeptimeok: default_sleeptimeok(),
            sleeptimefailure: default_sleeptimefailure(),
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            norules: false,
            noqos: false,
            rate_limit: false,
            default_mtu: default_mtu(),
            default_txqueuelen: default_txqueuelen(),
        }
    }
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            policy: None,
            qos_params: String::new(),
            class_max: false,
            interfaces: BTreeMap::new(),
            config_path: default_qos_config_path(),
            restart_commands: default_restart_commands(),
        }
    }
}

impl AgentConfig {
    /// Settings of a managed interface, defaults when not listed.
    pub fn interface(&self, name: &str) -> AgentInterfaceConfig {
        self.interfaces.get(name).cloned().unwrap_or_default()
    }

    /// MTU for vlan interfaces created on `parent`.
    pub fn vlan_mtu(&self, parent: &str) -> u32 {
        self.interfaces
            .get(parent)
            .and_then(|i| i.vlan_mtu)
            .unwrap_or(self.agent.default_mtu)
    }

    /// txqueuelen for vlan interfaces created on `parent`.
    pub fn txqueuelen(&self, parent: &str) -> u32 {
        self.interfaces
            .get(parent)
            .and_then(|i| i.txqueuelen)
            .unwrap_or(self.agent.default_txqueuelen)
    }
}

impl ConfigFile for AgentConfig {
    const DEFAULT_PATH: &'static str = "/etc/siterm-agent.yaml";

    fn validate(&self) -> SrmResult<()> {
        if self.general.sitename.is_empty() {
            return Err(SrmError::invalid_config("general.sitename", "must not be empty"));
        }
        if self.general.webdomain.is_empty() {
            return Err(SrmError::invalid_config("general.webdomain", "must not be empty"));
        }
        if self.agent.interfaces.is_empty() {
            return Err(SrmError::invalid_config(
                "agent.interfaces",
                "at least one interface must be listed",
            ));
        }
        self.qos.policy()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
general:
  sitename: T2_US_TEST
  webdomain: https://fe.example.org:8443
  hostname: dtn01.example.org
agent:
  interfaces: [eth0]
interfaces:
  eth0:
    vlan_range_list: 3600-3619
    ipv6-address-pool: ["2001:db8:1::/64"]
    maximumCapacity: 10000
    vlan_mtu: 8900
qos:
  policy: hostlevel
  interfaces:
    ns1:
      ipv6_range: ["2001:db8:5::/64"]
      master_intf: eth0
"#;

    #[test]
    fn test_parse_sample() {
        let config = AgentConfig::from_yaml_str(SAMPLE).unwrap();
        let eth0 = config.interface("eth0");
        assert_eq!(eth0.vlan_range_list.len(), 20);
        assert_eq!(eth0.reserved_capacity, 1000);
        assert_eq!(eth0.bw_params.unit, "mbps");
        assert!(eth0.allow_overcommit);
        assert_eq!(config.vlan_mtu("eth0"), 8900);
        assert_eq!(config.vlan_mtu("eth1"), 9000);
        assert_eq!(config.txqueuelen("eth0"), 1000);
        assert_eq!(config.qos.policy().unwrap(), Some(QosPolicy::Hostlevel));
        assert_eq!(config.qos.interfaces["ns1"].master_intf, "eth0");
        assert_eq!(
            config.qos.config_path,
            PathBuf::from("/etc/firehol/fireqos.conf")
        );
    }

    #[test]
    fn test_unsupported_policy_rejected() {
        let yaml = SAMPLE.replace("policy: hostlevel", "policy: perflow");
        let err = AgentConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("perflow"));
    }

    #[test]
    fn test_unset_policy() {
        let yaml = SAMPLE.replace("  policy: hostlevel\n", "");
        let config = AgentConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.qos.policy().unwrap(), None);
    }

    #[test]
    fn test_requires_interfaces() {
        let yaml = SAMPLE.replace("interfaces: [eth0]", "interfaces: []");
        assert!(AgentConfig::from_yaml_str(&yaml).is_err());
    }
}
