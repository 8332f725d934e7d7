//! Site, switch and host fixtures.
//!
//! One site (`T2_US_TEST`, `urn:ogf:network:example.org:2024`) with one
//! SONiC switch `sw1`. Port `Ethernet0` is cabled to `dtn01:eth0`.

use srm_common::{AgentConfig, ConfigFile, FrontendConfig};
use srm_types::HostFacts;

/// Name of the fixture site.
pub const SITE_NAME: &str = "T2_US_TEST";

/// URI prefix of the fixture site.
pub const SITE_URI: &str = "urn:ogf:network:example.org:2024";

/// Epoch used as "now" by fixtures that need a clock.
pub const NOW: i64 = 1_700_000_000;

/// Frontend configuration of the fixture site, as YAML.
pub const FRONTEND_YAML: &str = r#"
general:
  sites: [T2_US_TEST]
  webdomain: https://fe.example.org:8443
  logLevel: debug
services:
  activation_barrier: 30
  remove_delay: 600
sites:
  T2_US_TEST:
    domain: example.org
    year: 2024
    default_bandwidth: 10000
    vlan_range_list: 3000-3100
    ipv6-address-pool: ["2001:db8:ff::/64"]
    ipv6-subnet-pool: ["2001:db8::/32"]
    switch: [sw1]
switches:
  sw1:
    network_os: sonic
    vsw: sw1
    rst: true
    vlan_range_list: 3000-3100
    private_asn: 65000
    ports:
      Ethernet0:
        hostname: dtn01
        isAlias: urn:ogf:network:example.org:2024:dtn01:eth0
        capacity: 100000
      Ethernet4:
        capacity: 100000
qos_policy:
  guaranteedCapped: 7
  softCapped: 5
"#;

/// Parsed [`FRONTEND_YAML`].
pub fn frontend_config() -> FrontendConfig {
    FrontendConfig::from_yaml_str(FRONTEND_YAML).expect("fixture frontend config must parse")
}

/// Facts reported by the `dtn01` agent.
pub const HOST_FACTS_JSON: &str = r#"{
    "NetInfo": {"interfaces": {
        "eth0": {
            "vlan_range_list": "3000-3100",
            "ipv4-address-pool-list": ["10.1.1.0/24"],
            "ipv6-address-pool-list": ["2001:db8:1::/64"],
            "ipv4": ["192.168.0.10/24"],
            "speed": 100000,
            "mtu": 9000,
            "isAlias": "urn:ogf:network:example.org:2024:sw1:Ethernet0"
        }
    }}
}"#;

/// Parsed [`HOST_FACTS_JSON`].
pub fn host_facts() -> HostFacts {
    serde_json::from_str(HOST_FACTS_JSON).expect("fixture host facts must parse")
}

/// [`host_facts`] as stored in the hosts table.
pub fn host_facts_value() -> serde_json::Value {
    serde_json::from_str(HOST_FACTS_JSON).expect("fixture host facts must parse")
}

/// Configuration of the `dtn01` agent, as YAML.
pub const AGENT_YAML: &str = r#"
general:
  sitename: T2_US_TEST
  webdomain: https://fe.example.org:8443
  hostname: dtn01
  ip: 192.168.0.10
agent:
  interfaces: [eth0]
interfaces:
  eth0:
    vlan_range_list: 3000-3100
    ipv4-address-pool: ["10.1.1.0/24"]
    ipv6-address-pool: ["2001:db8:1::/64"]
    maximumCapacity: 100000
    isAlias: urn:ogf:network:example.org:2024:sw1:Ethernet0
qos:
  policy: hostlevel
"#;

/// Parsed [`AGENT_YAML`].
pub fn agent_config() -> AgentConfig {
    AgentConfig::from_yaml_str(AGENT_YAML).expect("fixture agent config must parse")
}
