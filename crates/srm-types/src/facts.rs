//! Last-known facts reported by switches and agents.

use crate::ip::IpFamily;
use crate::vlan::VlanRange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalized description of one switch port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortData {
    /// Name as the vendor reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realportname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Port speed in mbps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macaddress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operstatus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switchport: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channel_member: Vec<String>,
}

/// One vlan interface on a switch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tagged: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub untagged: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operstatus: Option<String>,
}

/// One entry of a switch routing table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intf: Option<String>,
}

/// One LLDP neighbor seen on a local port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LldpData {
    pub local_port_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_chassis_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_system_name: Option<String>,
}

/// Everything a switch backend knows about one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchFacts {
    #[serde(default)]
    pub ports: BTreeMap<String, PortData>,
    #[serde(default)]
    pub vlans: BTreeMap<String, VlanData>,
    #[serde(default)]
    pub routes: BTreeMap<IpFamily, Vec<RouteData>>,
    #[serde(default)]
    pub lldp: BTreeMap<String, LldpData>,
    #[serde(default)]
    pub info: BTreeMap<String, String>,
    #[serde(default)]
    pub mactable: BTreeMap<String, Vec<String>>,
    /// Model port name → vendor port name.
    #[serde(rename = "portMapping", default)]
    pub port_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub nametomac: BTreeMap<String, String>,
}

/// Bandwidth parameters an agent advertises for an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BwParams {
    #[serde(rename = "maxReservableCapacity")]
    pub max_reservable_capacity: u64,
    #[serde(rename = "minReservableCapacity")]
    pub min_reservable_capacity: u64,
    pub granularity: u64,
    pub unit: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub priority: u64,
}

impl Default for BwParams {
    fn default() -> Self {
        Self {
            max_reservable_capacity: 10000,
            min_reservable_capacity: 100,
            granularity: 100,
            unit: "mbps".to_string(),
            service_type: "guaranteedCapped".to_string(),
            priority: 0,
        }
    }
}

/// One host interface as reported by an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    #[serde(default, skip_serializing_if = "VlanRange::is_empty")]
    pub vlan_range_list: VlanRange,
    #[serde(rename = "ipv4-address-pool-list", default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4_address_pool_list: Vec<String>,
    #[serde(rename = "ipv6-address-pool-list", default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6_address_pool_list: Vec<String>,
    #[serde(rename = "bwParams", default)]
    pub bw_params: BwParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txqueuelen: Option<u32>,
    /// Link speed in mbps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Addresses in CIDR form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,
    /// Parent interface for bonds and vlans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    /// Switch port this interface is cabled to (`<switch>:<port>` URI suffix).
    #[serde(rename = "isAlias", default, skip_serializing_if = "Option::is_none")]
    pub is_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operstate: Option<String>,
}

impl InterfaceInfo {
    /// Configured pools of the family.
    pub fn address_pools(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::Ipv4 => &self.ipv4_address_pool_list,
            IpFamily::Ipv6 => &self.ipv6_address_pool_list,
        }
    }

    /// Current addresses of the family.
    pub fn addresses(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::Ipv4 => &self.ipv4,
            IpFamily::Ipv6 => &self.ipv6,
        }
    }
}

/// Network facts of a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceInfo>,
}

/// Container-host facts: which interfaces are aliased into pods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeInfo {
    /// Interface → remote port URI.
    #[serde(rename = "isAlias", default)]
    pub is_alias: BTreeMap<String, String>,
}

/// Validity window and identity of the agent certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertInfo {
    #[serde(rename = "notBefore")]
    pub not_before: i64,
    #[serde(rename = "notAfter")]
    pub not_after: i64,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub issuer: String,
}

/// One neighbor-table entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
}

/// Agent configuration summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Everything an agent reports about its host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    #[serde(rename = "NetInfo", default)]
    pub net_info: NetInfo,
    #[serde(rename = "KubeInfo", default, skip_serializing_if = "Option::is_none")]
    pub kube_info: Option<KubeInfo>,
    #[serde(rename = "CertInfo", default, skip_serializing_if = "Option::is_none")]
    pub cert_info: Option<CertInfo>,
    #[serde(rename = "ArpInfo", default, skip_serializing_if = "Vec::is_empty")]
    pub arp_info: Vec<ArpEntry>,
    #[serde(rename = "Summary", default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl HostFacts {
    /// Returns true if the host aliases any interface into containers.
    pub fn is_kube(&self) -> bool {
        self.kube_info
            .as_ref()
            .is_some_and(|k| !k.is_alias.is_empty())
    }
}
