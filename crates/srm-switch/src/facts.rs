//! Normalization of collected facts into [`SwitchFacts`].
//!
//! The collections report facts under `ansible_net_*` keys with values that
//! are sometimes strings and sometimes numbers depending on the vendor. The
//! helpers here accept both and drop what they cannot read.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use srm_common::config::SwitchConfig;
use srm_types::{IpFamily, LldpData, PortData, RouteData, SwitchFacts, VlanData};
use tracing::debug;

use crate::vendor::{normalize_port_name, vlan_aliases, vlan_key, Vendor};

pub const INTERFACES_KEY: &str = "ansible_net_interfaces";
pub const INFO_KEY: &str = "ansible_net_info";
pub const LLDP_KEY: &str = "ansible_net_lldp";
pub const MACTABLE_KEY: &str = "ansible_net_mactable";

fn routes_key(family: IpFamily) -> &'static str {
    match family {
        IpFamily::Ipv4 => "ansible_net_ipv4",
        IpFamily::Ipv6 => "ansible_net_ipv6",
    }
}

fn string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(matches!(s.to_ascii_lowercase().as_str(), "yes" | "true")),
        _ => None,
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(|v| string(Some(v))).collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Addresses reported either as `"10.0.0.1/24"` or as
/// `{"address": "10.0.0.1", "masklen": 24}`.
fn addresses(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return strings(value);
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => {
                let address = string(obj.get("address"))?;
                Some(match number(obj.get("masklen")) {
                    Some(len) => format!("{}/{}", address, len),
                    None => address,
                })
            }
            _ => None,
        })
        .collect()
}

/// Parses one raw interface entry.
pub fn parse_port(raw: &Value) -> PortData {
    PortData {
        realportname: None,
        description: string(raw.get("description")),
        bandwidth: number(raw.get("bandwidth")),
        mtu: number(raw.get("mtu")).and_then(|m| u32::try_from(m).ok()),
        macaddress: string(raw.get("macaddress")),
        operstatus: string(raw.get("operstatus")),
        switchport: flag(raw.get("switchport")),
        channel_member: strings(raw.get("channel-member")),
    }
}

/// Parses one raw vlan interface entry.
pub fn parse_vlan(raw: &Value) -> VlanData {
    VlanData {
        description: string(raw.get("description")),
        mtu: number(raw.get("mtu")).and_then(|m| u32::try_from(m).ok()),
        tagged: strings(raw.get("tagged")),
        untagged: strings(raw.get("untagged")),
        ipv4: addresses(raw.get("ipv4")),
        ipv6: addresses(raw.get("ipv6")),
        operstatus: string(raw.get("operstatus")),
    }
}

fn interfaces(facts: &Value) -> Option<&Map<String, Value>> {
    facts.get(INTERFACES_KEY).and_then(Value::as_object)
}

/// LLDP neighbors keyed by local port.
pub fn lldp(facts: &Value) -> BTreeMap<String, LldpData> {
    let Some(entries) = facts.get(LLDP_KEY).and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    entries
        .iter()
        .map(|(port, raw)| {
            let data = LldpData {
                local_port_id: string(raw.get("local_port_id")).unwrap_or_else(|| port.clone()),
                remote_chassis_id: string(raw.get("remote_chassis_id")),
                remote_port_id: string(raw.get("remote_port_id")),
                remote_system_name: string(raw.get("remote_system_name")),
            };
            (port.clone(), data)
        })
        .collect()
}

/// Routing table entries of `family`.
pub fn routes(facts: &Value, family: IpFamily) -> Vec<RouteData> {
    let Some(entries) = facts.get(routes_key(family)).and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|raw| RouteData {
            from: string(raw.get("from")),
            to: string(raw.get("to")),
            vrf: string(raw.get("vrf")),
            intf: string(raw.get("intf")),
        })
        .filter(|route| route.from.is_some() || route.to.is_some())
        .collect()
}

/// Vlan interfaces keyed by vendor name, limited to `allowed` when it is
/// not empty.
pub fn vlans(
    facts: &Value,
    vendor: Vendor,
    allowed: &srm_types::VlanRange,
) -> BTreeMap<String, VlanData> {
    let Some(entries) = interfaces(facts) else {
        return BTreeMap::new();
    };
    entries
        .iter()
        .filter(|(name, _)| vendor.is_vlan_interface(name))
        .filter(|(name, _)| match vlan_key(name).and_then(|v| srm_types::VlanId::new(v).ok()) {
            Some(vlan) => allowed.is_empty() || allowed.contains(vlan),
            None => false,
        })
        .map(|(name, raw)| (name.clone(), parse_vlan(raw)))
        .collect()
}

/// MAC addresses learned per port.
pub fn mactable(facts: &Value) -> BTreeMap<String, Vec<String>> {
    let Some(entries) = facts.get(MACTABLE_KEY).and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    entries
        .iter()
        .map(|(port, macs)| (port.clone(), strings(Some(macs))))
        .filter(|(_, macs)| !macs.is_empty())
        .collect()
}

/// Device level facts flattened to strings; nested values are skipped.
pub fn info(facts: &Value) -> BTreeMap<String, String> {
    let Some(entries) = facts.get(INFO_KEY).and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    entries
        .iter()
        .filter(|(key, _)| key.as_str() != "macs")
        .filter_map(|(key, value)| string(Some(value)).map(|v| (key.clone(), v)))
        .collect()
}

/// System MAC addresses of the device.
pub fn system_macs(facts: &Value) -> Vec<String> {
    strings(facts.get(INFO_KEY).and_then(|i| i.get("macs")))
}

/// Looks up the configured override for a vendor port name.
fn configured_port<'a>(
    config: &'a SwitchConfig,
    vendor_name: &str,
) -> Option<(&'a String, &'a srm_common::config::SwitchPortConfig)> {
    let normalized = normalize_port_name(vendor_name);
    config.ports.iter().find(|(key, port)| {
        key.as_str() == vendor_name
            || key.as_str() == normalized
            || port.realportname.as_deref() == Some(vendor_name)
    })
}

/// Combines the collected facts of one device with its configuration.
///
/// Ports that are not switchports are dropped unless the configuration
/// defines them. Configured ports the device does not report are added
/// as-is.
pub fn build_switch_facts(
    device: &str,
    vendor: Vendor,
    facts: &Value,
    config: &SwitchConfig,
) -> SwitchFacts {
    let mut out = SwitchFacts::default();

    if let Some(entries) = interfaces(facts) {
        for (name, raw) in entries {
            if vendor.is_vlan_interface(name) {
                continue;
            }
            let mut port = parse_port(raw);
            let configured = configured_port(config, name).is_some();
            if port.switchport != Some(true) && !configured {
                debug!(device, port = %name, "Port is not a switchport, skipping");
                continue;
            }
            port.realportname = Some(name.clone());
            out.ports.insert(name.clone(), port);
        }
    }
    for (key, port) in &config.ports {
        let vendor_name = port.realportname.clone().unwrap_or_else(|| key.clone());
        if out.ports.contains_key(&vendor_name) {
            continue;
        }
        debug!(device, port = %vendor_name, "Port only defined in configuration");
        out.ports.insert(
            vendor_name.clone(),
            PortData {
                realportname: Some(vendor_name),
                bandwidth: port.capacity,
                switchport: Some(true),
                ..Default::default()
            },
        );
    }

    out.vlans = vlans(facts, vendor, &config.vlan_range_list);
    for family in IpFamily::ALL {
        let entries = routes(facts, family);
        if !entries.is_empty() {
            out.routes.insert(family, entries);
        }
    }
    out.lldp = lldp(facts);
    out.info = info(facts);
    out.mactable = mactable(facts);
    for (name, port) in &out.ports {
        if let Some(mac) = &port.macaddress {
            out.nametomac.insert(name.clone(), mac.clone());
        }
    }
    if let Some(mac) = system_macs(facts).into_iter().next() {
        out.nametomac.insert(device.to_string(), mac);
    }
    out.port_mapping = port_mapping(&out);
    out
}

/// Model name → vendor name for every port and vlan interface.
pub fn port_mapping(facts: &SwitchFacts) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    for name in facts.ports.keys() {
        mapping.insert(name.clone(), name.clone());
        mapping.insert(normalize_port_name(name), name.clone());
    }
    for name in facts.vlans.keys() {
        if let Some(vlan) = vlan_key(name) {
            for alias in vlan_aliases(vlan) {
                mapping.insert(alias, name.clone());
            }
        }
        mapping.insert(normalize_port_name(name), name.clone());
    }
    mapping
}

/// Vendor spelling of a model port name. With a vlan the vendor's vlan
/// interface name is returned instead.
pub fn switch_port_name(
    vendor: Option<Vendor>,
    facts: Option<&SwitchFacts>,
    port: &str,
    vlan: Option<u16>,
) -> String {
    if let (Some(vendor), Some(vlan)) = (vendor, vlan) {
        return vendor.vlan_interface(vlan);
    }
    facts
        .and_then(|f| f.port_mapping.get(port))
        .cloned()
        .unwrap_or_else(|| port.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use srm_common::config::SwitchPortConfig;

    fn dell_facts() -> Value {
        json!({
            "ansible_net_interfaces": {
                "hundredGigE 1/1": {
                    "description": "to dtn01",
                    "bandwidth": "100000",
                    "mtu": 9416,
                    "macaddress": "4c:76:25:e8:44:c2",
                    "operstatus": "up",
                    "switchport": "yes",
                    "channel-member": []
                },
                "hundredGigE 1/2": {"switchport": "no"},
                "ManagementEthernet 1/1": {"ipv4": [{"address": "10.0.0.2", "masklen": 24}]},
                "Vlan 3001": {
                    "tagged": ["hundredGigE 1/1"],
                    "ipv4": [{"address": "10.1.1.1", "masklen": 24}],
                    "mtu": "9000"
                },
                "Vlan 1": {"untagged": ["hundredGigE 1/1"]}
            },
            "ansible_net_info": {"version": "9.14", "macs": ["4c:76:25:e8:44:c0"]},
            "ansible_net_lldp": {
                "hundredGigE 1/1": {
                    "remote_chassis_id": "b8:59:9f:ed:29:fe",
                    "remote_port_id": "b8:59:9f:ed:29:fe",
                    "remote_system_name": "dtn01"
                }
            },
            "ansible_net_ipv4": [{"to": "0.0.0.0/0", "from": "10.0.0.1"}, {"vrf": "mgmt"}],
            "ansible_net_mactable": {"hundredGigE 1/1": ["b8:59:9f:ed:29:fe"]}
        })
    }

    fn dell_config() -> SwitchConfig {
        SwitchConfig {
            network_os: "dellos9".to_string(),
            vlan_range_list: "3000-3100".parse().unwrap(),
            ports: BTreeMap::from([
                (
                    "hundredGigE_1_2".to_string(),
                    SwitchPortConfig {
                        realportname: Some("hundredGigE 1/2".to_string()),
                        capacity: Some(100_000),
                        ..Default::default()
                    },
                ),
                (
                    "Port-channel_101".to_string(),
                    SwitchPortConfig {
                        realportname: Some("Port-channel 101".to_string()),
                        ..Default::default()
                    },
                ),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_port_accepts_strings_and_numbers() {
        let port = parse_port(&dell_facts()[INTERFACES_KEY]["hundredGigE 1/1"]);
        assert_eq!(port.bandwidth, Some(100_000));
        assert_eq!(port.mtu, Some(9416));
        assert_eq!(port.switchport, Some(true));
        assert_eq!(port.description.as_deref(), Some("to dtn01"));
    }

    #[test]
    fn test_build_switch_facts() {
        let facts = build_switch_facts("sw1", Vendor::DellOs9, &dell_facts(), &dell_config());

        let ports: Vec<_> = facts.ports.keys().cloned().collect();
        assert_eq!(
            ports,
            vec!["Port-channel 101", "hundredGigE 1/1", "hundredGigE 1/2"]
        );
        assert_eq!(facts.vlans.len(), 1);
        assert_eq!(facts.vlans["Vlan 3001"].ipv4, vec!["10.1.1.1/24".to_string()]);
        assert_eq!(facts.vlans["Vlan 3001"].mtu, Some(9000));
        assert_eq!(facts.routes[&IpFamily::Ipv4].len(), 1);
        assert_eq!(facts.lldp["hundredGigE 1/1"].local_port_id, "hundredGigE 1/1");
        assert_eq!(facts.info["version"], "9.14");
        assert_eq!(facts.nametomac["sw1"], "4c:76:25:e8:44:c0");
        assert_eq!(facts.mactable["hundredGigE 1/1"].len(), 1);
    }

    #[test]
    fn test_port_mapping_covers_vlan_aliases() {
        let facts = build_switch_facts("sw1", Vendor::DellOs9, &dell_facts(), &dell_config());
        assert_eq!(facts.port_mapping["hundredGigE_1_1"], "hundredGigE 1/1");
        assert_eq!(facts.port_mapping["Vlan3001"], "Vlan 3001");
        assert_eq!(facts.port_mapping["vlan3001"], "Vlan 3001");
        assert_eq!(facts.port_mapping["Vlan 3001"], "Vlan 3001");
    }

    #[test]
    fn test_switch_port_name() {
        let facts = build_switch_facts("sw1", Vendor::DellOs9, &dell_facts(), &dell_config());
        assert_eq!(
            switch_port_name(Some(Vendor::DellOs9), Some(&facts), "hundredGigE_1_1", None),
            "hundredGigE 1/1"
        );
        assert_eq!(
            switch_port_name(Some(Vendor::DellOs9), Some(&facts), "hundredGigE_1_1", Some(3001)),
            "Vlan 3001"
        );
        assert_eq!(switch_port_name(None, None, "Ethernet0", None), "Ethernet0");
    }
}
