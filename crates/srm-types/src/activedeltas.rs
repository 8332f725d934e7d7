//! The ActiveDeltas document: the site's single authoritative picture of
//! currently approved requested state.
//!
//! The JSON shape is the external contract consumed by agents:
//!
//! ```text
//! {
//!   "vsw":  { <conn>: { "_params": {...}, <host>: { <port>: PortRequest } } },
//!   "kube": { ... same as vsw ... },
//!   "singleport": { ... same as vsw ... },
//!   "rst":  { <conn>: { "_params": {...}, <host>: { "ipv4"|"ipv6": RouteEntry } } },
//!   "SubnetMapping":  { <host>: { "providesSubnet": [<conn>, ...] } },
//!   "RoutingMapping": { <host>: { "providesRoute": { <conn>: ["ipv6"] } } },
//!   "usedIPs": { <host>: [...] }, "usedVLANs": { <host>: [...] }
//! }
//! ```
//!
//! All maps are ordered so that serialization is deterministic and the
//! document round-trips through JSON unchanged.

use crate::ip::{IpFamily, IpPrefix};
use crate::service::ServiceParams;
use crate::vlan::VlanId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Largest timestamp used for open-ended lifetimes.
pub const MAX_TIMESTAMP: i64 = 2_147_483_647;

/// Label type carried by vlan labels.
pub const DEFAULT_LABEL_TYPE: &str = "ethernet#vlan";

/// Offset applied to the start of a defaulted lifetime.
const DEFAULT_START_OFFSET: i64 = 10;

/// Length of a defaulted lifetime (three months).
const DEFAULT_DURATION: i64 = 90 * 24 * 3600;

/// The `existsDuring` lifetime window, absolute epoch seconds, half-open
/// `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistsDuring {
    /// Graph node that declared the lifetime; `None` for defaulted windows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub start: i64,
    pub end: i64,
}

impl ExistsDuring {
    /// Creates a window declared by a graph node.
    pub fn new(uri: Option<String>, start: i64, end: i64) -> Self {
        Self { uri, start, end }
    }

    /// Default window applied to requests without a lifetime.
    pub fn default_from(now: i64) -> Self {
        Self {
            uri: None,
            start: now + DEFAULT_START_OFFSET,
            end: now + DEFAULT_DURATION,
        }
    }

    /// Unbounded window used when comparing requests without a lifetime.
    pub fn unbounded() -> Self {
        Self {
            uri: None,
            start: 0,
            end: MAX_TIMESTAMP,
        }
    }

    /// True when the window was filled in rather than requested.
    pub fn is_defaulted(&self) -> bool {
        self.uri.is_none()
    }

    /// True when `start < end`.
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// The window has begun.
    pub fn is_started(&self, now: i64) -> bool {
        now >= self.start
    }

    /// The window is over; a window ending exactly now is over.
    pub fn is_ended(&self, now: i64) -> bool {
        now >= self.end
    }

    /// The window covers `now`.
    pub fn is_active(&self, now: i64) -> bool {
        self.is_started(now) && !self.is_ended(now)
    }

    /// Half-open interval intersection; windows sharing one endpoint do not
    /// overlap.
    pub fn overlaps(&self, other: &ExistsDuring) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// The `_params` envelope attached to connections, ports and routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    #[serde(rename = "existsDuring", default, skip_serializing_if = "Option::is_none")]
    pub exists_during: Option<ExistsDuring>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "belongsTo", default, skip_serializing_if = "Option::is_none")]
    pub belongs_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(rename = "labelSwapping", default, skip_serializing_if = "Option::is_none")]
    pub label_swapping: Option<String>,
    /// Last fine-grained state recorded for this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networkstatus: Option<String>,
}

impl Params {
    /// Returns true if nothing is set.
    pub fn is_empty(&self) -> bool {
        *self == Params::default()
    }

    /// Lifetime, or the unbounded window if none was recorded.
    pub fn window(&self) -> ExistsDuring {
        self.exists_during
            .clone()
            .unwrap_or_else(ExistsDuring::unbounded)
    }
}

/// A vlan label (`hasLabel`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub labeltype: String,
    pub value: VlanId,
}

impl Label {
    pub fn vlan(value: VlanId) -> Self {
        Self {
            labeltype: DEFAULT_LABEL_TYPE.to_string(),
            value,
        }
    }
}

/// One network address with its declared type (`ipv4-address|...`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// The `hasNetworkAddress` block; only ipv4/ipv6 addresses are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddresses {
    #[serde(rename = "ipv4-address", default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<NetworkAddress>,
    #[serde(rename = "ipv6-address", default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<NetworkAddress>,
}

impl NetworkAddresses {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }

    pub fn get(&self, family: IpFamily) -> Option<&NetworkAddress> {
        match family {
            IpFamily::Ipv4 => self.ipv4.as_ref(),
            IpFamily::Ipv6 => self.ipv6.as_ref(),
        }
    }

    pub fn set(&mut self, family: IpFamily, address: NetworkAddress) {
        match family {
            IpFamily::Ipv4 => self.ipv4 = Some(address),
            IpFamily::Ipv6 => self.ipv6 = Some(address),
        }
    }
}

/// A request on one (host, port) of a switched path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    #[serde(rename = "hasLabel", default, skip_serializing_if = "Option::is_none")]
    pub has_label: Option<Label>,
    #[serde(
        rename = "hasNetworkAddress",
        default,
        skip_serializing_if = "NetworkAddresses::is_empty"
    )]
    pub has_network_address: NetworkAddresses,
    #[serde(rename = "hasService", default, skip_serializing_if = "Option::is_none")]
    pub has_service: Option<ServiceParams>,
    #[serde(rename = "_params", default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    /// Remote endpoint this port is aliased to.
    #[serde(rename = "isAlias", default, skip_serializing_if = "Option::is_none")]
    pub is_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl PortRequest {
    /// The requested vlan, if labelled.
    pub fn vlan(&self) -> Option<VlanId> {
        self.has_label.as_ref().map(|l| l.value)
    }

    /// The requested address of the family, parsed as a prefix.
    pub fn address(&self, family: IpFamily) -> Option<IpPrefix> {
        self.has_network_address
            .get(family)
            .and_then(|a| IpPrefix::parse_lenient(&a.value).ok())
    }
}

/// Which switched category a path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SwitchedKind {
    Vsw,
    Kube,
    Singleport,
}

impl SwitchedKind {
    pub const ALL: [SwitchedKind; 3] =
        [SwitchedKind::Vsw, SwitchedKind::Kube, SwitchedKind::Singleport];

    pub const fn as_str(&self) -> &'static str {
        match self {
            SwitchedKind::Vsw => "vsw",
            SwitchedKind::Kube => "kube",
            SwitchedKind::Singleport => "singleport",
        }
    }
}

/// A vlan-switched L2 path: hosts → ports → requests, plus `_params`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchedPath {
    #[serde(rename = "_params", default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    #[serde(flatten)]
    pub hosts: BTreeMap<String, BTreeMap<String, PortRequest>>,
}

impl SwitchedPath {
    /// Lifetime of the path (unbounded if none recorded).
    pub fn window(&self) -> ExistsDuring {
        self.params.window()
    }
}

/// One `{type, value, key}` triple of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A single route: next-hop, route-from and route-to, keyed by value type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "nextHop", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub next_hop: BTreeMap<String, RouteValue>,
    #[serde(rename = "routeFrom", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub route_from: BTreeMap<String, RouteValue>,
    #[serde(rename = "routeTo", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub route_to: BTreeMap<String, RouteValue>,
}

impl Route {
    /// Next-hop address of the family.
    pub fn next_hop(&self, family: IpFamily) -> Option<&str> {
        self.next_hop
            .get(&family.address_key())
            .map(|v| v.value.as_str())
    }

    /// Route-from prefix of the family.
    pub fn route_from(&self, family: IpFamily) -> Option<&str> {
        self.route_from
            .get(&family.prefix_list_key())
            .map(|v| v.value.as_str())
    }

    /// Route-to prefix of the family.
    pub fn route_to(&self, family: IpFamily) -> Option<&str> {
        self.route_to
            .get(&family.prefix_list_key())
            .map(|v| v.value.as_str())
    }

    /// Remote private ASN announced with the route.
    pub fn remote_asn(&self) -> Option<&str> {
        self.route_to
            .get("bgp-private-asn")
            .or_else(|| self.next_hop.get("bgp-private-asn"))
            .map(|v| v.value.as_str())
    }
}

/// Per host, per family entry of a routed path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    #[serde(rename = "_params", default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    #[serde(rename = "hasService", default, skip_serializing_if = "Option::is_none")]
    pub has_service: Option<ServiceParams>,
    #[serde(rename = "hasRoute", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub has_route: BTreeMap<String, Route>,
    #[serde(rename = "providesRoute", default, skip_serializing_if = "Option::is_none")]
    pub provides_route: Option<String>,
    #[serde(rename = "providesRoutingTable", default, skip_serializing_if = "Option::is_none")]
    pub provides_routing_table: Option<String>,
    #[serde(rename = "belongsToRoutingTable", default, skip_serializing_if = "Option::is_none")]
    pub belongs_to_routing_table: Option<String>,
}

impl RouteEntry {
    /// Iterates the next-hop addresses declared across all routes.
    pub fn next_hops(&self, family: IpFamily) -> impl Iterator<Item = &str> + '_ {
        self.has_route.values().filter_map(move |r| r.next_hop(family))
    }

    /// First route-from prefix across all routes.
    pub fn route_from(&self, family: IpFamily) -> Option<&str> {
        self.has_route.values().find_map(|r| r.route_from(family))
    }

    /// First route-to prefix across all routes.
    pub fn route_to(&self, family: IpFamily) -> Option<&str> {
        self.has_route.values().find_map(|r| r.route_to(family))
    }
}

/// An L3 routed path: hosts → families → entries, plus `_params`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedPath {
    #[serde(rename = "_params", default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    #[serde(flatten)]
    pub hosts: BTreeMap<String, BTreeMap<IpFamily, RouteEntry>>,
}

impl RoutedPath {
    /// Lifetime of the path (unbounded if none recorded).
    pub fn window(&self) -> ExistsDuring {
        self.params.window()
    }
}

/// Reverse index entry: which switched connections touch a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetMapping {
    #[serde(rename = "providesSubnet", default)]
    pub provides_subnet: BTreeSet<String>,
}

/// Reverse index entry: which routed connections touch a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMapping {
    #[serde(rename = "providesRoute", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides_route: BTreeMap<String, BTreeSet<IpFamily>>,
    #[serde(
        rename = "providesRoutingTable",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub provides_routing_table: BTreeMap<String, BTreeSet<IpFamily>>,
}

/// The authoritative active-deltas document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDeltas {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vsw: BTreeMap<String, SwitchedPath>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kube: BTreeMap<String, SwitchedPath>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub singleport: BTreeMap<String, SwitchedPath>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rst: BTreeMap<String, RoutedPath>,
    #[serde(rename = "SubnetMapping", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subnet_mapping: BTreeMap<String, SubnetMapping>,
    #[serde(rename = "RoutingMapping", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing_mapping: BTreeMap<String, RoutingMapping>,
    #[serde(rename = "usedIPs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub used_ips: BTreeMap<String, BTreeSet<String>>,
    #[serde(rename = "usedVLANs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub used_vlans: BTreeMap<String, BTreeSet<VlanId>>,
}

impl ActiveDeltas {
    /// Returns true if no connection of any category is present.
    pub fn is_empty(&self) -> bool {
        self.vsw.is_empty() && self.kube.is_empty() && self.singleport.is_empty() && self.rst.is_empty()
    }

    /// Switched paths of the given category.
    pub fn switched(&self, kind: SwitchedKind) -> &BTreeMap<String, SwitchedPath> {
        match kind {
            SwitchedKind::Vsw => &self.vsw,
            SwitchedKind::Kube => &self.kube,
            SwitchedKind::Singleport => &self.singleport,
        }
    }

    /// Mutable switched paths of the given category.
    pub fn switched_mut(&mut self, kind: SwitchedKind) -> &mut BTreeMap<String, SwitchedPath> {
        match kind {
            SwitchedKind::Vsw => &mut self.vsw,
            SwitchedKind::Kube => &mut self.kube,
            SwitchedKind::Singleport => &mut self.singleport,
        }
    }

    /// All connection ids across every category.
    pub fn connection_ids(&self) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for kind in SwitchedKind::ALL {
            ids.extend(self.switched(kind).keys().cloned());
        }
        ids.extend(self.rst.keys().cloned());
        ids
    }

    /// Lifetime of a connection in any category.
    pub fn window_of(&self, conn: &str) -> Option<ExistsDuring> {
        SwitchedKind::ALL
            .iter()
            .find_map(|k| self.switched(*k).get(conn).map(SwitchedPath::window))
            .or_else(|| self.rst.get(conn).map(RoutedPath::window))
    }

    /// Mutable `_params` of a connection in any category.
    pub fn params_mut(&mut self, conn: &str) -> Option<&mut Params> {
        if let Some(kind) = SwitchedKind::ALL
            .into_iter()
            .find(|k| self.switched(*k).contains_key(conn))
        {
            return self.switched_mut(kind).get_mut(conn).map(|p| &mut p.params);
        }
        self.rst.get_mut(conn).map(|p| &mut p.params)
    }

    /// Removes a connection from every category. Returns true if found.
    pub fn remove_connection(&mut self, conn: &str) -> bool {
        let mut found = false;
        for kind in SwitchedKind::ALL {
            found |= self.switched_mut(kind).remove(conn).is_some();
        }
        found |= self.rst.remove(conn).is_some();
        found
    }

    /// Recomputes reverse indices and used-resource sets from the content.
    pub fn rebuild_indices(&mut self) {
        let mut subnet_mapping: BTreeMap<String, SubnetMapping> = BTreeMap::new();
        let mut routing_mapping: BTreeMap<String, RoutingMapping> = BTreeMap::new();
        let mut used_ips: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut used_vlans: BTreeMap<String, BTreeSet<VlanId>> = BTreeMap::new();

        for kind in SwitchedKind::ALL {
            for (conn, path) in self.switched(kind) {
                for (host, ports) in &path.hosts {
                    subnet_mapping
                        .entry(host.clone())
                        .or_default()
                        .provides_subnet
                        .insert(conn.clone());
                    for port in ports.values() {
                        if let Some(vlan) = port.vlan() {
                            used_vlans.entry(host.clone()).or_default().insert(vlan);
                        }
                        for family in IpFamily::ALL {
                            if let Some(addr) = port.has_network_address.get(family) {
                                used_ips
                                    .entry(host.clone())
                                    .or_default()
                                    .insert(addr.value.clone());
                            }
                        }
                    }
                }
            }
        }
        for (conn, path) in &self.rst {
            for (host, families) in &path.hosts {
                let mapping = routing_mapping.entry(host.clone()).or_default();
                for (family, entry) in families {
                    let target = if entry.provides_routing_table.is_some() {
                        &mut mapping.provides_routing_table
                    } else {
                        &mut mapping.provides_route
                    };
                    target.entry(conn.clone()).or_default().insert(*family);
                    for hop in entry.next_hops(*family) {
                        used_ips
                            .entry(host.clone())
                            .or_default()
                            .insert(hop.to_string());
                    }
                }
            }
        }
        self.subnet_mapping = subnet_mapping;
        self.routing_mapping = routing_mapping;
        self.used_ips = used_ips;
        self.used_vlans = used_vlans;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ActiveDeltas {
        let mut port = PortRequest {
            has_label: Some(Label::vlan(VlanId::new(3001).unwrap())),
            ..Default::default()
        };
        port.has_network_address.set(
            IpFamily::Ipv4,
            NetworkAddress {
                kind: "ipv4-address".to_string(),
                value: "10.1.1.2/24".to_string(),
            },
        );
        let mut path = SwitchedPath::default();
        path.params.exists_during = Some(ExistsDuring::new(Some("urn:x:lifetime".into()), 100, 200));
        path.hosts
            .entry("dtn01".to_string())
            .or_default()
            .insert("eth0".to_string(), port);

        let mut route = Route::default();
        route.next_hop.insert(
            "ipv6-address".to_string(),
            RouteValue {
                kind: "ipv6-address".to_string(),
                value: "2001:db8::1".to_string(),
                key: None,
            },
        );
        let entry = RouteEntry {
            has_route: BTreeMap::from([("urn:x:route".to_string(), route)]),
            provides_route: Some("conn-rst".to_string()),
            ..Default::default()
        };
        let mut routed = RoutedPath::default();
        routed
            .hosts
            .entry("sw1".to_string())
            .or_default()
            .insert(IpFamily::Ipv6, entry);

        let mut doc = ActiveDeltas::default();
        doc.vsw.insert("conn-vsw".to_string(), path);
        doc.rst.insert("conn-rst".to_string(), routed);
        doc.rebuild_indices();
        doc
    }

    #[test]
    fn test_json_round_trip() {
        let doc = sample();
        let json = serde_json::to_string(&doc).unwrap();
        let back: ActiveDeltas = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["vsw"]["conn-vsw"]["dtn01"]["eth0"]["hasLabel"]["value"], 3001);
        assert_eq!(json["vsw"]["conn-vsw"]["_params"]["existsDuring"]["end"], 200);
        assert_eq!(
            json["rst"]["conn-rst"]["sw1"]["ipv6"]["hasRoute"]["urn:x:route"]["nextHop"]
                ["ipv6-address"]["value"],
            "2001:db8::1"
        );
        assert_eq!(json["SubnetMapping"]["dtn01"]["providesSubnet"][0], "conn-vsw");
    }

    #[test]
    fn test_rebuild_indices() {
        let doc = sample();
        assert!(doc.used_vlans["dtn01"].contains(&VlanId::new(3001).unwrap()));
        assert!(doc.used_ips["dtn01"].contains("10.1.1.2/24"));
        assert!(doc.used_ips["sw1"].contains("2001:db8::1"));
        assert!(doc.routing_mapping["sw1"].provides_route["conn-rst"].contains(&IpFamily::Ipv6));
    }

    #[test]
    fn test_window_semantics() {
        let a = ExistsDuring::new(None, 100, 200);
        let b = ExistsDuring::new(None, 200, 300);
        let c = ExistsDuring::new(None, 150, 250);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(a.is_active(100));
        assert!(!a.is_active(200));
        assert!(a.is_ended(200));
    }

    #[test]
    fn test_remove_connection() {
        let mut doc = sample();
        assert!(doc.remove_connection("conn-vsw"));
        assert!(!doc.remove_connection("conn-vsw"));
        assert_eq!(doc.connection_ids(), BTreeSet::from(["conn-rst".to_string()]));
    }

    #[test]
    fn test_rejects_reserved_vlan() {
        let json = r#"{"vsw": {"c": {"h": {"p": {"hasLabel": {"labeltype": "ethernet#vlan", "value": 4095}}}}}}"#;
        assert!(serde_json::from_str::<ActiveDeltas>(json).is_err());
    }
}
