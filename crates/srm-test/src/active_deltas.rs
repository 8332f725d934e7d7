//! Hand-built active-deltas documents.

use srm_types::{
    ActiveDeltas, ExistsDuring, IpFamily, Label, NetworkAddress, PortRequest, Route,
    RouteEntry, RouteValue, RoutedPath, SwitchedPath, VlanId,
};

/// Lifetime URI the fixtures attach to `conn`.
pub fn lifetime_uri(conn: &str) -> String {
    format!("{}:{}:lifetime", crate::SITE_URI, conn)
}

/// A port request for `vlan`, optionally with an ipv4 or ipv6 address
/// (the family follows the address).
pub fn port(vlan: u16, address: Option<&str>) -> PortRequest {
    let mut request = PortRequest {
        has_label: Some(Label::vlan(VlanId::new(vlan).expect("fixture vlan in range"))),
        ..Default::default()
    };
    if let Some(address) = address {
        let family = if address.contains(':') {
            IpFamily::Ipv6
        } else {
            IpFamily::Ipv4
        };
        request.has_network_address.set(
            family,
            NetworkAddress {
                kind: family.address_key(),
                value: address.to_string(),
            },
        );
    }
    request
}

/// A document holding one vsw connection with a single (host, port).
pub fn vsw(
    conn: &str,
    host: &str,
    port_name: &str,
    vlan: u16,
    address: Option<&str>,
    start: i64,
    end: i64,
) -> ActiveDeltas {
    let mut path = SwitchedPath::default();
    path.params.exists_during = Some(ExistsDuring::new(Some(lifetime_uri(conn)), start, end));
    path.hosts
        .entry(host.to_string())
        .or_default()
        .insert(port_name.to_string(), port(vlan, address));
    let mut doc = ActiveDeltas::default();
    doc.vsw.insert(conn.to_string(), path);
    doc.rebuild_indices();
    doc
}

fn route_value(kind: String, value: &str) -> RouteValue {
    RouteValue {
        kind,
        value: value.to_string(),
        key: None,
    }
}

/// Addressing of one routed connection on one host.
#[derive(Debug, Clone, Copy)]
pub struct RouteSpec<'a> {
    pub family: IpFamily,
    pub next_hop: Option<&'a str>,
    pub route_from: Option<&'a str>,
    pub route_to: Option<&'a str>,
    pub remote_asn: Option<&'a str>,
}

/// A document holding one rst connection with a single route on `host`.
pub fn rst(conn: &str, host: &str, spec: RouteSpec<'_>, start: i64, end: i64) -> ActiveDeltas {
    let mut route = Route::default();
    if let Some(hop) = spec.next_hop {
        route
            .next_hop
            .insert(spec.family.address_key(), route_value(spec.family.address_key(), hop));
    }
    if let Some(from) = spec.route_from {
        route.route_from.insert(
            spec.family.prefix_list_key(),
            route_value(spec.family.prefix_list_key(), from),
        );
    }
    if let Some(to) = spec.route_to {
        route.route_to.insert(
            spec.family.prefix_list_key(),
            route_value(spec.family.prefix_list_key(), to),
        );
    }
    if let Some(asn) = spec.remote_asn {
        route
            .route_to
            .insert("bgp-private-asn".to_string(), route_value("bgp-private-asn".to_string(), asn));
    }
    let mut entry = RouteEntry::default();
    entry
        .has_route
        .insert(format!("{}:{}:route+{}", crate::SITE_URI, host, conn), route);

    let mut path = RoutedPath::default();
    path.params.exists_during = Some(ExistsDuring::new(Some(lifetime_uri(conn)), start, end));
    path.hosts
        .entry(host.to_string())
        .or_default()
        .insert(spec.family, entry);
    let mut doc = ActiveDeltas::default();
    doc.rst.insert(conn.to_string(), path);
    doc.rebuild_indices();
    doc
}

/// Merges `other` into `doc` and rebuilds the indices.
pub fn merge(mut doc: ActiveDeltas, other: ActiveDeltas) -> ActiveDeltas {
    doc.vsw.extend(other.vsw);
    doc.kube.extend(other.kube);
    doc.singleport.extend(other.singleport);
    doc.rst.extend(other.rst);
    doc.rebuild_indices();
    doc
}
