//! Conflict checks between active-deltas documents.
//!
//! Everything here is side-effect free: the checker is built from a config
//! snapshot and the last reported host facts, then asked about documents.

use std::collections::BTreeMap;

use srm_common::config::{SiteConfig, SwitchConfig};
use srm_common::{FrontendConfig, SrmError, SrmResult};
use srm_types::{
    ActiveDeltas, ExistsDuring, HostFacts, IpFamily, IpPrefix, PortRequest, RouteEntry,
    SwitchedKind, SwitchedPath, VlanId,
};
use tracing::{debug, info};

/// Resources one (connection, host) pair claims.
#[derive(Debug, Default)]
struct Claims {
    vlans: Vec<(String, VlanId)>,
    addresses: Vec<(IpFamily, String)>,
}

impl Claims {
    fn of_ports(ports: &BTreeMap<String, PortRequest>) -> Self {
        let mut claims = Claims::default();
        for (port, request) in ports {
            if let Some(vlan) = request.vlan() {
                claims.vlans.push((port.clone(), vlan));
            }
            for family in IpFamily::ALL {
                if let Some(address) = request.has_network_address.get(family) {
                    claims.addresses.push((family, address.value.clone()));
                }
            }
        }
        claims
    }
}

/// Validates requested resources against configuration and against each
/// other.
#[derive(Debug, Clone)]
pub struct ConflictChecker {
    site: SiteConfig,
    switches: BTreeMap<String, SwitchConfig>,
    hosts: BTreeMap<String, HostFacts>,
}

impl ConflictChecker {
    pub fn new(config: &FrontendConfig, site: &str) -> SrmResult<Self> {
        let site = config.site(site)?.clone();
        let switches = site
            .switch
            .iter()
            .filter_map(|name| config.switches.get(name).map(|s| (name.clone(), s.clone())))
            .collect();
        Ok(Self {
            site,
            switches,
            hosts: BTreeMap::new(),
        })
    }

    /// Adds the facts agents reported for their hosts.
    pub fn with_hosts(mut self, hosts: BTreeMap<String, HostFacts>) -> Self {
        self.hosts = hosts;
        self
    }

    fn unknown_host(host: &str) -> SrmError {
        SrmError::overlap(format!("Hostname {} not available in this Frontend", host))
    }

    fn host_interface<'a>(
        &'a self,
        host: &str,
        port: &str,
    ) -> SrmResult<Option<&'a srm_types::InterfaceInfo>> {
        let Some(facts) = self.hosts.get(host) else {
            return Ok(None);
        };
        facts.net_info.interfaces.get(port).map(Some).ok_or_else(|| {
            SrmError::overlap(format!(
                "Interface {} not available for dtn {}. Available interfaces: {:?}",
                port,
                host,
                facts.net_info.interfaces.keys().collect::<Vec<_>>()
            ))
        })
    }

    /// Checks a vlan against the range configured for the switch port, or
    /// reported by the agent for the host interface.
    pub fn vlan_in_range(&self, host: &str, port: &str, vlan: VlanId) -> SrmResult<()> {
        let range = if let Some(switch) = self.switches.get(host) {
            switch.port_vlan_range(port)
        } else if let Some(interface) = self.host_interface(host, port)? {
            &interface.vlan_range_list
        } else {
            return Err(Self::unknown_host(host));
        };
        if !range.is_empty() && !range.contains(vlan) {
            return Err(SrmError::overlap(format!(
                "Vlan {} not available for {} port {}. Allowed vlans: {}",
                vlan, host, port, range
            )));
        }
        Ok(())
    }

    /// Address pools that apply to `(host, port)`: port, switch, then site
    /// level for switches; the interface pools for agents.
    fn address_pools(&self, host: &str, port: Option<&str>, family: IpFamily) -> SrmResult<Vec<String>> {
        if let Some(switch) = self.switches.get(host) {
            let port_pool = port.and_then(|p| switch.ports.get(p)).and_then(|p| match family {
                IpFamily::Ipv4 => p.ipv4_address_pool.clone(),
                IpFamily::Ipv6 => p.ipv6_address_pool.clone(),
            });
            if let Some(pool) = port_pool {
                return Ok(pool);
            }
            let pool = switch.address_pool(family);
            if !pool.is_empty() {
                return Ok(pool.to_vec());
            }
            return Ok(self.site.address_pool(family).to_vec());
        }
        match port {
            Some(port) => match self.host_interface(host, port)? {
                Some(interface) => Ok(interface.address_pools(family).to_vec()),
                None => Err(Self::unknown_host(host)),
            },
            None if self.hosts.contains_key(host) => Ok(Vec::new()),
            None => Err(Self::unknown_host(host)),
        }
    }

    /// Checks that an address lies inside one of the pools configured for
    /// the host. Hosts without pools accept any address.
    pub fn ip_in_pool(
        &self,
        host: &str,
        port: Option<&str>,
        ip: &str,
        family: IpFamily,
    ) -> SrmResult<()> {
        let pools = self.address_pools(host, port, family)?;
        if pools.is_empty() || address_in_pools(&pools, ip, family) {
            return Ok(());
        }
        Err(SrmError::wrong_ip(format!(
            "IP {} not available for {} in configuration. Allowed IPs: {:?}",
            ip, host, pools
        )))
    }

    /// Checks that an announced prefix lies inside the subnet pools of the
    /// switch or the site.
    pub fn prefix_in_pool(&self, host: &str, prefix: &str, family: IpFamily) -> SrmResult<()> {
        let switch = self.switches.get(host).ok_or_else(|| Self::unknown_host(host))?;
        let pools = if switch.subnet_pool(family).is_empty() {
            self.site.subnet_pool(family)
        } else {
            switch.subnet_pool(family)
        };
        if pools.is_empty() || prefix_in_pools(pools, prefix, family) {
            return Ok(());
        }
        Err(SrmError::wrong_ip(format!(
            "Prefix {} not available for {} in configuration. Allowed subnets: {:?}",
            prefix, host, pools
        )))
    }

    fn check_switched_host(&self, host: &str, claims: &Claims) -> SrmResult<()> {
        for (port, vlan) in &claims.vlans {
            self.vlan_in_range(host, port, *vlan)?;
        }
        Ok(())
    }

    fn check_switched(
        &self,
        conn: &str,
        path: &SwitchedPath,
        old: &ActiveDeltas,
    ) -> SrmResult<()> {
        check_window(conn, path.params.exists_during.as_ref())?;
        for request in path.hosts.values().flat_map(|ports| ports.values()) {
            check_window(conn, request.params.exists_during.as_ref())?;
            if let Some(service) = &request.has_service {
                check_window(conn, service.exists_during.as_ref())?;
            }
        }
        let window = path.window();
        for (host, ports) in &path.hosts {
            let claims = Claims::of_ports(ports);
            self.check_switched_host(host, &claims)?;
            for (port, request) in ports {
                for family in IpFamily::ALL {
                    if let Some(address) = request.has_network_address.get(family) {
                        self.ip_in_pool(host, Some(port), &address.value, family)?;
                    }
                }
            }

            for kind in SwitchedKind::ALL {
                for (old_conn, old_path) in old.switched(kind) {
                    if old_conn == conn || !time_overlap(&window, &old_path.window()) {
                        continue;
                    }
                    let Some(old_ports) = old_path.hosts.get(host) else {
                        continue;
                    };
                    let old_claims = Claims::of_ports(old_ports);
                    for (_, vlan) in &claims.vlans {
                        if old_claims.vlans.iter().any(|(_, v)| v == vlan) {
                            return Err(SrmError::overlap(format!(
                                "New Request VLANs Overlap on same controlled resources. \
                                 Overlap resources: {} and {} (host {}, vlan {})",
                                conn, old_conn, host, vlan
                            )));
                        }
                    }
                    for (family, address) in &claims.addresses {
                        for (old_family, old_address) in &old_claims.addresses {
                            if family == old_family && ip_overlap(address, old_address, *family) {
                                return Err(SrmError::overlap(format!(
                                    "New Request {} overlap on same controlled resources. \
                                     Overlap resources: {} and {} (host {})",
                                    family, conn, old_conn, host
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_route_entry(&self, host: &str, family: IpFamily, entry: &RouteEntry) -> SrmResult<()> {
        for next_hop in entry.next_hops(family) {
            self.ip_in_pool(host, None, next_hop, family)?;
        }
        if let Some(route_from) = entry.route_from(family) {
            self.prefix_in_pool(host, route_from, family)?;
        }
        Ok(())
    }

    fn check_routed(
        &self,
        conn: &str,
        path: &srm_types::RoutedPath,
        old: &ActiveDeltas,
    ) -> SrmResult<()> {
        check_window(conn, path.params.exists_during.as_ref())?;
        for entry in path.hosts.values().flat_map(|families| families.values()) {
            check_window(conn, entry.params.exists_during.as_ref())?;
            if let Some(service) = &entry.has_service {
                check_window(conn, service.exists_during.as_ref())?;
            }
        }
        let window = path.window();
        for (host, families) in &path.hosts {
            for (family, entry) in families {
                self.check_route_entry(host, *family, entry)?;
            }
            for (old_conn, old_path) in &old.rst {
                if old_conn == conn || !time_overlap(&window, &old_path.window()) {
                    continue;
                }
                let Some(old_families) = old_path.hosts.get(host) else {
                    continue;
                };
                for (family, entry) in families {
                    let Some(old_entry) = old_families.get(family) else {
                        continue;
                    };
                    let hops_overlap = entry.next_hops(*family).any(|hop| {
                        old_entry
                            .next_hops(*family)
                            .any(|old_hop| ip_overlap(hop, old_hop, *family))
                    });
                    let side_overlaps = |a: Option<&str>, b: Option<&str>| match (a, b) {
                        (Some(a), Some(b)) => ip_overlap(a, b, *family),
                        _ => false,
                    };
                    let routes_overlap = side_overlaps(
                        entry.route_from(*family),
                        old_entry.route_from(*family),
                    ) && side_overlaps(entry.route_to(*family), old_entry.route_to(*family));
                    if hops_overlap || routes_overlap {
                        return Err(SrmError::overlap(format!(
                            "New Request {} overlap on same controlled resources. \
                             Overlap resources: {} and {} (host {})",
                            family, conn, old_conn, host
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks every connection of `new` that is absent from `old` or
    /// differs from it. Unchanged connections were validated when they were
    /// accepted.
    pub fn check_conflicts(&self, new: &ActiveDeltas, old: &ActiveDeltas) -> SrmResult<()> {
        if new == old {
            return Ok(());
        }
        for kind in SwitchedKind::ALL {
            for (conn, path) in new.switched(kind) {
                if old.switched(kind).get(conn) == Some(path) {
                    continue;
                }
                debug!(conn = %conn, kind = kind.as_str(), "Checking switched request");
                self.check_switched(conn, path, old)?;
            }
        }
        for (conn, path) in &new.rst {
            if old.rst.get(conn) == Some(path) {
                continue;
            }
            debug!(conn = %conn, "Checking routed request");
            self.check_routed(conn, path, old)?;
        }
        Ok(())
    }
}

/// A recorded lifetime must start before it ends.
fn check_window(conn: &str, window: Option<&ExistsDuring>) -> SrmResult<()> {
    match window {
        Some(window) if !window.is_valid() => Err(SrmError::bad_request(format!(
            "Request {} has an invalid lifetime: start {} is not before end {}",
            conn, window.start, window.end
        ))),
        _ => Ok(()),
    }
}

/// Removes every connection whose lifetime is over at `now`.
///
/// Returns the cleaned document and the removed connection ids.
pub fn check_active_config(doc: &ActiveDeltas, now: i64) -> (ActiveDeltas, Vec<String>) {
    let mut cleaned = doc.clone();
    let mut expired = Vec::new();

    for kind in SwitchedKind::ALL {
        for (conn, path) in doc.switched(kind) {
            if path.window().is_ended(now) {
                expired.push(conn.clone());
            }
        }
    }
    for (conn, path) in &doc.rst {
        let entry_ended = path
            .hosts
            .values()
            .flat_map(|families| families.values())
            .any(|entry| entry.params.window().is_ended(now));
        if path.window().is_ended(now) || entry_ended {
            expired.push(conn.clone());
        }
    }

    for conn in &expired {
        info!(conn = %conn, "Lifetime is over, removing from active deltas");
        cleaned.remove_connection(conn);
    }
    if !expired.is_empty() {
        cleaned.rebuild_indices();
    }
    (cleaned, expired)
}

/// Half-open interval intersection of two lifetimes.
pub fn time_overlap(a: &ExistsDuring, b: &ExistsDuring) -> bool {
    a.overlaps(b)
}

/// CIDR intersection of two addresses or prefixes of `family`. Unparsable
/// values and mismatched families never overlap.
pub fn ip_overlap(a: &str, b: &str, family: IpFamily) -> bool {
    match (IpPrefix::parse_lenient(a), IpPrefix::parse_lenient(b)) {
        (Ok(a), Ok(b)) => a.family() == family && a.overlaps(&b),
        _ => false,
    }
}

/// Pool entries that parse as prefixes of `family`. Anything else is an
/// opaque pool name and never matches.
fn parsed_pools(pools: &[String], family: IpFamily) -> impl Iterator<Item = IpPrefix> + '_ {
    pools
        .iter()
        .filter_map(|p| IpPrefix::parse_lenient(p).ok())
        .filter(move |p| p.family() == family)
}

/// True when the address (host bits included) lies in one of the pools.
pub fn address_in_pools(pools: &[String], ip: &str, family: IpFamily) -> bool {
    let Ok(candidate) = IpPrefix::parse_lenient(ip) else {
        return false;
    };
    parsed_pools(pools, family).any(|pool| pool.contains(candidate.address()))
}

/// True when the whole prefix lies in one of the pools.
pub fn prefix_in_pools(pools: &[String], prefix: &str, family: IpFamily) -> bool {
    let Ok(candidate) = IpPrefix::parse_lenient(prefix) else {
        return false;
    };
    parsed_pools(pools, family).any(|pool| pool.contains_prefix(&candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use srm_test::{active_deltas, frontend_config, host_facts, SITE_NAME};

    const NOW: i64 = 1_700_000_000;

    fn checker() -> ConflictChecker {
        let config = frontend_config();
        ConflictChecker::new(&config, SITE_NAME)
            .unwrap()
            .with_hosts(BTreeMap::from([("dtn01".to_string(), host_facts())]))
    }

    #[test]
    fn test_ip_overlap() {
        assert!(ip_overlap("10.1.1.2/24", "10.1.1.3/24", IpFamily::Ipv4));
        assert!(!ip_overlap("10.1.1.2/24", "10.1.2.3/24", IpFamily::Ipv4));
        assert!(!ip_overlap("10.1.1.2/24", "2001:db8::1/64", IpFamily::Ipv4));
        assert!(!ip_overlap("10.1.1.2/24", "10.1.1.2/24", IpFamily::Ipv6));
        assert!(!ip_overlap("not-an-ip", "10.1.1.2/24", IpFamily::Ipv4));
    }

    #[test]
    fn test_time_overlap_is_half_open() {
        let a = ExistsDuring::new(None, 100, 200);
        assert!(!time_overlap(&a, &ExistsDuring::new(None, 200, 300)));
        assert!(time_overlap(&a, &ExistsDuring::new(None, 199, 300)));
        assert!(!time_overlap(&a, &ExistsDuring::new(None, 0, 100)));
    }

    #[test]
    fn test_pool_boundaries_accepted() {
        let pools = vec!["10.1.1.0/24".to_string(), "vlan-pool-a".to_string()];
        assert!(address_in_pools(&pools, "10.1.1.0/24", IpFamily::Ipv4));
        assert!(address_in_pools(&pools, "10.1.1.255/24", IpFamily::Ipv4));
        assert!(!address_in_pools(&pools, "10.1.2.0/24", IpFamily::Ipv4));
        assert!(prefix_in_pools(&pools, "10.1.1.128/25", IpFamily::Ipv4));
        assert!(!prefix_in_pools(&pools, "10.1.0.0/16", IpFamily::Ipv4));
    }

    #[test]
    fn test_vlan_in_range() {
        let checker = checker();
        let vlan = |v| VlanId::new(v).unwrap();
        assert!(checker.vlan_in_range("sw1", "Ethernet0", vlan(3001)).is_ok());
        assert!(checker.vlan_in_range("sw1", "Ethernet0", vlan(100)).is_err());
        assert!(checker.vlan_in_range("dtn01", "eth0", vlan(3001)).is_ok());
        let err = checker.vlan_in_range("dtn01", "eth9", vlan(3001)).unwrap_err();
        assert_eq!(err.code().1, -7);
        assert!(checker.vlan_in_range("ghost", "eth0", vlan(3001)).is_err());
    }

    #[test]
    fn test_ip_in_pool() {
        let checker = checker();
        assert!(checker
            .ip_in_pool("dtn01", Some("eth0"), "10.1.1.2/24", IpFamily::Ipv4)
            .is_ok());
        let err = checker
            .ip_in_pool("dtn01", Some("eth0"), "172.16.0.1/24", IpFamily::Ipv4)
            .unwrap_err();
        assert_eq!(err.code().1, -8);
    }

    #[test]
    fn test_same_vlan_same_host_overlapping_time_conflicts() {
        let checker = checker();
        let old = active_deltas::vsw("conn+a", "dtn01", "eth0", 3001, Some("10.1.1.2/24"), NOW, NOW + 3600);
        let mut new = old.clone();
        let other = active_deltas::vsw("conn+b", "dtn01", "eth0", 3001, None, NOW + 1800, NOW + 7200);
        new.vsw.extend(other.vsw);
        let err = checker.check_conflicts(&new, &old).unwrap_err();
        assert_eq!(err.code().0, "OverlapException");
    }

    #[test]
    fn test_adjacent_windows_do_not_conflict() {
        let checker = checker();
        let old = active_deltas::vsw("conn+a", "dtn01", "eth0", 3001, None, NOW, NOW + 3600);
        let mut new = old.clone();
        let other = active_deltas::vsw("conn+b", "dtn01", "eth0", 3001, None, NOW + 3600, NOW + 7200);
        new.vsw.extend(other.vsw);
        assert!(checker.check_conflicts(&new, &old).is_ok());
    }

    #[test]
    fn test_overlapping_address_conflicts() {
        let checker = checker();
        let old = active_deltas::vsw("conn+a", "dtn01", "eth0", 3001, Some("10.1.1.2/24"), NOW, NOW + 3600);
        let mut new = old.clone();
        let other = active_deltas::vsw("conn+b", "dtn01", "eth0", 3002, Some("10.1.1.3/24"), NOW, NOW + 3600);
        new.vsw.extend(other.vsw);
        assert!(checker.check_conflicts(&new, &old).is_err());
    }

    #[test]
    fn test_inverted_lifetime_rejected() {
        let checker = checker();
        let old = ActiveDeltas::default();
        let new = active_deltas::vsw("conn+bad", "dtn01", "eth0", 3001, None, NOW + 3600, NOW);
        let err = checker.check_conflicts(&new, &old).unwrap_err();
        assert_eq!(err.code().0, "BadRequestError");

        let empty = active_deltas::vsw("conn+bad", "dtn01", "eth0", 3001, None, NOW, NOW);
        assert!(checker.check_conflicts(&empty, &old).is_err());

        let mut routed = active_deltas::rst(
            "conn+r",
            "dtn01",
            active_deltas::RouteSpec {
                family: IpFamily::Ipv6,
                next_hop: None,
                route_from: None,
                route_to: None,
                remote_asn: None,
            },
            NOW,
            NOW + 3600,
        );
        for entry in routed
            .rst
            .values_mut()
            .flat_map(|path| path.hosts.values_mut())
            .flat_map(|families| families.values_mut())
        {
            entry.params.exists_during = Some(ExistsDuring::new(None, NOW + 10, NOW + 5));
        }
        let err = checker.check_conflicts(&routed, &old).unwrap_err();
        assert_eq!(err.code().1, -9);
    }

    #[test]
    fn test_unchanged_document_is_accepted() {
        let checker = checker();
        let doc = active_deltas::vsw("conn+a", "dtn01", "eth0", 3001, None, NOW, NOW + 3600);
        assert!(checker.check_conflicts(&doc, &doc).is_ok());
    }

    #[test]
    fn test_expired_entries_are_swept() {
        let mut doc = active_deltas::vsw("conn+a", "dtn01", "eth0", 3001, None, NOW - 3600, NOW);
        let live = active_deltas::vsw("conn+b", "dtn01", "eth0", 3002, None, NOW - 3600, NOW + 1);
        doc.vsw.extend(live.vsw);
        doc.rebuild_indices();

        let (cleaned, expired) = check_active_config(&doc, NOW);
        assert_eq!(expired, vec!["conn+a".to_string()]);
        assert!(cleaned.vsw.contains_key("conn+b"));
        assert!(!cleaned.vsw.contains_key("conn+a"));
        assert!(!cleaned.subnet_mapping["dtn01"].provides_subnet.contains("conn+a"));
    }
}
