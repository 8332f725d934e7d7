//! `sense_bgp` section of routed connections.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use srm_common::{SrmError, SrmResult};
use srm_types::{ActiveDeltas, IpFamily, Route};
use tracing::debug;

use super::{normalize_ip, host_address, DesiredConfig, Presence, RenderContext, RenderedPort};

/// First sequence number of a route map.
const ROUTE_MAP_FIRST_SEQ: u32 = 10;

/// Short identifier of a connection used in prefix-list and route-map names.
pub fn route_uid(connection: &str) -> String {
    let digest = Sha256::digest(connection.as_bytes());
    hex::encode(digest)[..10].to_string()
}

fn map_in(ruid: &str) -> String {
    format!("sense-{}-mapin", ruid)
}

fn map_out(ruid: &str) -> String {
    format!("sense-{}-mapout", ruid)
}

fn list_from(ruid: &str) -> String {
    format!("sense-{}-from", ruid)
}

fn list_to(ruid: &str) -> String {
    format!("sense-{}-to", ruid)
}

/// A BGP neighbor bound to the route maps of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub remote_asn: String,
    pub state: Presence,
    /// `in` / `out` → route map name → state.
    pub route_map: BTreeMap<String, BTreeMap<String, Presence>>,
}

/// Desired BGP state of one switch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf: Option<String>,
    pub state: Presence,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ipv4_network: BTreeMap<String, Presence>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ipv6_network: BTreeMap<String, Presence>,
    /// family → neighbor address → neighbor.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub neighbor: BTreeMap<IpFamily, BTreeMap<String, Neighbor>>,
    /// family → prefix → prefix-list name → state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prefix_list: BTreeMap<IpFamily, BTreeMap<String, BTreeMap<String, Presence>>>,
    /// family → route-map name → sequence → matched prefix-list → state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub route_map: BTreeMap<IpFamily, BTreeMap<String, BTreeMap<u32, BTreeMap<String, Presence>>>>,
}

impl BgpConfig {
    fn networks_mut(&mut self, family: IpFamily) -> &mut BTreeMap<String, Presence> {
        match family {
            IpFamily::Ipv4 => &mut self.ipv4_network,
            IpFamily::Ipv6 => &mut self.ipv6_network,
        }
    }

    fn add_route_map(&mut self, family: IpFamily, name: String, matched: String) {
        let sequences = self
            .route_map
            .entry(family)
            .or_default()
            .entry(name)
            .or_default();
        let seq = ROUTE_MAP_FIRST_SEQ + sequences.len() as u32;
        sequences
            .entry(seq)
            .or_default()
            .insert(matched, Presence::Present);
    }

    fn add_prefix_lists(&mut self, family: IpFamily, ruid: &str, route: &Route) {
        if let Some(own) = route.route_from(family) {
            self.prefix_list
                .entry(family)
                .or_default()
                .entry(normalize_ip(own))
                .or_default()
                .insert(list_to(ruid), Presence::Present);
            self.add_route_map(family, map_out(ruid), list_to(ruid));
        }
        if let Some(remote) = route.route_to(family) {
            self.prefix_list
                .entry(family)
                .or_default()
                .entry(normalize_ip(remote))
                .or_default()
                .insert(list_from(ruid), Presence::Present);
            self.add_route_map(family, map_in(ruid), list_from(ruid));
        }
    }

    fn add_neighbor(
        &mut self,
        family: IpFamily,
        ruid: &str,
        conn: &str,
        address: String,
        remote_asn: &str,
    ) -> SrmResult<()> {
        let neighbors = self.neighbor.entry(family).or_default();
        if neighbors.contains_key(&address) {
            return Err(SrmError::bad_request(format!(
                "Neighbor {} requested by {} is already defined. Multipath neighbors are not supported",
                address, conn
            )));
        }
        neighbors.insert(
            address,
            Neighbor {
                remote_asn: remote_asn.to_string(),
                state: Presence::Present,
                route_map: BTreeMap::from([
                    ("in".to_string(), BTreeMap::from([(map_in(ruid), Presence::Present)])),
                    ("out".to_string(), BTreeMap::from([(map_out(ruid), Presence::Present)])),
                ]),
            },
        );
        Ok(())
    }
}

fn default_bgp(ctx: &RenderContext<'_>) -> BgpConfig {
    let site = ctx.config.primary_site().ok().map(|(_, site)| site);
    BgpConfig {
        asn: ctx
            .switch_config
            .private_asn
            .or_else(|| site.and_then(|s| s.private_asn)),
        vrf: ctx
            .switch_config
            .vrf
            .clone()
            .or_else(|| site.and_then(|s| s.vrf.clone())),
        state: Presence::Present,
        ..Default::default()
    }
}

/// Adds the routed connections that touch the switch to `out.sense_bgp`.
///
/// Switches running routed services always get a `sense_bgp` section, even
/// an empty one, so removed neighbors can be marked absent.
///
/// # Errors
///
/// `BadRequest` when a connection asks for more than one next-hop of a
/// family, or reuses a neighbor of another connection.
pub fn render_bgp(
    ctx: &RenderContext<'_>,
    active: &ActiveDeltas,
    out: &mut DesiredConfig,
) -> SrmResult<()> {
    let mut bgp = default_bgp(ctx);
    let mut touched = false;

    for (conn, path) in &active.rst {
        let Some(families) = path.hosts.get(ctx.switch) else {
            continue;
        };
        let window = path.window();
        if !window.is_started(ctx.now) || window.is_ended(ctx.now) {
            debug!(connection = %conn, "Routed connection outside its lifetime, skipping");
            continue;
        }
        touched = true;
        let ruid = route_uid(conn);
        for (family, entry) in families {
            let family = *family;
            let mut next_hops: Vec<&str> = entry.next_hops(family).collect();
            next_hops.sort_unstable();
            next_hops.dedup();
            if next_hops.len() > 1 {
                return Err(SrmError::bad_request(format!(
                    "Connection {} requests {} next-hops for {}. Multipath is not supported",
                    conn,
                    next_hops.len(),
                    family
                )));
            }

            for route in entry.has_route.values() {
                if let Some(own) = route.route_from(family) {
                    bgp.networks_mut(family)
                        .insert(normalize_ip(own), Presence::Present);
                }
                if let (Some(hop), Some(asn)) = (route.next_hop(family), route.remote_asn()) {
                    bgp.add_neighbor(family, &ruid, conn, host_address(hop), asn)?;
                }
                bgp.add_prefix_lists(family, &ruid, route);
            }
            out.ports.push(RenderedPort {
                uuid: conn.clone(),
                uuidtype: "rst",
                hostport: family.as_str().to_string(),
            });
        }
    }

    if touched || ctx.switch_config.rst || ctx.switch_config.private_asn.is_some() {
        out.sense_bgp = Some(bgp);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use srm_test::active_deltas::{merge, rst, RouteSpec};
    use srm_test::{frontend_config, NOW};

    fn spec<'a>(hop: &'a str, from: &'a str, to: &'a str) -> RouteSpec<'a> {
        RouteSpec {
            family: IpFamily::Ipv6,
            next_hop: Some(hop),
            route_from: Some(from),
            route_to: Some(to),
            remote_asn: Some("64512"),
        }
    }

    fn render(doc: &ActiveDeltas) -> SrmResult<DesiredConfig> {
        let config = frontend_config();
        let ctx = RenderContext::new(&config, "sw1", None, NOW).unwrap();
        let mut out = DesiredConfig::default();
        render_bgp(&ctx, doc, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_route_uid_is_stable() {
        assert_eq!(route_uid("conn-1").len(), 10);
        assert_eq!(route_uid("conn-1"), route_uid("conn-1"));
        assert_ne!(route_uid("conn-1"), route_uid("conn-2"));
    }

    #[test]
    fn test_empty_section_for_rst_switch() {
        let out = render(&ActiveDeltas::default()).unwrap();
        let bgp = out.sense_bgp.unwrap();
        assert_eq!(bgp.asn, Some(65000));
        assert_eq!(bgp.state, Presence::Present);
        assert!(bgp.neighbor.is_empty());
    }

    #[test]
    fn test_neighbor_prefix_lists_and_route_maps() {
        let doc = rst(
            "conn-r1",
            "sw1",
            spec("2001:db8:ff::2/64", "2001:db8:100::/48", "2001:db8:200::/48"),
            NOW - 10,
            NOW + 3600,
        );
        let out = render(&doc).unwrap();
        let bgp = out.sense_bgp.unwrap();
        let ruid = route_uid("conn-r1");

        assert_eq!(bgp.ipv6_network["2001:db8:100::/48"], Presence::Present);
        let neighbor = &bgp.neighbor[&IpFamily::Ipv6]["2001:db8:ff::2"];
        assert_eq!(neighbor.remote_asn, "64512");
        assert_eq!(neighbor.route_map["in"][&map_in(&ruid)], Presence::Present);
        assert_eq!(neighbor.route_map["out"][&map_out(&ruid)], Presence::Present);

        let lists = &bgp.prefix_list[&IpFamily::Ipv6];
        assert_eq!(lists["2001:db8:100::/48"][&list_to(&ruid)], Presence::Present);
        assert_eq!(lists["2001:db8:200::/48"][&list_from(&ruid)], Presence::Present);

        let maps = &bgp.route_map[&IpFamily::Ipv6];
        assert_eq!(maps[&map_out(&ruid)][&10][&list_to(&ruid)], Presence::Present);
        assert_eq!(maps[&map_in(&ruid)][&10][&list_from(&ruid)], Presence::Present);

        assert_eq!(out.ports.len(), 1);
        assert_eq!(out.ports[0].uuidtype, "rst");
        assert_eq!(out.ports[0].hostport, "ipv6");
    }

    #[test]
    fn test_shared_neighbor_is_rejected() {
        let a = rst(
            "conn-r1",
            "sw1",
            spec("2001:db8:ff::2", "2001:db8:100::/48", "2001:db8:200::/48"),
            NOW - 10,
            NOW + 3600,
        );
        let b = rst(
            "conn-r2",
            "sw1",
            spec("2001:db8:ff::2", "2001:db8:101::/48", "2001:db8:201::/48"),
            NOW - 10,
            NOW + 3600,
        );
        let err = render(&merge(a, b)).unwrap_err();
        assert_eq!(err.code().0, "BadRequestError");
    }

    #[test]
    fn test_not_started_connection_skipped() {
        let doc = rst(
            "conn-r1",
            "sw1",
            spec("2001:db8:ff::2", "2001:db8:100::/48", "2001:db8:200::/48"),
            NOW + 100,
            NOW + 3600,
        );
        let bgp = render(&doc).unwrap().sense_bgp.unwrap();
        assert!(bgp.neighbor.is_empty());
        assert!(bgp.prefix_list.is_empty());
    }
}
