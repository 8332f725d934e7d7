//! Graph → [`ActiveDeltas`].
//!
//! The parser walks four categories of the site graph:
//!
//! - `vsw`: `mrs:providesSubnet` children of every switch's vsw service,
//!   expanded through their bidirectional ports
//! - `kube`: vsw connections touching an interface a host aliases into
//!   containers
//! - `rst`: `mrs:providesRoute` and `mrs:providesRoutingTable` children of
//!   every switch's per-family routing service
//! - `singleport`: switch vlan ports no connection claims but that carry a
//!   tag or lifetime of their own
//!
//! Parsing never mutates its inputs; a malformed node yields a
//! [`ModelError`] naming the node.

use crate::error::{ModelError, ModelResult};
use crate::graph::Graph;
use crate::prefixes::{mrs, nml};
use crate::term::Term;
use crate::uri::{encode_port, vlan_suffix, SiteUris};
use srm_common::config::FrontendConfig;
use srm_common::timing::parse_timestamp;
use srm_common::SrmResult;
use srm_types::{
    ActiveDeltas, ExistsDuring, HostFacts, IpFamily, Label, NetworkAddress, Params, PortRequest,
    Route, RouteEntry, RouteValue, RoutedPath, ServiceParams, SwitchedKind, SwitchedPath, VlanId,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Tags the model publisher adds to delta-backed nodes; never part of a request.
pub const MONITOR_TAG_PREFIX: &str = "monitor:status:";

/// Service URIs of one switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchServices {
    pub name: String,
    /// Virtual switching service URI.
    pub vsw: Option<String>,
    /// Routing service URI (without family suffix).
    pub rst: Option<String>,
}

/// Everything the parser needs besides the graph.
#[derive(Debug, Clone)]
pub struct ParserContext {
    pub uris: SiteUris,
    pub switches: Vec<SwitchServices>,
    /// Host → interfaces aliased into containers (URI-encoded names).
    pub kube_hosts: BTreeMap<String, BTreeSet<String>>,
    /// Bandwidth in mbps of requests without a service.
    pub default_bandwidth: u64,
    pub now: i64,
}

impl ParserContext {
    pub fn new(site_uri: impl Into<String>, default_bandwidth: u64, now: i64) -> Self {
        Self {
            uris: SiteUris::new(site_uri),
            switches: Vec::new(),
            kube_hosts: BTreeMap::new(),
            default_bandwidth,
            now,
        }
    }

    /// Context of a configured site: every switch listed by the site offers
    /// a vsw service, and a routing service when `rst` is enabled.
    pub fn from_config(config: &FrontendConfig, site: &str, now: i64) -> SrmResult<Self> {
        let site_config = config.site(site)?;
        let mut ctx = Self::new(site_config.uri(), site_config.default_bandwidth, now);
        for switch in &site_config.switch {
            let rst = config.switches.get(switch).is_some_and(|s| s.rst);
            let vsw = config.vsw_name(switch).to_string();
            ctx = ctx.with_switch(switch, Some(&vsw), rst);
        }
        Ok(ctx)
    }

    pub fn with_switch(mut self, name: &str, vsw: Option<&str>, rst: bool) -> Self {
        let services = SwitchServices {
            name: name.to_string(),
            vsw: vsw.map(|v| self.uris.vsw_service(name, v)),
            rst: rst.then(|| self.uris.rst_service(name)),
        };
        self.switches.push(services);
        self
    }

    pub fn with_kube_host<I, S>(mut self, host: &str, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.kube_hosts
            .entry(host.to_string())
            .or_default()
            .extend(interfaces.into_iter().map(|i| encode_port(i.as_ref())));
        self
    }

    /// Registers a host's aliased interfaces from its reported facts.
    pub fn add_host_facts(&mut self, host: &str, facts: &HostFacts) {
        if let Some(kube) = facts.kube_info.as_ref().filter(|_| facts.is_kube()) {
            self.kube_hosts
                .entry(host.to_string())
                .or_default()
                .extend(kube.is_alias.keys().map(|i| encode_port(i)));
        }
    }

    fn is_switch(&self, name: &str) -> bool {
        self.switches.iter().any(|s| s.name == name)
    }
}

/// Converts site graphs into active-deltas documents.
#[derive(Debug, Clone)]
pub struct ModelParser {
    ctx: ParserContext,
}

impl ModelParser {
    pub fn new(ctx: ParserContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ParserContext {
        &self.ctx
    }

    /// Parses a graph. `previous` is the document currently in force; a
    /// connection whose lifetime was defaulted there keeps that window
    /// instead of sliding forward.
    pub fn parse(&self, graph: &Graph, previous: Option<&ActiveDeltas>) -> ModelResult<ActiveDeltas> {
        let mut out = ActiveDeltas::default();
        let mut claimed: BTreeSet<String> = BTreeSet::new();

        for switch in &self.ctx.switches {
            let Some(vsw) = &switch.vsw else {
                continue;
            };
            for conn in graph.objects(&Term::iri(vsw), &mrs("providesSubnet")) {
                let id = node_id(conn);
                if out.vsw.contains_key(&id) {
                    continue;
                }
                let path = self.switched_path(graph, conn, &mut claimed)?;
                debug!(connection = %id, hosts = path.hosts.len(), "parsed vsw connection");
                out.vsw.insert(id, path);
            }
        }

        let kube: Vec<String> = out
            .vsw
            .iter()
            .filter(|(_, path)| self.is_kube(path))
            .map(|(id, _)| id.clone())
            .collect();
        for id in kube {
            if let Some(path) = out.vsw.remove(&id) {
                out.kube.insert(id, path);
            }
        }

        for switch in &self.ctx.switches {
            if switch.rst.is_some() {
                for family in IpFamily::ALL {
                    self.routed_paths(graph, &switch.name, family, &mut out.rst)?;
                }
            }
        }

        self.singleports(graph, &claimed, &mut out)?;
        self.apply_defaults(&mut out, previous);
        out.rebuild_indices();
        Ok(out)
    }

    fn switched_path(
        &self,
        graph: &Graph,
        conn: &Term,
        claimed: &mut BTreeSet<String>,
    ) -> ModelResult<SwitchedPath> {
        let mut path = SwitchedPath {
            params: self.params(graph, conn)?,
            ..Default::default()
        };
        let bidi = nml("hasBidirectionalPort");
        let alias = nml("isAlias");
        let mut pending: BTreeSet<String> = graph.objects(conn, &bidi).map(node_id).collect();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        while let Some(port_uri) = pending.pop_first() {
            if !seen.insert(port_uri.clone()) || !self.ctx.uris.contains(&port_uri) {
                continue;
            }
            let port = Term::iri(port_uri.as_str());
            for nested in graph.objects(&port, &bidi).chain(graph.objects(&port, &alias)) {
                let nested = node_id(nested);
                if !seen.contains(&nested) {
                    pending.insert(nested);
                }
            }
            let Ok((host, name)) = self.ctx.uris.int_out(&port_uri) else {
                continue;
            };
            let request = self.port_request(graph, &port)?;
            claimed.insert(port_uri);
            let ports = path.hosts.entry(host).or_default();
            match ports.get_mut(&name) {
                Some(existing) => merge_port(existing, request),
                None => {
                    ports.insert(name, request);
                }
            }
        }
        Ok(path)
    }

    fn port_request(&self, graph: &Graph, port: &Term) -> ModelResult<PortRequest> {
        let uri = node_id(port);
        let mut request = PortRequest {
            params: self.params(graph, port)?,
            is_alias: graph.object(port, &nml("isAlias")).map(node_id),
            uri: Some(uri.clone()),
            ..Default::default()
        };

        let vlan = match graph.object(port, &nml("hasLabel")) {
            Some(label) => match graph.object(label, &nml("value")) {
                Some(value) => Some(parse_vlan(&node_id(label), value.as_str())?),
                None => vlan_suffix(&uri)
                    .map(|v| parse_vlan(&uri, &v.to_string()))
                    .transpose()?,
            },
            None => vlan_suffix(&uri)
                .map(|v| parse_vlan(&uri, &v.to_string()))
                .transpose()?,
        };
        request.has_label = vlan.map(Label::vlan);

        if let Some(service) = graph.object(port, &nml("hasService")) {
            request.has_service = Some(self.service(graph, service)?);
        }

        for address in graph.objects(port, &mrs("hasNetworkAddress")) {
            let Some(family) = address_family(graph, address) else {
                continue;
            };
            let value = graph
                .object(address, &mrs("value"))
                .ok_or_else(|| ModelError::missing(node_id(address), "mrs:value"))?;
            let kind = joined(graph.objects(address, &mrs("type")))
                .unwrap_or_else(|| family.address_key());
            request.has_network_address.set(
                family,
                NetworkAddress {
                    kind,
                    value: value.as_str().to_string(),
                },
            );
        }
        Ok(request)
    }

    /// Tags, encoding and lifetime of a connection or port.
    fn params(&self, graph: &Graph, subject: &Term) -> ModelResult<Params> {
        Ok(Params {
            exists_during: self.lifetime(graph, subject)?,
            tag: joined(
                graph
                    .objects(subject, &mrs("tag"))
                    .filter(|t| !t.as_str().starts_with(MONITOR_TAG_PREFIX)),
            ),
            belongs_to: joined(graph.objects(subject, &nml("belongsTo"))),
            encoding: joined(graph.objects(subject, &nml("encoding"))),
            label_swapping: joined(graph.objects(subject, &nml("labelSwapping"))),
            networkstatus: None,
        })
    }

    fn lifetime(&self, graph: &Graph, subject: &Term) -> ModelResult<Option<ExistsDuring>> {
        let Some(node) = graph.object(subject, &nml("existsDuring")) else {
            return Ok(None);
        };
        let uri = node_id(node);
        let read = |predicate: &str| -> ModelResult<i64> {
            let value = graph
                .object(node, &nml(predicate))
                .ok_or_else(|| ModelError::missing(uri.as_str(), format!("nml:{}", predicate)))?;
            parse_timestamp(value.as_str())
                .map_err(|e| ModelError::invalid_value(uri.as_str(), e.to_string()))
        };
        let start = read("start")?;
        let end = read("end")?;
        Ok(Some(ExistsDuring::new(Some(uri), start, end)))
    }

    fn service(&self, graph: &Graph, node: &Term) -> ModelResult<ServiceParams> {
        let uri = node_id(node);
        let number = |predicate: &str| -> ModelResult<Option<u64>> {
            graph
                .object(node, &mrs(predicate))
                .map(|value| {
                    value
                        .as_str()
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| {
                            ModelError::invalid_value(
                                uri.as_str(),
                                format!("mrs:{} is not a non-negative integer: {}", predicate, value.as_str()),
                            )
                        })
                })
                .transpose()
        };
        Ok(ServiceParams {
            available_capacity: number("availableCapacity")?,
            granularity: number("granularity")?,
            maximum_capacity: number("maximumCapacity")?,
            priority: number("priority")?,
            reservable_capacity: number("reservableCapacity")?,
            service_type: graph.object(node, &mrs("type")).map(|t| t.as_str().to_string()),
            unit: graph.object(node, &mrs("unit")).map(|t| t.as_str().to_string()),
            exists_during: self.lifetime(graph, node)?,
            uri: Some(uri.clone()),
        })
    }

    fn is_kube(&self, path: &SwitchedPath) -> bool {
        path.hosts.iter().any(|(host, ports)| {
            self.ctx
                .kube_hosts
                .get(host)
                .is_some_and(|aliased| ports.keys().any(|p| aliased.contains(p)))
        })
    }

    fn routed_paths(
        &self,
        graph: &Graph,
        switch: &str,
        family: IpFamily,
        rst: &mut BTreeMap<String, RoutedPath>,
    ) -> ModelResult<()> {
        let service = Term::iri(self.ctx.uris.rst_family(switch, family));

        let mut routes: BTreeSet<String> = BTreeSet::new();
        for conn in graph.objects(&service, &mrs("providesRoute")) {
            let id = node_id(conn);
            let route = self.route(graph, conn)?;
            let entry = self.routed_entry(graph, conn, switch, family, rst)?;
            entry.provides_route = Some(id.clone());
            entry.has_route.insert(id.clone(), route);
            routes.insert(id);
        }

        let mut members: Vec<(String, String)> = Vec::new();
        for table in graph.objects(&service, &mrs("providesRoutingTable")) {
            let id = node_id(table);
            if is_reserved_table(&id) {
                continue;
            }
            let mut has_route = BTreeMap::new();
            for route in graph.objects(table, &mrs("hasRoute")) {
                let route_id = node_id(route);
                has_route.insert(route_id.clone(), self.route(graph, route)?);
                if routes.contains(&route_id) {
                    members.push((route_id, id.clone()));
                }
            }
            let entry = self.routed_entry(graph, table, switch, family, rst)?;
            entry.provides_routing_table = Some(id);
            entry.has_route.extend(has_route);
        }

        for (route_id, table_id) in members {
            if let Some(entry) = rst
                .get_mut(&route_id)
                .and_then(|p| p.hosts.get_mut(switch))
                .and_then(|f| f.get_mut(&family))
            {
                entry.belongs_to_routing_table = Some(table_id);
            }
        }
        Ok(())
    }

    /// Entry of `conn` on `(switch, family)`, creating the path on first sight.
    fn routed_entry<'a>(
        &self,
        graph: &Graph,
        conn: &Term,
        switch: &str,
        family: IpFamily,
        rst: &'a mut BTreeMap<String, RoutedPath>,
    ) -> ModelResult<&'a mut RouteEntry> {
        let id = node_id(conn);
        if !rst.contains_key(&id) {
            let path = RoutedPath {
                params: self.params(graph, conn)?,
                ..Default::default()
            };
            rst.insert(id.clone(), path);
        }
        let service = graph
            .object(conn, &nml("hasService"))
            .map(|s| self.service(graph, s))
            .transpose()?;
        let Some(path) = rst.get_mut(&id) else {
            return Err(ModelError::invalid_value(id, "routed path vanished"));
        };
        if path.params.exists_during.is_none() {
            path.params.exists_during = service.as_ref().and_then(|s| s.exists_during.clone());
        }
        let entry = path
            .hosts
            .entry(switch.to_string())
            .or_default()
            .entry(family)
            .or_default();
        if entry.has_service.is_none() {
            entry.has_service = service;
        }
        Ok(entry)
    }

    fn route(&self, graph: &Graph, node: &Term) -> ModelResult<Route> {
        let mut route = Route::default();
        for (predicate, target) in [
            ("nextHop", &mut route.next_hop),
            ("routeFrom", &mut route.route_from),
            ("routeTo", &mut route.route_to),
        ] {
            for value_node in graph.objects(node, &mrs(predicate)) {
                let key = node_id(value_node);
                let kind = joined(graph.objects(value_node, &mrs("type")))
                    .ok_or_else(|| ModelError::missing(key.as_str(), "mrs:type"))?;
                let value = graph
                    .object(value_node, &mrs("value"))
                    .ok_or_else(|| ModelError::missing(key.as_str(), "mrs:value"))?;
                target.insert(
                    kind.clone(),
                    RouteValue {
                        kind,
                        value: value.as_str().to_string(),
                        key: Some(key),
                    },
                );
            }
        }
        Ok(route)
    }

    fn singleports(
        &self,
        graph: &Graph,
        claimed: &BTreeSet<String>,
        out: &mut ActiveDeltas,
    ) -> ModelResult<()> {
        let tag = mrs("tag");
        let lifetime = nml("existsDuring");
        for subject in graph.subjects() {
            let Term::Iri(uri) = subject else {
                continue;
            };
            if claimed.contains(uri) || vlan_suffix(uri).is_none() {
                continue;
            }
            let Ok((switch, port)) = self.ctx.uris.int_out(uri) else {
                continue;
            };
            if !self.ctx.is_switch(&switch) {
                continue;
            }
            let requested = graph
                .objects(subject, &tag)
                .any(|t| !t.as_str().starts_with(MONITOR_TAG_PREFIX))
                || graph.object(subject, &lifetime).is_some();
            if !requested {
                continue;
            }
            let mut request = self.port_request(graph, subject)?;
            let params = std::mem::take(&mut request.params);
            let mut path = SwitchedPath {
                params,
                ..Default::default()
            };
            path.hosts.entry(switch).or_default().insert(port, request);
            out.singleport.insert(uri.clone(), path);
        }
        Ok(())
    }

    fn apply_defaults(&self, out: &mut ActiveDeltas, previous: Option<&ActiveDeltas>) {
        let now = self.ctx.now;
        let window = |conn: &str| {
            previous_default(previous, conn).unwrap_or_else(|| ExistsDuring::default_from(now))
        };
        for kind in SwitchedKind::ALL {
            for (conn, path) in out.switched_mut(kind).iter_mut() {
                if path.params.exists_during.is_none() {
                    path.params.exists_during = Some(window(conn));
                }
                if kind == SwitchedKind::Singleport {
                    continue;
                }
                for request in path.hosts.values_mut().flat_map(|ports| ports.values_mut()) {
                    if request.has_service.is_none() {
                        request.has_service =
                            Some(ServiceParams::best_effort(self.ctx.default_bandwidth));
                    }
                }
            }
        }
        for (conn, path) in out.rst.iter_mut() {
            if path.params.exists_during.is_none() {
                path.params.exists_during = Some(window(conn));
            }
            for entry in path.hosts.values_mut().flat_map(|f| f.values_mut()) {
                if entry.has_service.is_none() {
                    entry.has_service = Some(ServiceParams::best_effort(self.ctx.default_bandwidth));
                }
            }
        }
    }
}

/// The defaulted window a connection had in the previous document.
fn previous_default(previous: Option<&ActiveDeltas>, conn: &str) -> Option<ExistsDuring> {
    let previous = previous?;
    let params = SwitchedKind::ALL
        .iter()
        .find_map(|k| previous.switched(*k).get(conn).map(|p| &p.params))
        .or_else(|| previous.rst.get(conn).map(|p| &p.params))?;
    params
        .exists_during
        .clone()
        .filter(ExistsDuring::is_defaulted)
}

/// Graph node as the string stored in the document; blank nodes keep a
/// `_:` prefix so they can be written back.
pub(crate) fn node_id(term: &Term) -> String {
    match term {
        Term::Blank(id) => format!("_:{}", id),
        other => other.as_str().to_string(),
    }
}

fn joined<'a>(values: impl Iterator<Item = &'a Term>) -> Option<String> {
    let parts: Vec<&str> = values.map(Term::as_str).collect();
    (!parts.is_empty()).then(|| parts.join("|"))
}

fn parse_vlan(uri: &str, value: &str) -> ModelResult<VlanId> {
    let raw: u16 = value
        .trim()
        .parse()
        .map_err(|_| ModelError::invalid_value(uri, format!("vlan '{}' is not a number", value)))?;
    VlanId::new(raw).map_err(|e| ModelError::from_parse(uri, e))
}

/// Family of a network address node, from its URI (`...:ipv4-address+...`)
/// or its declared types.
fn address_family(graph: &Graph, node: &Term) -> Option<IpFamily> {
    let uri = node.as_str();
    let name = uri.rsplit(':').next().unwrap_or(uri);
    let name = name.split('+').next().unwrap_or(name);
    IpFamily::ALL
        .into_iter()
        .find(|f| name == f.address_key())
        .or_else(|| {
            IpFamily::ALL.into_iter().find(|f| {
                graph
                    .objects(node, &mrs("type"))
                    .any(|t| t.as_str().split('|').any(|k| k == f.address_key()))
            })
        })
}

fn is_reserved_table(uri: &str) -> bool {
    uri.ends_with(":rt-table+main") || uri.contains(":rt-table+vrf-")
}

/// Folds a second scan of the same (host, port) into the first.
fn merge_port(existing: &mut PortRequest, other: PortRequest) {
    let prefers_other = other.uri.as_deref().and_then(vlan_suffix).is_some()
        && existing.uri.as_deref().and_then(vlan_suffix).is_none();
    if prefers_other {
        existing.uri = other.uri;
    }
    if existing.has_label.is_none() {
        existing.has_label = other.has_label;
    }
    if existing.has_service.is_none() {
        existing.has_service = other.has_service;
    }
    if existing.is_alias.is_none() {
        existing.is_alias = other.is_alias;
    }
    if existing.params.is_empty() {
        existing.params = other.params;
    }
    for family in IpFamily::ALL {
        if existing.has_network_address.get(family).is_none() {
            if let Some(address) = other.has_network_address.get(family) {
                existing.has_network_address.set(family, address.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turtle;
    use pretty_assertions::assert_eq;

    const SITE: &str = "urn:ogf:network:example.org:2024";
    const NOW: i64 = 1_700_000_000;

    fn ctx() -> ParserContext {
        ParserContext::new(SITE, 10_000, NOW)
            .with_switch("sw1", Some("sw1"), true)
            .with_kube_host("kube01", ["eth1"])
    }

    fn prefixes() -> String {
        format!(
            "@prefix nml: <http://schemas.ogf.org/nml/2013/03/base#> .\n\
             @prefix mrs: <http://schemas.ogf.org/mrs/2013/12/topology#> .\n\
             @prefix site: <{}:> .\n",
            SITE
        )
    }

    fn vsw_delta(conn: &str, host: &str, port: &str, vlan: u16, lifetime: bool) -> String {
        let life = if lifetime {
            format!(
                "<{s}:sw1:service+vsw:sw1:{c}> nml:existsDuring <{s}:sw1:service+vsw:sw1:{c}:lifetime> .\n\
                 <{s}:sw1:service+vsw:sw1:{c}:lifetime> nml:start \"{start}\" ; nml:end \"{end}\" .\n",
                s = SITE,
                c = conn,
                start = NOW,
                end = NOW + 3600
            )
        } else {
            String::new()
        };
        format!(
            "<{s}:sw1:service+vsw:sw1> mrs:providesSubnet <{s}:sw1:service+vsw:sw1:{c}> .\n\
             <{s}:sw1:service+vsw:sw1:{c}> a mrs:SwitchingSubnet ;\n\
                 mrs:tag \"my-tag\", \"monitor:status:active\" ;\n\
                 nml:hasBidirectionalPort <{s}:{h}:{p}:vlanport+{v}>, <{s}:sw1:Ethernet0:vlanport+{v}> .\n\
             <{s}:{h}:{p}:vlanport+{v}> nml:hasLabel <{s}:{h}:{p}:vlanport+{v}:label+{v}> ;\n\
                 nml:hasService <{s}:{h}:{p}:vlanport+{v}:service+bw> ;\n\
                 mrs:hasNetworkAddress <{s}:{h}:{p}:vlanport+{v}:ipv4-address+10.1.1.2_24> .\n\
             <{s}:{h}:{p}:vlanport+{v}:label+{v}> nml:value \"{v}\" .\n\
             <{s}:{h}:{p}:vlanport+{v}:service+bw> mrs:type \"guaranteedCapped\" ; mrs:unit \"mbps\" ;\n\
                 mrs:reservableCapacity \"2000\" .\n\
             <{s}:{h}:{p}:vlanport+{v}:ipv4-address+10.1.1.2_24> mrs:type \"ipv4-address\" ; mrs:value \"10.1.1.2/24\" .\n\
             {life}",
            s = SITE,
            c = conn,
            h = host,
            p = port,
            v = vlan,
            life = life
        )
    }

    fn parse(body: &str) -> ModelResult<ActiveDeltas> {
        let graph = turtle::parse(&format!("{}{}", prefixes(), body)).unwrap();
        ModelParser::new(ctx()).parse(&graph, None)
    }

    #[test]
    fn test_vsw_connection() {
        let doc = parse(&vsw_delta("conn+1", "dtn01", "eth0", 3001, true)).unwrap();
        let conn = format!("{}:sw1:service+vsw:sw1:conn+1", SITE);
        let path = &doc.vsw[&conn];
        assert_eq!(path.params.tag.as_deref(), Some("my-tag"));
        let window = path.params.exists_during.as_ref().unwrap();
        assert_eq!((window.start, window.end), (NOW, NOW + 3600));
        assert!(!window.is_defaulted());

        let host_port = &path.hosts["dtn01"]["eth0"];
        assert_eq!(host_port.vlan(), Some(VlanId::new(3001).unwrap()));
        assert_eq!(
            host_port.has_network_address.ipv4.as_ref().unwrap().value,
            "10.1.1.2/24"
        );
        let service = host_port.has_service.as_ref().unwrap();
        assert_eq!(service.class(), "guaranteedCapped");
        assert_eq!(service.reservable_capacity, Some(2000));

        // Switch port falls back to the vlanport suffix and the default service.
        let switch_port = &path.hosts["sw1"]["Ethernet0"];
        assert_eq!(switch_port.vlan(), Some(VlanId::new(3001).unwrap()));
        assert_eq!(switch_port.has_service.as_ref().unwrap().class(), "bestEffort");

        assert!(doc.used_vlans["dtn01"].contains(&VlanId::new(3001).unwrap()));
        assert!(doc.subnet_mapping["sw1"].provides_subnet.contains(&conn));
    }

    #[test]
    fn test_default_window_is_stable() {
        let body = vsw_delta("conn+1", "dtn01", "eth0", 3001, false);
        let first = parse(&body).unwrap();
        let conn = format!("{}:sw1:service+vsw:sw1:conn+1", SITE);
        let window = first.vsw[&conn].params.exists_during.clone().unwrap();
        assert!(window.is_defaulted());
        assert_eq!(window.start, NOW + 10);

        let graph = turtle::parse(&format!("{}{}", prefixes(), body)).unwrap();
        let mut later = ctx();
        later.now = NOW + 500;
        let second = ModelParser::new(later).parse(&graph, Some(&first)).unwrap();
        assert_eq!(second.vsw[&conn].params.exists_during, Some(window));
    }

    #[test]
    fn test_kube_reclassification() {
        let doc = parse(&vsw_delta("conn+2", "kube01", "eth1", 3002, true)).unwrap();
        assert!(doc.vsw.is_empty());
        assert_eq!(doc.kube.len(), 1);
    }

    #[test]
    fn test_reserved_vlan_rejected() {
        let err = parse(&vsw_delta("conn+3", "dtn01", "eth0", 4095, true)).unwrap_err();
        assert!(matches!(err, ModelError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn test_missing_lifetime_end() {
        let body = format!(
            "<{s}:sw1:service+vsw:sw1> mrs:providesSubnet <{s}:c> .\n\
             <{s}:c> nml:existsDuring <{s}:c:lifetime> .\n\
             <{s}:c:lifetime> nml:start \"{now}\" .\n",
            s = SITE,
            now = NOW
        );
        match parse(&body).unwrap_err() {
            ModelError::MissingNode { uri, predicate } => {
                assert_eq!(uri, format!("{}:c:lifetime", SITE));
                assert_eq!(predicate, "nml:end");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_routed_connection_and_tables() {
        let body = format!(
            "<{s}:sw1:service+rst-ipv6> mrs:providesRoute <{s}:rt1> ;\n\
                 mrs:providesRoutingTable <{s}:sw1:service+rst-ipv6:rt-table+main>, <{s}:table1> .\n\
             <{s}:rt1> mrs:nextHop <{s}:rt1:nh> ; mrs:routeFrom <{s}:rt1:from> ;\n\
                 nml:hasService <{s}:rt1:bw> .\n\
             <{s}:rt1:bw> mrs:type \"softCapped\" ; mrs:reservableCapacity \"500\" ;\n\
                 nml:existsDuring <{s}:rt1:bw:life> .\n\
             <{s}:rt1:bw:life> nml:start \"{now}\" ; nml:end \"{end}\" .\n\
             <{s}:rt1:nh> mrs:type \"ipv6-address\" ; mrs:value \"2001:db8::1\" .\n\
             <{s}:rt1:from> mrs:type \"ipv6-prefix-list\" ; mrs:value \"2001:db8:1::/64\" .\n\
             <{s}:table1> mrs:hasRoute <{s}:rt1> .\n\
             <{s}:sw1:service+rst-ipv6:rt-table+main> mrs:hasRoute <{s}:ignored> .\n",
            s = SITE,
            now = NOW,
            end = NOW + 60
        );
        let doc = parse(&body).unwrap();
        assert_eq!(doc.rst.len(), 2);
        let rt1 = &doc.rst[&format!("{}:rt1", SITE)];
        let entry = &rt1.hosts["sw1"][&IpFamily::Ipv6];
        assert_eq!(entry.next_hops(IpFamily::Ipv6).collect::<Vec<_>>(), ["2001:db8::1"]);
        assert_eq!(entry.route_from(IpFamily::Ipv6), Some("2001:db8:1::/64"));
        assert_eq!(entry.belongs_to_routing_table.as_deref(), Some(format!("{}:table1", SITE).as_str()));
        assert_eq!(rt1.params.exists_during.as_ref().unwrap().end, NOW + 60);
        assert!(doc.used_ips["sw1"].contains("2001:db8::1"));
        let table = &doc.rst[&format!("{}:table1", SITE)];
        assert!(table.hosts["sw1"][&IpFamily::Ipv6].provides_routing_table.is_some());
        assert_eq!(
            table.hosts["sw1"][&IpFamily::Ipv6].has_service.as_ref().unwrap().class(),
            "bestEffort"
        );
    }

    #[test]
    fn test_singleport() {
        let body = format!(
            "<{s}:sw1:Ethernet4:vlanport+3100> mrs:tag \"standalone\" .\n\
             <{s}:sw1:Ethernet8:vlanport+3101> mrs:tag \"monitor:status:active\" .\n\
             <{s}:dtn01:eth0:vlanport+3102> mrs:tag \"not a switch\" .\n",
            s = SITE
        );
        let doc = parse(&body).unwrap();
        assert_eq!(doc.singleport.len(), 1);
        let id = format!("{}:sw1:Ethernet4:vlanport+3100", SITE);
        let path = &doc.singleport[&id];
        assert_eq!(path.params.tag.as_deref(), Some("standalone"));
        let request = &path.hosts["sw1"]["Ethernet4"];
        assert!(request.params.is_empty());
        assert_eq!(request.vlan(), Some(VlanId::new(3100).unwrap()));
        assert!(request.has_service.is_none());
    }

    #[test]
    fn test_claimed_ports_are_not_singleports() {
        let body = vsw_delta("conn+1", "dtn01", "eth0", 3001, true);
        let doc = parse(&format!(
            "{}<{}:sw1:Ethernet0:vlanport+3001> mrs:tag \"on a vsw port\" .\n",
            body, SITE
        ))
        .unwrap();
        assert!(doc.singleport.is_empty());
        assert_eq!(doc.vsw.len(), 1);
    }
}
