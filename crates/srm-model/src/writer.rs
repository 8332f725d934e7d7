//! [`ActiveDeltas`] and site topology → graph.
//!
//! The writer is the inverse of [`ModelParser`](crate::ModelParser): for a
//! document the parser produced, parsing the written graph with the same
//! context yields the document again. Values the parser filled in
//! (defaulted lifetimes, best-effort services) carry no URI and are not
//! written.

use crate::graph::Graph;
use crate::parser::{ParserContext, SwitchServices, MONITOR_TAG_PREFIX};
use crate::prefixes::{mrs, nml, rdf_type, VLAN_LABEL_TYPE};
use crate::term::{Term, XSD_INTEGER};
use crate::uri::{vlan_suffix, SiteUris};
use srm_types::{
    ActiveDeltas, ExistsDuring, IpFamily, Params, PortRequest, Route, RoutedPath, ServiceParams,
    SwitchedPath, VlanId, VlanRange,
};

/// A physical port published in the topology.
#[derive(Debug, Clone, Default)]
pub struct PortDescription {
    pub name: String,
    pub vlan_range: Option<VlanRange>,
    /// Capacity in mbps.
    pub capacity: Option<u64>,
    pub addresses: Vec<(IpFamily, String)>,
    /// Remote endpoint the port is cabled to.
    pub is_alias: Option<String>,
}

/// Builds a site graph.
#[derive(Debug, Clone)]
pub struct ModelWriter {
    ctx: ParserContext,
    graph: Graph,
}

impl ModelWriter {
    pub fn new(ctx: ParserContext) -> Self {
        Self::with_graph(ctx, Graph::new())
    }

    /// Writes on top of an existing graph.
    pub fn with_graph(ctx: ParserContext, graph: Graph) -> Self {
        Self { ctx, graph }
    }

    pub fn uris(&self) -> &SiteUris {
        &self.ctx.uris
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    fn add(&mut self, subject: &str, predicate: Term, object: Term) {
        self.graph.insert(node_term(subject), predicate, object);
    }

    fn add_type(&mut self, subject: &str, class: Term) {
        self.add(subject, rdf_type(), class);
    }

    fn add_literal(&mut self, subject: &str, predicate: Term, value: &str) {
        self.add(subject, predicate, Term::literal(value));
    }

    /// The site topology node.
    pub fn add_site(&mut self) -> String {
        let site = self.ctx.uris.site().to_string();
        self.add_type(&site, nml("Topology"));
        site
    }

    /// A switch or host node below the site.
    pub fn add_node(&mut self, name: &str) -> String {
        let site = self.ctx.uris.site().to_string();
        let node = self.ctx.uris.node(name);
        self.add(&site, nml("hasNode"), Term::iri(node.as_str()));
        self.add_type(&node, nml("Node"));
        self.add_literal(&node, nml("name"), name);
        node
    }

    /// The vsw service of a configured switch.
    pub fn add_switching_service(&mut self, switch: &str) -> Option<String> {
        let service = self.switch(switch)?.vsw.clone()?;
        let node = self.ctx.uris.node(switch);
        self.add(&node, nml("hasService"), Term::iri(service.as_str()));
        self.add_type(&service, nml("SwitchingService"));
        self.add(&service, nml("encoding"), Term::iri(VLAN_LABEL_TYPE));
        self.add_literal(&service, nml("labelSwapping"), "false");
        Some(service)
    }

    /// The routing service of a configured switch, with its per-family
    /// services and their main tables.
    pub fn add_routing_service(&mut self, switch: &str) -> Option<String> {
        let service = self.switch(switch)?.rst.clone()?;
        let node = self.ctx.uris.node(switch);
        self.add(&node, nml("hasService"), Term::iri(service.as_str()));
        self.add_type(&service, mrs("RoutingService"));
        for family in IpFamily::ALL {
            let per_family = self.ctx.uris.rst_family(switch, family);
            let table = self.ctx.uris.routing_table(&per_family, "main");
            self.add(&node, nml("hasService"), Term::iri(per_family.as_str()));
            self.add_type(&per_family, mrs("RoutingService"));
            self.add(&per_family, mrs("providesRoutingTable"), Term::iri(table.as_str()));
            self.add_type(&table, mrs("RoutingTable"));
            self.add_literal(&table, mrs("type"), "main");
        }
        Some(service)
    }

    /// A physical port of a node, with its vlan range, bandwidth and addresses.
    pub fn add_port(&mut self, node: &str, port: &PortDescription) -> String {
        let node_uri = self.ctx.uris.node(node);
        let uri = self.ctx.uris.port(node, &port.name);
        self.add(&node_uri, nml("hasBidirectionalPort"), Term::iri(uri.as_str()));
        self.add_type(&uri, nml("BidirectionalPort"));
        self.add_literal(&uri, nml("name"), &port.name);
        if let Some(alias) = &port.is_alias {
            self.add(&uri, nml("isAlias"), Term::iri(alias.as_str()));
        }
        if let Some(range) = port.vlan_range.as_ref().filter(|r| !r.is_empty()) {
            let group = self.ctx.uris.vlan_range(&uri);
            self.add(&uri, nml("hasLabelGroup"), Term::iri(group.as_str()));
            self.add_type(&group, nml("LabelGroup"));
            self.add(&group, nml("labeltype"), Term::iri(VLAN_LABEL_TYPE));
            self.add_literal(&group, nml("values"), &range.to_string());
        }
        if let Some(capacity) = port.capacity {
            let service = self.ctx.uris.bandwidth_service(&uri);
            self.add(&uri, nml("hasService"), Term::iri(service.as_str()));
            self.add_type(&service, mrs("BandwidthService"));
            self.add_literal(&service, mrs("type"), "guaranteedCapped");
            self.add_literal(&service, mrs("unit"), "mbps");
            for predicate in ["maximumCapacity", "availableCapacity", "reservableCapacity"] {
                self.add(&service, mrs(predicate), integer(capacity));
            }
            self.add(&service, mrs("granularity"), integer(1));
        }
        for (family, value) in &port.addresses {
            self.add_address(&uri, *family, &family.address_key(), value);
        }
        uri
    }

    /// A vlan sub-port seen on a device but not requested by any delta.
    pub fn add_vlan_port(&mut self, port_uri: &str, vlan: VlanId) -> String {
        let uri = self.ctx.uris.vlan_port(port_uri, vlan);
        self.add(port_uri, nml("hasBidirectionalPort"), Term::iri(uri.as_str()));
        self.add_type(&uri, nml("BidirectionalPort"));
        self.add_label(&uri, vlan);
        uri
    }

    /// Every connection of the document.
    pub fn add_active_deltas(&mut self, doc: &ActiveDeltas) {
        for (conn, path) in doc.vsw.iter().chain(doc.kube.iter()) {
            self.add_switched(conn, path);
        }
        for (conn, path) in &doc.singleport {
            self.add_singleport(conn, path);
        }
        for (conn, path) in &doc.rst {
            self.add_routed(conn, path);
        }
    }

    fn switch(&self, name: &str) -> Option<&SwitchServices> {
        self.ctx.switches.iter().find(|s| s.name == name)
    }

    fn add_switched(&mut self, conn: &str, path: &SwitchedPath) {
        let mut services: Vec<String> = self
            .ctx
            .switches
            .iter()
            .filter(|s| path.hosts.contains_key(&s.name))
            .filter_map(|s| s.vsw.clone())
            .collect();
        if services.is_empty() {
            services.extend(self.ctx.switches.iter().find_map(|s| s.vsw.clone()));
        }
        for service in services {
            self.add(&service, mrs("providesSubnet"), node_term(conn));
        }
        self.add_type(conn, mrs("SwitchingSubnet"));
        self.add_params(conn, &path.params, true);
        for (host, ports) in &path.hosts {
            for (port, request) in ports {
                let uri = self.request_uri(host, port, request);
                self.add(conn, nml("hasBidirectionalPort"), Term::iri(uri.as_str()));
                self.add_request(&uri, request);
            }
        }
    }

    fn add_singleport(&mut self, conn: &str, path: &SwitchedPath) {
        self.add_params(conn, &path.params, true);
        for (host, ports) in &path.hosts {
            for (port, request) in ports {
                let uri = self.request_uri(host, port, request);
                self.add_request(&uri, request);
            }
        }
    }

    fn request_uri(&self, host: &str, port: &str, request: &PortRequest) -> String {
        request.uri.clone().unwrap_or_else(|| {
            let port_uri = self.ctx.uris.port(host, port);
            match request.vlan() {
                Some(vlan) => self.ctx.uris.vlan_port(&port_uri, vlan),
                None => port_uri,
            }
        })
    }

    fn add_request(&mut self, uri: &str, request: &PortRequest) {
        self.add_type(uri, nml("BidirectionalPort"));
        if vlan_suffix(uri).is_some() {
            if let Some((parent, _)) = uri.rsplit_once(':') {
                let parent = parent.to_string();
                self.add(&parent, nml("hasBidirectionalPort"), Term::iri(uri));
            }
        }
        self.add_params(uri, &request.params, false);
        if let Some(label) = &request.has_label {
            self.add_label(uri, label.value);
        }
        if let Some(service) = &request.has_service {
            self.add_service(uri, service);
        }
        for family in IpFamily::ALL {
            if let Some(address) = request.has_network_address.get(family) {
                self.add_address(uri, family, &address.kind, &address.value);
            }
        }
        if let Some(alias) = &request.is_alias {
            self.add(uri, nml("isAlias"), node_term(alias));
        }
    }

    fn add_label(&mut self, port_uri: &str, vlan: VlanId) {
        let label = self.ctx.uris.label(port_uri, vlan);
        self.add(port_uri, nml("hasLabel"), Term::iri(label.as_str()));
        self.add_type(&label, nml("Label"));
        self.add(&label, nml("labeltype"), Term::iri(VLAN_LABEL_TYPE));
        self.add_literal(&label, nml("value"), &vlan.to_string());
    }

    fn add_address(&mut self, port_uri: &str, family: IpFamily, kind: &str, value: &str) {
        let address = self.ctx.uris.address(port_uri, family, value);
        self.add(port_uri, mrs("hasNetworkAddress"), Term::iri(address.as_str()));
        self.add_type(&address, mrs("NetworkAddress"));
        for part in kind.split('|') {
            self.add_literal(&address, mrs("type"), part);
        }
        self.add_literal(&address, mrs("value"), value);
    }

    fn add_service(&mut self, subject: &str, service: &ServiceParams) {
        let Some(uri) = &service.uri else {
            return;
        };
        self.add(subject, nml("hasService"), node_term(uri));
        self.add_type(uri, mrs("BandwidthService"));
        for (predicate, value) in [
            ("availableCapacity", service.available_capacity),
            ("granularity", service.granularity),
            ("maximumCapacity", service.maximum_capacity),
            ("priority", service.priority),
            ("reservableCapacity", service.reservable_capacity),
        ] {
            if let Some(value) = value {
                self.add(uri, mrs(predicate), integer(value));
            }
        }
        if let Some(kind) = &service.service_type {
            self.add_literal(uri, mrs("type"), kind);
        }
        if let Some(unit) = &service.unit {
            self.add_literal(uri, mrs("unit"), unit);
        }
        if let Some(window) = &service.exists_during {
            self.add_lifetime(uri, window, None);
        }
    }

    /// Tags, encodings and lifetime. Connections also get the monitor tag.
    fn add_params(&mut self, subject: &str, params: &Params, monitored: bool) {
        for (predicate, value, iri) in [
            (mrs("tag"), &params.tag, false),
            (nml("belongsTo"), &params.belongs_to, true),
            (nml("encoding"), &params.encoding, true),
            (nml("labelSwapping"), &params.label_swapping, false),
        ] {
            for part in value.iter().flat_map(|v| v.split('|')) {
                let object = if iri { node_term(part) } else { Term::literal(part) };
                self.add(subject, predicate.clone(), object);
            }
        }
        let status = monitored.then(|| monitor_status(&params.window(), self.ctx.now));
        if let Some(status) = &status {
            self.add_literal(subject, mrs("tag"), status);
        }
        if let Some(window) = &params.exists_during {
            self.add_lifetime(subject, window, status.as_deref());
        }
    }

    fn add_lifetime(&mut self, subject: &str, window: &ExistsDuring, status: Option<&str>) {
        let Some(uri) = &window.uri else {
            return;
        };
        self.add(subject, nml("existsDuring"), node_term(uri));
        self.add_type(uri, nml("Lifetime"));
        self.add(uri, nml("start"), Term::integer(window.start));
        self.add(uri, nml("end"), Term::integer(window.end));
        if let Some(status) = status {
            self.add_literal(uri, mrs("tag"), status);
        }
    }

    fn add_routed(&mut self, conn: &str, path: &RoutedPath) {
        for (switch, families) in &path.hosts {
            for (family, entry) in families {
                let service = self.ctx.uris.rst_family(switch, *family);
                if entry.provides_routing_table.is_some() {
                    self.add(&service, mrs("providesRoutingTable"), node_term(conn));
                    self.add_type(conn, mrs("RoutingTable"));
                    for (route_id, route) in &entry.has_route {
                        self.add(conn, mrs("hasRoute"), node_term(route_id));
                        self.add_route(route_id, route);
                    }
                } else {
                    self.add(&service, mrs("providesRoute"), node_term(conn));
                    for (route_id, route) in &entry.has_route {
                        self.add_route(route_id, route);
                    }
                }
                if let Some(service) = &entry.has_service {
                    self.add_service(conn, service);
                }
            }
        }
        self.add_params(conn, &path.params, true);
    }

    fn add_route(&mut self, route_id: &str, route: &Route) {
        self.add_type(route_id, mrs("Route"));
        for (predicate, values) in [
            ("nextHop", &route.next_hop),
            ("routeFrom", &route.route_from),
            ("routeTo", &route.route_to),
        ] {
            for (kind, value) in values {
                let key = value
                    .key
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}+{}", route_id, predicate, kind.replace('|', "_")));
                self.add(route_id, mrs(predicate), node_term(&key));
                self.add_type(&key, mrs("NetworkAddress"));
                for part in value.kind.split('|') {
                    self.add_literal(&key, mrs("type"), part);
                }
                self.add_literal(&key, mrs("value"), &value.value);
            }
        }
    }
}

/// `monitor:status:*` tag of a window at `now`.
pub fn monitor_status(window: &ExistsDuring, now: i64) -> String {
    let status = if window.is_ended(now) {
        "deactivating"
    } else if window.is_started(now) {
        "active"
    } else {
        "scheduled"
    };
    format!("{}{}", MONITOR_TAG_PREFIX, status)
}

fn node_term(id: &str) -> Term {
    match id.strip_prefix("_:") {
        Some(label) => Term::blank(label),
        None => Term::iri(id),
    }
}

fn integer(value: u64) -> Term {
    Term::typed(value.to_string(), XSD_INTEGER)
}
