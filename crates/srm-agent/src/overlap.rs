//! Which routed requests land on this host.
//!
//! A routed (rst) request names a source prefix per family. The host serves
//! it when one of its interface addresses, or one of the private namespace
//! ranges from `qos.interfaces`, overlaps that prefix. The match yields the
//! local source address, the interface it lives on and the parent interface
//! whose bandwidth the request consumes.

use srm_common::AgentConfig;
use srm_types::{
    convert_to_rate, ActiveDeltas, IpAddress, IpFamily, IpPrefix, ServiceParams,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::facts::HostLinks;

/// An interface holding an address, and the parent it shares bandwidth with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRef {
    pub intf: String,
    pub master: String,
}

/// One routed request as served from this host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlapService {
    /// Id of the routed path.
    pub uuid: String,
    /// Local address per family (host bits only).
    pub src: BTreeMap<IpFamily, IpAddress>,
    pub src_intf: BTreeMap<IpFamily, String>,
    /// Remote prefix per family.
    pub dst: BTreeMap<IpFamily, IpPrefix>,
    pub master_intf: String,
    /// Bandwidth request; summed when several routes share the service.
    pub rules: ServiceParams,
}

impl OverlapService {
    /// Requested rate in mbit.
    pub fn rate(&self) -> u64 {
        rate_mbit(&self.rules)
    }
}

/// Interface → service uri → request.
pub type OverlapServices = BTreeMap<String, BTreeMap<String, OverlapService>>;

/// Result of one overlap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overlaps {
    pub services: OverlapServices,
    /// Requested mbit per parent interface.
    pub total_requests: BTreeMap<String, u64>,
}

impl Overlaps {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Every served request, regardless of interface.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String, &OverlapService)> + '_ {
        self.services
            .iter()
            .flat_map(|(intf, by_uri)| by_uri.iter().map(move |(uri, svc)| (intf, uri, svc)))
    }
}

pub(crate) fn rate_mbit(service: &ServiceParams) -> u64 {
    match convert_to_rate(service) {
        Ok(rate) => rate.as_mbit(),
        Err(e) => {
            warn!(error = %e, "Ignoring service with unusable rate");
            0
        }
    }
}

fn merge_service(into: &mut ServiceParams, other: &ServiceParams) {
    fn add(a: &mut Option<u64>, b: Option<u64>) {
        if a.is_some() || b.is_some() {
            *a = Some(a.unwrap_or(0) + b.unwrap_or(0));
        }
    }
    add(&mut into.available_capacity, other.available_capacity);
    add(&mut into.granularity, other.granularity);
    add(&mut into.maximum_capacity, other.maximum_capacity);
    add(&mut into.priority, other.priority);
    add(&mut into.reservable_capacity, other.reservable_capacity);
}

/// Addresses and ranges present on the host, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct OverlapLib {
    known: BTreeMap<IpFamily, Vec<(IpPrefix, Vec<InterfaceRef>)>>,
}

impl OverlapLib {
    /// Interface addresses first, then the configured namespace ranges.
    pub fn new(config: &AgentConfig, links: &HostLinks) -> Self {
        let mut lib = Self::default();
        for link in links.values() {
            let master = link.parent.clone().unwrap_or_else(|| link.name.clone());
            for prefix in &link.addresses {
                if let IpAddress::V6(addr) = prefix.address() {
                    if addr.is_link_local() {
                        continue;
                    }
                }
                lib.insert(
                    *prefix,
                    InterfaceRef {
                        intf: link.name.clone(),
                        master: master.clone(),
                    },
                );
            }
        }
        for (intf, ns) in &config.qos.interfaces {
            for family in IpFamily::ALL {
                for range in ns.ranges(family) {
                    match IpPrefix::parse_lenient(range) {
                        Ok(prefix) => lib.insert(
                            prefix,
                            InterfaceRef {
                                intf: intf.clone(),
                                master: ns.master_intf.clone(),
                            },
                        ),
                        Err(e) => warn!(interface = %intf, range = %range, error = %e, "Bad qos range"),
                    }
                }
            }
        }
        lib
    }

    fn insert(&mut self, prefix: IpPrefix, intf: InterfaceRef) {
        let entries = self.known.entry(prefix.family()).or_default();
        match entries.iter_mut().find(|(p, _)| *p == prefix) {
            Some((_, refs)) => refs.push(intf),
            None => entries.push((prefix, vec![intf])),
        }
    }

    /// First known prefix overlapping `range`, with its interfaces.
    pub fn find_overlap(&self, range: &IpPrefix) -> Option<(&IpPrefix, &[InterfaceRef])> {
        self.known
            .get(&range.family())?
            .iter()
            .find(|(known, _)| known.overlaps(range))
            .map(|(p, refs)| (p, refs.as_slice()))
    }

    /// Routed requests of `deltas` served from this host.
    pub fn overlaps(&self, deltas: &ActiveDeltas) -> Overlaps {
        let mut out = Overlaps::default();
        for (uuid, path) in &deltas.rst {
            for families in path.hosts.values() {
                for (family, entry) in families {
                    let Some(service) = entry.has_service.as_ref() else {
                        continue;
                    };
                    let uri = service.uri.clone().unwrap_or_else(|| uuid.clone());
                    for route in entry.has_route.values() {
                        let Some(from) = route
                            .route_from(*family)
                            .and_then(|v| IpPrefix::parse_lenient(v).ok())
                        else {
                            continue;
                        };
                        let Some((local, refs)) = self.find_overlap(&from) else {
                            debug!(uuid = %uuid, range = %from, "No local overlap");
                            continue;
                        };
                        let dst = route
                            .route_to(*family)
                            .and_then(|v| IpPrefix::parse_lenient(v).ok());
                        for intf in refs {
                            let svc = out
                                .services
                                .entry(intf.intf.clone())
                                .or_default()
                                .entry(uri.clone())
                                .or_insert_with(|| OverlapService {
                                    uuid: uuid.clone(),
                                    ..Default::default()
                                });
                            let fresh = svc.src.is_empty() && svc.dst.is_empty();
                            svc.src.insert(*family, *local.address());
                            svc.src_intf.insert(*family, intf.intf.clone());
                            svc.master_intf = intf.master.clone();
                            if let Some(dst) = dst {
                                svc.dst.insert(*family, dst);
                            }
                            if fresh {
                                svc.rules = service.clone();
                            } else {
                                merge_service(&mut svc.rules, service);
                            }
                            *out.total_requests.entry(intf.master.clone()).or_default() +=
                                rate_mbit(service);
                        }
                    }
                }
            }
        }
        out
    }
}
