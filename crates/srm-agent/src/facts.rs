//! Host facts: links and addresses, certificate validity, neighbours and
//! memory figures, assembled into the document the frontend stores per host.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use srm_common::shell::{self, IP_CMD};
use srm_common::AgentConfig;
use srm_types::{ArpEntry, CertInfo, HostFacts, InterfaceInfo, IpFamily, IpPrefix, NetInfo, Summary};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::objects::{oid2abbrev, oid_registry};
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

use crate::error::{AgentError, AgentResult};

/// Where the kernel exposes per-link attributes.
pub const SYSFS_NET: &str = "/sys/class/net";

pub const PROC_MEMINFO: &str = "/proc/meminfo";

/// One link as seen by `ip -j addr show`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostLink {
    pub name: String,
    /// Lower device of a vlan (`vlan.3001@eth0`).
    pub parent: Option<String>,
    pub mtu: Option<u32>,
    pub txqueuelen: Option<u32>,
    pub operstate: Option<String>,
    pub mac: Option<String>,
    /// Addresses with their prefix length, as configured.
    pub addresses: Vec<IpPrefix>,
}

impl HostLink {
    pub fn is_up(&self) -> bool {
        matches!(self.operstate.as_deref(), Some("UP") | Some("UNKNOWN"))
    }

    pub fn addresses(&self, family: IpFamily) -> impl Iterator<Item = &IpPrefix> + '_ {
        self.addresses.iter().filter(move |a| a.family() == family)
    }

    /// The address is configured on this link (prefix length ignored).
    pub fn has_address(&self, address: &IpPrefix) -> bool {
        self.addresses.iter().any(|a| a.address() == address.address())
    }
}

/// Links of the host by name.
pub type HostLinks = BTreeMap<String, HostLink>;

#[derive(Debug, Deserialize)]
struct IpAddrJson {
    ifname: String,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default)]
    txqlen: Option<u32>,
    #[serde(default)]
    operstate: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addr_info: Vec<AddrInfoJson>,
}

#[derive(Debug, Deserialize)]
struct AddrInfoJson {
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

/// Parses the output of `ip -j addr show`.
pub fn parse_ip_addr(output: &str) -> AgentResult<HostLinks> {
    let entries: Vec<IpAddrJson> =
        serde_json::from_str(output).map_err(|e| AgentError::parse("ip -j addr show", e))?;
    let mut links = HostLinks::new();
    for entry in entries {
        let mut addresses = Vec::new();
        for info in entry.addr_info {
            let (Some(local), Some(len)) = (info.local, info.prefixlen) else {
                continue;
            };
            match IpPrefix::parse_lenient(&format!("{}/{}", local, len)) {
                Ok(prefix) => addresses.push(prefix),
                Err(e) => debug!(link = %entry.ifname, error = %e, "Skipping address"),
            }
        }
        links.insert(
            entry.ifname.clone(),
            HostLink {
                name: entry.ifname,
                parent: entry.link,
                mtu: entry.mtu,
                txqueuelen: entry.txqlen,
                operstate: entry.operstate,
                mac: entry.address,
                addresses,
            },
        );
    }
    Ok(links)
}

/// Reads the host links.
pub async fn read_links() -> AgentResult<HostLinks> {
    let output = shell::exec_or_throw(&format!("{} -j addr show", IP_CMD)).await?;
    parse_ip_addr(&output)
}

#[derive(Debug, Deserialize)]
struct NeighJson {
    dst: String,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    lladdr: Option<String>,
}

/// Parses the output of `ip -j neigh show`.
pub fn parse_neighbours(output: &str) -> AgentResult<Vec<ArpEntry>> {
    let entries: Vec<NeighJson> =
        serde_json::from_str(output).map_err(|e| AgentError::parse("ip -j neigh show", e))?;
    Ok(entries
        .into_iter()
        .map(|n| ArpEntry {
            ip: n.dst,
            mac: n.lladdr,
            dev: n.dev,
        })
        .collect())
}

pub async fn read_neighbours() -> AgentResult<Vec<ArpEntry>> {
    let output = shell::exec_or_throw(&format!("{} -j neigh show", IP_CMD)).await?;
    parse_neighbours(&output)
}

/// Link attributes read from sysfs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkAttributes {
    pub mtu: Option<u32>,
    pub txqueuelen: Option<u32>,
    /// Mbit/s; absent for links that do not report a speed.
    pub speed: Option<u64>,
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Reads `mtu`, `tx_queue_len` and `speed` of a link under `root`.
pub fn link_attributes(root: &Path, link: &str) -> LinkAttributes {
    let dir = root.join(link);
    LinkAttributes {
        mtu: read_number(&dir.join("mtu")),
        txqueuelen: read_number(&dir.join("tx_queue_len")),
        // Links without carrier report -1.
        speed: read_number::<i64>(&dir.join("speed")).and_then(|s| u64::try_from(s).ok()),
    }
}

fn dn(name: &X509Name<'_>) -> String {
    let mut out = String::new();
    for rdn in name.iter() {
        for attr in rdn.iter() {
            let key = oid2abbrev(attr.attr_type(), oid_registry())
                .map(str::to_string)
                .unwrap_or_else(|_| attr.attr_type().to_id_string());
            out.push('/');
            out.push_str(&key);
            out.push('=');
            out.push_str(attr.as_str().unwrap_or_default());
        }
    }
    out
}

/// Validity window, subject and issuer of a PEM certificate.
pub fn cert_info(pem: &str) -> AgentResult<CertInfo> {
    let block = Pem::iter_from_buffer(pem.as_bytes())
        .next()
        .ok_or_else(|| AgentError::parse("certificate", "no PEM block"))?
        .map_err(|e| AgentError::parse("certificate", e))?;
    let (_, cert) =
        X509Certificate::from_der(&block.contents).map_err(|e| AgentError::parse("certificate", e))?;
    let validity = cert.validity();
    Ok(CertInfo {
        not_before: validity.not_before.timestamp(),
        not_after: validity.not_after.timestamp(),
        subject: dn(cert.subject()),
        issuer: dn(cert.issuer()),
    })
}

/// Parses `/proc/meminfo` into kB figures.
pub fn parse_meminfo(text: &str) -> BTreeMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim().to_string(), value))
        })
        .collect()
}

/// Interface facts of a managed interface: configured pools and bandwidth,
/// observed addresses and link attributes.
fn interface_info(
    config: &AgentConfig,
    name: &str,
    link: Option<&HostLink>,
    attributes: &LinkAttributes,
) -> InterfaceInfo {
    let settings = config.interface(name);
    let mut bw_params = settings.bw_params.clone();
    if let Some(capacity) = settings.maximum_capacity.or(attributes.speed) {
        bw_params.max_reservable_capacity = capacity.saturating_sub(settings.reserved_capacity);
    }
    let addresses = |family: IpFamily| -> Vec<String> {
        link.map(|l| l.addresses(family).map(ToString::to_string).collect())
            .unwrap_or_default()
    };
    InterfaceInfo {
        vlan_range_list: settings.vlan_range_list.clone(),
        ipv4_address_pool_list: settings.ipv4_address_pool.clone(),
        ipv6_address_pool_list: settings.ipv6_address_pool.clone(),
        bw_params,
        mtu: attributes.mtu.or_else(|| link.and_then(|l| l.mtu)),
        txqueuelen: attributes.txqueuelen.or_else(|| link.and_then(|l| l.txqueuelen)),
        speed: attributes.speed,
        mac: link.and_then(|l| l.mac.clone()),
        ipv4: addresses(IpFamily::Ipv4),
        ipv6: addresses(IpFamily::Ipv6),
        master: link.and_then(|l| l.parent.clone()),
        is_alias: settings.is_alias.clone(),
        operstate: link.and_then(|l| l.operstate.clone()),
    }
}

/// Everything but the certificate and neighbour table, which need I/O the
/// caller may not have.
pub fn host_facts(config: &AgentConfig, links: &HostLinks, sysfs: &Path) -> AgentResult<HostFacts> {
    let mut net_info = NetInfo::default();
    for name in &config.agent.interfaces {
        let link = links.get(name);
        if link.is_none() {
            warn!(interface = %name, "Configured interface is not present on the host");
        }
        let attributes = link_attributes(sysfs, name);
        net_info
            .interfaces
            .insert(name.clone(), interface_info(config, name, link, &attributes));
    }
    let summary = serde_json::to_value(config).map_err(|e| AgentError::parse("agent config", e))?;
    Ok(HostFacts {
        net_info,
        summary: Some(Summary { config: summary }),
        ..Default::default()
    })
}

/// Address the host registers under.
pub fn host_ip(config: &AgentConfig, links: &HostLinks) -> Option<String> {
    if let Some(ip) = config.general.ip.as_ref().filter(|ip| !ip.is_empty()) {
        return Some(ip.clone());
    }
    config
        .agent
        .interfaces
        .iter()
        .filter_map(|name| links.get(name))
        .find_map(|link| link.addresses(IpFamily::Ipv4).next())
        .map(|prefix| prefix.address().to_string())
}

/// The host report body: facts plus identity.
pub fn report_body(hostname: &str, ip: &str, facts: &HostFacts, now: i64) -> AgentResult<Value> {
    let mut body = match serde_json::to_value(facts).map_err(|e| AgentError::parse("host facts", e))? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    body.insert("hostname".to_string(), json!(hostname));
    body.insert("ip".to_string(), json!(ip));
    body.insert("insertTime".to_string(), json!(now));
    body.insert("updateTime".to_string(), json!(now));
    Ok(Value::Object(body))
}
