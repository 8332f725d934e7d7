//! URI layout of site resources.
//!
//! ```text
//! <site>                                      urn:ogf:network:<domain>:<year>
//! <site>:<node>                               switch or host
//! <site>:<node>:<port>                        port ('/' and ' ' become '_')
//! <port>:vlanport+<vlan>                      vlan sub-port
//! <vlanport>:label+<vlan>                     vlan label
//! <site>:<switch>:service+vsw:<vsw>           virtual switching service
//! <site>:<switch>:service+rst                 routing service
//! <site>:<switch>:service+rst-ipv4            per-family routing service
//! ```

use crate::error::{ModelError, ModelResult};
use srm_types::{IpFamily, VlanId};

/// Canonical port name as it appears in URIs.
pub fn encode_port(name: &str) -> String {
    name.replace(['/', ' '], "_")
}

/// Builds and splits URIs below one site URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteUris {
    site: String,
}

impl SiteUris {
    pub fn new(site_uri: impl Into<String>) -> Self {
        let mut site = site_uri.into();
        while site.ends_with(':') {
            site.pop();
        }
        Self { site }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    /// True when the URI lies below the site.
    pub fn contains(&self, uri: &str) -> bool {
        uri.strip_prefix(&self.site)
            .is_some_and(|rest| rest.starts_with(':'))
    }

    pub fn node(&self, name: &str) -> String {
        format!("{}:{}", self.site, name)
    }

    pub fn port(&self, node: &str, port: &str) -> String {
        format!("{}:{}:{}", self.site, node, encode_port(port))
    }

    pub fn vlan_port(&self, port_uri: &str, vlan: VlanId) -> String {
        format!("{}:vlanport+{}", port_uri, vlan)
    }

    pub fn label(&self, vlan_port_uri: &str, vlan: VlanId) -> String {
        format!("{}:label+{}", vlan_port_uri, vlan)
    }

    pub fn lifetime(&self, subject: &str) -> String {
        format!("{}:lifetime", subject)
    }

    pub fn address(&self, port_uri: &str, family: IpFamily, value: &str) -> String {
        format!(
            "{}:{}-address+{}",
            port_uri,
            family.as_str(),
            value.replace([':', '/'], "_")
        )
    }

    pub fn bandwidth_service(&self, port_uri: &str) -> String {
        format!("{}:service+bw", port_uri)
    }

    pub fn vlan_range(&self, port_uri: &str) -> String {
        format!("{}:vlan-range", port_uri)
    }

    pub fn vsw_service(&self, switch: &str, vsw: &str) -> String {
        format!("{}:{}:service+vsw:{}", self.site, switch, vsw)
    }

    pub fn rst_service(&self, switch: &str) -> String {
        format!("{}:{}:service+rst", self.site, switch)
    }

    pub fn rst_family(&self, switch: &str, family: IpFamily) -> String {
        format!("{}-{}", self.rst_service(switch), family.as_str())
    }

    pub fn routing_table(&self, rst_family_uri: &str, name: &str) -> String {
        format!("{}:rt-table+{}", rst_family_uri, name)
    }

    /// Splits a port URI into `(node, port)`.
    ///
    /// The site prefix is stripped and segments carrying a `+` qualifier
    /// (`vlanport+3001`, `service+vsw`, ...) are dropped. The first remaining
    /// segment is the node, the rest joined by `:` is the port.
    pub fn int_out(&self, uri: &str) -> ModelResult<(String, String)> {
        let rest = uri
            .strip_prefix(&self.site)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| ModelError::invalid_value(uri, "not below the site URI"))?;
        let segments: Vec<&str> = rest
            .split(':')
            .filter(|s| !s.is_empty() && !s.contains('+'))
            .collect();
        match segments.as_slice() {
            [node, port @ ..] if !port.is_empty() => Ok((node.to_string(), port.join(":"))),
            _ => Err(ModelError::invalid_value(uri, "no host and port in URI")),
        }
    }
}

/// Trailing `vlanport+N` of a URI, if any.
pub fn vlan_suffix(uri: &str) -> Option<u16> {
    let last = uri.rsplit(':').next()?;
    last.strip_prefix("vlanport+")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = "urn:ogf:network:example.org:2024";

    #[test]
    fn test_builders() {
        let uris = SiteUris::new(format!("{}:", SITE));
        let port = uris.port("sw1", "hundredGigE 1/1");
        assert_eq!(port, format!("{}:sw1:hundredGigE_1_1", SITE));
        let vlan = VlanId::new(3001).unwrap();
        let vport = uris.vlan_port(&port, vlan);
        assert!(vport.ends_with(":hundredGigE_1_1:vlanport+3001"));
        assert!(uris.label(&vport, vlan).ends_with(":vlanport+3001:label+3001"));
        assert_eq!(
            uris.address(&vport, IpFamily::Ipv6, "2001:db8::1/64"),
            format!("{}:ipv6-address+2001_db8__1_64", vport)
        );
        assert_eq!(
            uris.rst_family("sw1", IpFamily::Ipv4),
            format!("{}:sw1:service+rst-ipv4", SITE)
        );
    }

    #[test]
    fn test_int_out() {
        let uris = SiteUris::new(SITE);
        assert_eq!(
            uris.int_out(&format!("{}:dtn01:eth0:vlanport+3001", SITE)).unwrap(),
            ("dtn01".to_string(), "eth0".to_string())
        );
        assert_eq!(
            uris.int_out(&format!("{}:sw1:Ethernet1_1", SITE)).unwrap(),
            ("sw1".to_string(), "Ethernet1_1".to_string())
        );
        assert!(uris.int_out(&format!("{}:sw1", SITE)).is_err());
        assert!(uris.int_out("urn:ogf:network:other.org:2024:sw1:p").is_err());
    }

    #[test]
    fn test_contains_and_suffix() {
        let uris = SiteUris::new(SITE);
        assert!(uris.contains(&format!("{}:sw1", SITE)));
        assert!(!uris.contains(&format!("{}0:sw1", SITE)));
        assert_eq!(vlan_suffix("urn:x:eth0:vlanport+3001"), Some(3001));
        assert_eq!(vlan_suffix("urn:x:eth0"), None);
    }
}
