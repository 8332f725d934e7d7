//! Namespaces of the topology model.

use crate::term::Term;
use std::collections::BTreeMap;

pub const NML: &str = "http://schemas.ogf.org/nml/2013/03/base#";
pub const MRS: &str = "http://schemas.ogf.org/mrs/2013/12/topology#";
pub const RDF: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub const RDFS: &str = "http://www.w3.org/2000/01/rdf-schema#";
pub const OWL: &str = "http://www.w3.org/2002/07/owl#";
pub const XSD: &str = "http://www.w3.org/2001/XMLSchema#";
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
pub const SCHEMA: &str = "http://schemas.ogf.org/nml/2012/10/ethernet";
pub const SD: &str = "http://schemas.ogf.org/nsi/2013/12/services/definition#";

/// Label type IRI of ethernet vlans.
pub const VLAN_LABEL_TYPE: &str = "http://schemas.ogf.org/nml/2012/10/ethernet#vlan";

pub fn nml(local: &str) -> Term {
    Term::iri(format!("{}{}", NML, local))
}

pub fn mrs(local: &str) -> Term {
    Term::iri(format!("{}{}", MRS, local))
}

pub fn rdf_type() -> Term {
    Term::iri(format!("{}type", RDF))
}

pub fn rdf(local: &str) -> Term {
    Term::iri(format!("{}{}", RDF, local))
}

/// Prefix table used when writing Turtle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefixes {
    map: BTreeMap<String, String>,
}

impl Prefixes {
    /// The standard namespaces plus `site` bound to the site URI.
    pub fn for_site(site_uri: &str) -> Self {
        let mut prefixes = Self::default();
        prefixes.insert("site", format!("{}:", site_uri));
        prefixes
    }

    pub fn insert(&mut self, prefix: impl Into<String>, namespace: impl Into<String>) {
        self.map.insert(prefix.into(), namespace.into());
    }

    pub fn get(&self, prefix: &str) -> Option<&str> {
        self.map.get(prefix).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.map.iter().map(|(p, n)| (p.as_str(), n.as_str()))
    }

    /// Splits an IRI into the longest matching `(prefix, local)` pair.
    pub fn shorten<'a>(&'a self, iri: &'a str) -> Option<(&'a str, &'a str)> {
        self.map
            .iter()
            .filter(|(_, ns)| iri.starts_with(ns.as_str()))
            .max_by_key(|(_, ns)| ns.len())
            .map(|(prefix, ns)| (prefix.as_str(), &iri[ns.len()..]))
    }
}

impl Default for Prefixes {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for (prefix, ns) in [
            ("nml", NML),
            ("mrs", MRS),
            ("rdf", RDF),
            ("rdfs", RDFS),
            ("owl", OWL),
            ("xsd", XSD),
            ("xml", XML),
            ("schema", SCHEMA),
            ("sd", SD),
        ] {
            map.insert(prefix.to_string(), ns.to_string());
        }
        Self { map }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorten_prefers_longest_namespace() {
        let mut prefixes = Prefixes::for_site("urn:ogf:network:example.org:2024");
        prefixes.insert("sw1", "urn:ogf:network:example.org:2024:sw1:");
        assert_eq!(
            prefixes.shorten("urn:ogf:network:example.org:2024:sw1:Ethernet0"),
            Some(("sw1", "Ethernet0"))
        );
        assert_eq!(
            prefixes.shorten(&format!("{}hasLabel", NML)),
            Some(("nml", "hasLabel"))
        );
        assert_eq!(prefixes.shorten("http://elsewhere/x"), None);
    }
}
