//! Serialization formats of the published model.

use crate::error::{ModelError, ModelResult};
use crate::graph::Graph;
use crate::prefixes::Prefixes;
use crate::{jsonld, ntriples, turtle};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFormat {
    Turtle,
    NTriples,
    JsonLd,
}

impl ModelFormat {
    pub const ALL: [ModelFormat; 3] = [ModelFormat::Turtle, ModelFormat::NTriples, ModelFormat::JsonLd];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Turtle => "turtle",
            ModelFormat::NTriples => "ntriples",
            ModelFormat::JsonLd => "json-ld",
        }
    }

    /// File extension of model files written in this format.
    pub const fn extension(&self) -> &'static str {
        match self {
            ModelFormat::Turtle => "ttl",
            ModelFormat::NTriples => "nt",
            ModelFormat::JsonLd => "jsonld",
        }
    }

    pub const fn content_type(&self) -> &'static str {
        match self {
            ModelFormat::Turtle => "text/turtle",
            ModelFormat::NTriples => "application/n-triples",
            ModelFormat::JsonLd => "application/ld+json",
        }
    }

    /// Guesses the format of submitted text: JSON documents are JSON-LD,
    /// everything else is read as Turtle (which covers N-Triples).
    pub fn detect(text: &str) -> Self {
        match text.trim_start().chars().next() {
            Some('{') | Some('[') => ModelFormat::JsonLd,
            _ => ModelFormat::Turtle,
        }
    }

    pub fn parse(&self, text: &str) -> ModelResult<Graph> {
        match self {
            ModelFormat::Turtle => turtle::parse(text),
            ModelFormat::NTriples => ntriples::parse(text),
            ModelFormat::JsonLd => jsonld::parse(text),
        }
    }

    pub fn serialize(&self, graph: &Graph, prefixes: &Prefixes) -> String {
        match self {
            ModelFormat::Turtle => turtle::serialize(graph, prefixes),
            ModelFormat::NTriples => ntriples::serialize(graph),
            ModelFormat::JsonLd => jsonld::serialize(graph),
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFormat {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "turtle" | "ttl" => Ok(ModelFormat::Turtle),
            "ntriples" | "nt" | "n-triples" => Ok(ModelFormat::NTriples),
            "json-ld" | "jsonld" => Ok(ModelFormat::JsonLd),
            other => Err(ModelError::invalid_value("model", format!("unknown format '{}'", other))),
        }
    }
}

/// A graph rendered in every published format, with its identity hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedModel {
    pub turtle: String,
    pub ntriples: String,
    pub jsonld: String,
    /// Hex sha256 of the N-Triples form.
    pub hash: String,
}

impl SerializedModel {
    pub fn new(graph: &Graph, prefixes: &Prefixes) -> Self {
        let ntriples = ntriples::serialize(graph);
        Self {
            turtle: turtle::serialize(graph, prefixes),
            hash: ntriples::hash(graph),
            jsonld: jsonld::serialize(graph),
            ntriples,
        }
    }

    pub fn get(&self, format: ModelFormat) -> &str {
        match format {
            ModelFormat::Turtle => &self.turtle,
            ModelFormat::NTriples => &self.ntriples,
            ModelFormat::JsonLd => &self.jsonld,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefixes::{nml, rdf_type};
    use crate::term::Term;

    #[test]
    fn test_every_format_reads_back() {
        let mut g = Graph::new();
        g.insert(Term::iri("urn:ogf:network:example.org:2024:sw1"), rdf_type(), nml("Node"));
        g.insert(
            Term::iri("urn:ogf:network:example.org:2024:sw1"),
            nml("name"),
            Term::literal("sw1"),
        );
        let model = SerializedModel::new(&g, &Prefixes::for_site("urn:ogf:network:example.org:2024"));
        for format in ModelFormat::ALL {
            assert_eq!(format.parse(model.get(format)).unwrap(), g, "{format}");
            assert_eq!(ModelFormat::detect(model.get(format)) == ModelFormat::JsonLd, format == ModelFormat::JsonLd);
        }
        assert_eq!(model.hash, ntriples::hash(&g));
    }

    #[test]
    fn test_format_names() {
        assert_eq!("ttl".parse::<ModelFormat>().unwrap(), ModelFormat::Turtle);
        assert_eq!("json-ld".parse::<ModelFormat>().unwrap(), ModelFormat::JsonLd);
        assert!("rdfxml".parse::<ModelFormat>().is_err());
    }
}
