//! N-Triples: the canonical form used for model identity.

use crate::error::ModelResult;
use crate::graph::Graph;
use crate::turtle;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// One line per triple, in graph order.
pub fn serialize(graph: &Graph) -> String {
    let mut out = String::new();
    for (s, p, o) in graph.iter() {
        // Writing into a String cannot fail.
        let _ = writeln!(out, "{} {} {} .", s, p, o);
    }
    out
}

/// Parses N-Triples text. The grammar is a subset of Turtle.
pub fn parse(text: &str) -> ModelResult<Graph> {
    turtle::parse_as(text, "ntriples")
}

/// Hex sha256 of the canonical N-Triples form.
pub fn hash(graph: &Graph) -> String {
    hex::encode(Sha256::digest(serialize(graph).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Term;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serialize_is_sorted() {
        let mut g = Graph::new();
        g.insert(Term::iri("urn:b"), Term::iri("urn:p"), Term::literal("2"));
        g.insert(Term::iri("urn:a"), Term::iri("urn:p"), Term::literal("1"));
        assert_eq!(serialize(&g), "<urn:a> <urn:p> \"1\" .\n<urn:b> <urn:p> \"2\" .\n");
    }

    #[test]
    fn test_parse_serialized_graph() {
        let mut g = Graph::new();
        g.insert(Term::iri("urn:a"), Term::iri("urn:p"), Term::literal("tab\there \"q\""));
        g.insert(Term::iri("urn:a"), Term::iri("urn:p"), Term::integer(5));
        g.insert(Term::blank("n1"), Term::iri("urn:p"), Term::lang("hello", "en"));
        let parsed = parse(&serialize(&g)).unwrap();
        assert_eq!(parsed, g);
        assert_eq!(hash(&parsed), hash(&g));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let mut g = Graph::new();
        let empty = hash(&g);
        assert_eq!(empty.len(), 64);
        g.insert(Term::iri("urn:a"), Term::iri("urn:p"), Term::literal("1"));
        assert_ne!(hash(&g), empty);
    }
}
