//! JSON-LD in expanded form.
//!
//! Output is an array of node objects, one per subject, with `rdf:type`
//! written as `@type`. Input may be such an array, a single node object or
//! a document with a `@graph` member. Nested node objects are flattened
//! into the graph. `@context` is not interpreted, so compacted documents
//! must use absolute IRIs for properties.

use crate::error::{ModelError, ModelResult};
use crate::graph::Graph;
use crate::prefixes::rdf_type;
use crate::term::{Literal, Term, XSD_BOOLEAN, XSD_DOUBLE, XSD_INTEGER};
use serde_json::{json, Map, Value};

pub fn serialize(graph: &Graph) -> String {
    let rdf_type = rdf_type();
    let mut nodes = Vec::new();
    for subject in graph.subjects() {
        let Some(properties) = graph.properties(subject) else {
            continue;
        };
        let mut node = Map::new();
        node.insert("@id".into(), Value::String(node_id(subject)));
        for (predicate, objects) in properties {
            if *predicate == rdf_type {
                let types = objects.iter().map(|o| Value::String(node_id(o))).collect();
                node.insert("@type".into(), Value::Array(types));
                continue;
            }
            let values = objects.iter().map(object_value).collect();
            node.insert(predicate.as_str().to_string(), Value::Array(values));
        }
        nodes.push(Value::Object(node));
    }
    // Pretty printing a Value cannot fail.
    serde_json::to_string_pretty(&Value::Array(nodes)).unwrap_or_default()
}

fn node_id(term: &Term) -> String {
    match term {
        Term::Blank(id) => format!("_:{}", id),
        other => other.as_str().to_string(),
    }
}

fn object_value(term: &Term) -> Value {
    match term {
        Term::Iri(_) | Term::Blank(_) => json!({ "@id": node_id(term) }),
        Term::Literal(Literal {
            value,
            datatype,
            lang,
        }) => {
            let mut obj = Map::new();
            obj.insert("@value".into(), Value::String(value.clone()));
            if let Some(dt) = datatype {
                obj.insert("@type".into(), Value::String(dt.clone()));
            }
            if let Some(lang) = lang {
                obj.insert("@language".into(), Value::String(lang.clone()));
            }
            Value::Object(obj)
        }
    }
}

pub fn parse(text: &str) -> ModelResult<Graph> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|e| ModelError::syntax("json-ld", e.line(), e.to_string()))?;
    let mut reader = Reader::default();
    match &doc {
        Value::Array(nodes) => {
            for node in nodes {
                reader.node(node)?;
            }
        }
        Value::Object(obj) => match obj.get("@graph") {
            Some(Value::Array(nodes)) => {
                for node in nodes {
                    reader.node(node)?;
                }
            }
            Some(_) => return Err(invalid("@graph must be an array")),
            None => {
                reader.node(&doc)?;
            }
        },
        _ => return Err(invalid("document must be an array or object")),
    }
    Ok(reader.graph)
}

fn invalid(message: &str) -> ModelError {
    ModelError::syntax("json-ld", 0, message)
}

#[derive(Default)]
struct Reader {
    graph: Graph,
    fresh: usize,
}

impl Reader {
    /// Adds a node object and returns its subject term.
    fn node(&mut self, value: &Value) -> ModelResult<Term> {
        let Value::Object(obj) = value else {
            return Err(invalid("node must be an object"));
        };
        let subject = match obj.get("@id") {
            Some(Value::String(id)) => id_term(id),
            Some(_) => return Err(invalid("@id must be a string")),
            None => {
                self.fresh += 1;
                Term::blank(format!("genid{}", self.fresh))
            }
        };
        for (key, value) in obj {
            match key.as_str() {
                "@id" | "@context" => {}
                "@type" => {
                    for ty in as_list(value) {
                        let Value::String(ty) = ty else {
                            return Err(invalid("@type must hold strings"));
                        };
                        self.graph.insert(subject.clone(), rdf_type(), id_term(ty));
                    }
                }
                key if key.starts_with('@') => {}
                predicate => {
                    let predicate = Term::iri(predicate);
                    for item in as_list(value) {
                        let object = self.object(item)?;
                        self.graph.insert(subject.clone(), predicate.clone(), object);
                    }
                }
            }
        }
        Ok(subject)
    }

    fn object(&mut self, value: &Value) -> ModelResult<Term> {
        match value {
            Value::String(s) => Ok(Term::literal(s.clone())),
            Value::Bool(b) => Ok(Term::typed(b.to_string(), XSD_BOOLEAN)),
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Term::typed(n.to_string(), XSD_INTEGER)),
            Value::Number(n) => Ok(Term::typed(n.to_string(), XSD_DOUBLE)),
            Value::Object(obj) if obj.contains_key("@value") => {
                let lexical = match &obj["@value"] {
                    Value::String(s) => s.clone(),
                    Value::Null => return Err(invalid("@value must not be null")),
                    other => other.to_string(),
                };
                if let Some(Value::String(lang)) = obj.get("@language") {
                    return Ok(Term::lang(lexical, lang.clone()));
                }
                match obj.get("@type") {
                    Some(Value::String(dt)) => Ok(Term::typed(lexical, dt.clone())),
                    _ => match &obj["@value"] {
                        Value::Bool(_) => Ok(Term::typed(lexical, XSD_BOOLEAN)),
                        Value::Number(n) if n.is_i64() || n.is_u64() => {
                            Ok(Term::typed(lexical, XSD_INTEGER))
                        }
                        Value::Number(_) => Ok(Term::typed(lexical, XSD_DOUBLE)),
                        _ => Ok(Term::literal(lexical)),
                    },
                }
            }
            Value::Object(obj) if obj.len() == 1 && obj.contains_key("@id") => match &obj["@id"] {
                Value::String(id) => Ok(id_term(id)),
                _ => Err(invalid("@id must be a string")),
            },
            Value::Object(_) => self.node(value),
            Value::Array(_) | Value::Null => Err(invalid("unsupported value")),
        }
    }
}

fn id_term(id: &str) -> Term {
    match id.strip_prefix("_:") {
        Some(label) => Term::blank(label),
        None => Term::iri(id),
    }
}

fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefixes::{mrs, nml};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serialize_then_parse() {
        let mut g = Graph::new();
        let port = Term::iri("urn:ogf:network:example.org:2024:dtn01:eth0");
        g.insert(port.clone(), rdf_type(), nml("BidirectionalPort"));
        g.insert(port.clone(), mrs("tag"), Term::literal("x"));
        g.insert(port.clone(), mrs("priority"), Term::integer(0));
        g.insert(port.clone(), nml("existsDuring"), Term::blank("life"));
        g.insert(Term::blank("life"), nml("name"), Term::lang("hi", "en"));
        let text = serialize(&g);
        assert!(text.contains("\"@type\""));
        assert_eq!(parse(&text).unwrap(), g);
    }

    #[test]
    fn test_parse_graph_wrapper_and_nested_nodes() {
        let text = r#"{
            "@context": {"nml": "ignored"},
            "@graph": [{
                "@id": "urn:a",
                "@type": "http://schemas.ogf.org/nml/2013/03/base#Node",
                "http://schemas.ogf.org/nml/2013/03/base#hasBidirectionalPort": {
                    "@id": "urn:a:p1",
                    "http://schemas.ogf.org/mrs/2013/12/topology#capacity": 100
                }
            }]
        }"#;
        let g = parse(text).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(
            g.object(&Term::iri("urn:a:p1"), &mrs("capacity")),
            Some(&Term::integer(100))
        );
        assert_eq!(
            g.object(&Term::iri("urn:a"), &rdf_type()),
            Some(&nml("Node"))
        );
    }

    #[test]
    fn test_parse_rejects_scalars() {
        assert!(parse("42").is_err());
        assert!(parse("{not json").is_err());
    }
}
