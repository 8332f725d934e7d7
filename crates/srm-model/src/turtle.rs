//! Turtle reader and writer.
//!
//! The reader covers the grammar used by orchestrators and by our own
//! writer: `@prefix`/`PREFIX`, `@base`/`BASE`, prefixed names, IRIs, `a`,
//! predicate and object lists, blank node labels and property lists,
//! collections, short and long strings with escapes, language tags,
//! datatypes, numbers and booleans. Prefixed local names are read
//! leniently so that site URIs such as `site:dtn01:eth0:vlanport+3001`
//! parse as written by other tools.

use crate::error::{ModelError, ModelResult};
use crate::graph::Graph;
use crate::prefixes::{Prefixes, RDF};
use crate::term::{
    escape_literal, Term, XSD_BOOLEAN, XSD_DECIMAL, XSD_DOUBLE, XSD_INTEGER,
};
use std::collections::{BTreeMap, BTreeSet};

/// Parses a Turtle document.
pub fn parse(text: &str) -> ModelResult<Graph> {
    parse_as(text, "turtle")
}

pub(crate) fn parse_as(text: &str, format: &'static str) -> ModelResult<Graph> {
    let mut parser = Parser::new(text, format);
    parser.document()?;
    Ok(parser.graph)
}

struct Parser {
    format: &'static str,
    chars: Vec<char>,
    pos: usize,
    line: usize,
    prefixes: BTreeMap<String, String>,
    base: Option<String>,
    graph: Graph,
    fresh: usize,
}

const NAME_DELIMITERS: &[char] = &['<', '>', '"', '\'', '(', ')', '[', ']', ';', ',', '{', '}', '#'];

impl Parser {
    fn new(text: &str, format: &'static str) -> Self {
        Self {
            format,
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            prefixes: BTreeMap::new(),
            base: None,
            graph: Graph::new(),
            fresh: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ModelError {
        ModelError::syntax(self.format, self.line, message)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, wanted: char) -> ModelResult<()> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == wanted => Ok(()),
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", wanted, c))),
            None => Err(self.error(format!("expected '{}', found end of input", wanted))),
        }
    }

    fn fresh_blank(&mut self) -> Term {
        self.fresh += 1;
        Term::blank(format!("genid{}", self.fresh))
    }

    fn document(&mut self) -> ModelResult<()> {
        loop {
            self.skip_ws();
            let Some(c) = self.peek() else {
                return Ok(());
            };
            if c == '@' {
                self.at_directive()?;
                continue;
            }
            if self.sparql_directive()? {
                continue;
            }
            self.triples()?;
            self.expect('.')?;
        }
    }

    fn at_directive(&mut self) -> ModelResult<()> {
        self.bump();
        let word = self.read_word();
        match word.as_str() {
            "prefix" => {
                self.prefix_binding()?;
                self.expect('.')
            }
            "base" => {
                self.skip_ws();
                let iri = self.iri_ref()?;
                self.base = Some(iri);
                self.expect('.')
            }
            other => Err(self.error(format!("unknown directive @{}", other))),
        }
    }

    /// `PREFIX` and `BASE` without a trailing dot.
    fn sparql_directive(&mut self) -> ModelResult<bool> {
        let start = (self.pos, self.line);
        let word = self.read_word();
        match word.to_ascii_uppercase().as_str() {
            "PREFIX" => {
                self.prefix_binding()?;
                Ok(true)
            }
            "BASE" => {
                self.skip_ws();
                let iri = self.iri_ref()?;
                self.base = Some(iri);
                Ok(true)
            }
            _ => {
                self.pos = start.0;
                self.line = start.1;
                Ok(false)
            }
        }
    }

    fn prefix_binding(&mut self) -> ModelResult<()> {
        self.skip_ws();
        let name = self.read_name();
        let Some(prefix) = name.strip_suffix(':') else {
            return Err(self.error(format!("prefix '{}' must end with ':'", name)));
        };
        let prefix = prefix.to_string();
        self.skip_ws();
        let iri = self.iri_ref()?;
        self.prefixes.insert(prefix, iri);
        Ok(())
    }

    fn read_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == ':' || c == '-' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    /// Reads a bare token (prefixed name, keyword or number). A trailing
    /// dot is left in the input as the statement terminator.
    fn read_name(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || NAME_DELIMITERS.contains(&c) {
                break;
            }
            if c == '\\' {
                self.bump();
            }
            self.bump();
        }
        while self.pos > start + 1 && self.chars[self.pos - 1] == '.' && self.chars[self.pos - 2] != '\\' {
            self.pos -= 1;
        }
        if self.pos == start + 1 && self.chars[start] == '.' {
            self.pos = start;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn triples(&mut self) -> ModelResult<()> {
        self.skip_ws();
        if self.peek() == Some('[') {
            let subject = self.blank_property_list()?;
            self.skip_ws();
            if !matches!(self.peek(), Some('.') | None) {
                self.predicate_object_list(&subject)?;
            }
            return Ok(());
        }
        let subject = self.subject()?;
        self.predicate_object_list(&subject)
    }

    fn subject(&mut self) -> ModelResult<Term> {
        self.skip_ws();
        match self.peek() {
            Some('<') => Ok(Term::Iri(self.iri_ref()?)),
            Some('(') => self.collection(),
            Some(_) => {
                let name = self.read_name();
                if name.is_empty() {
                    return Err(self.error("expected subject"));
                }
                self.resolve_name(&name)
            }
            None => Err(self.error("expected subject, found end of input")),
        }
    }

    fn predicate_object_list(&mut self, subject: &Term) -> ModelResult<()> {
        loop {
            let predicate = self.verb()?;
            self.object_list(subject, &predicate)?;
            self.skip_ws();
            if self.peek() != Some(';') {
                return Ok(());
            }
            while self.peek() == Some(';') {
                self.bump();
                self.skip_ws();
            }
            if matches!(self.peek(), Some('.') | Some(']') | None) {
                return Ok(());
            }
        }
    }

    fn verb(&mut self) -> ModelResult<Term> {
        self.skip_ws();
        if self.peek() == Some('<') {
            return Ok(Term::Iri(self.iri_ref()?));
        }
        let name = self.read_name();
        match name.as_str() {
            "" => Err(self.error("expected predicate")),
            "a" => Ok(Term::iri(format!("{}type", RDF))),
            _ => match self.resolve_name(&name)? {
                term @ Term::Iri(_) => Ok(term),
                _ => Err(self.error(format!("predicate '{}' must be an IRI", name))),
            },
        }
    }

    fn object_list(&mut self, subject: &Term, predicate: &Term) -> ModelResult<()> {
        loop {
            let object = self.object()?;
            self.graph
                .insert(subject.clone(), predicate.clone(), object);
            self.skip_ws();
            if self.peek() == Some(',') {
                self.bump();
            } else {
                return Ok(());
            }
        }
    }

    fn object(&mut self) -> ModelResult<Term> {
        self.skip_ws();
        match self.peek() {
            Some('<') => Ok(Term::Iri(self.iri_ref()?)),
            Some('"') | Some('\'') => self.literal(),
            Some('[') => self.blank_property_list(),
            Some('(') => self.collection(),
            Some(c) if c.is_ascii_digit() || c == '+' || c == '-' || c == '.' => self.number(),
            Some(_) => {
                let name = self.read_name();
                match name.as_str() {
                    "" => Err(self.error("expected object")),
                    "true" | "false" => Ok(Term::typed(name, XSD_BOOLEAN)),
                    _ => self.resolve_name(&name),
                }
            }
            None => Err(self.error("expected object, found end of input")),
        }
    }

    fn number(&mut self) -> ModelResult<Term> {
        let text = self.read_name();
        let datatype = if text.contains(['e', 'E']) {
            XSD_DOUBLE
        } else if text.contains('.') {
            XSD_DECIMAL
        } else {
            XSD_INTEGER
        };
        let valid = match datatype {
            XSD_INTEGER => text.parse::<i128>().is_ok(),
            _ => text.parse::<f64>().is_ok(),
        };
        if !valid {
            return Err(self.error(format!("invalid number '{}'", text)));
        }
        let text = text.strip_prefix('+').unwrap_or(&text).to_string();
        Ok(Term::typed(text, datatype))
    }

    fn blank_property_list(&mut self) -> ModelResult<Term> {
        self.expect('[')?;
        let node = self.fresh_blank();
        self.skip_ws();
        if self.peek() != Some(']') {
            self.predicate_object_list(&node)?;
        }
        self.expect(']')?;
        Ok(node)
    }

    fn collection(&mut self) -> ModelResult<Term> {
        self.expect('(')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(')') => {
                    self.bump();
                    break;
                }
                None => return Err(self.error("unterminated collection")),
                _ => items.push(self.object()?),
            }
        }
        let nil = Term::iri(format!("{}nil", RDF));
        let first = Term::iri(format!("{}first", RDF));
        let rest = Term::iri(format!("{}rest", RDF));
        let mut head = nil;
        for item in items.into_iter().rev() {
            let node = self.fresh_blank();
            self.graph.insert(node.clone(), first.clone(), item);
            self.graph.insert(node.clone(), rest.clone(), head);
            head = node;
        }
        Ok(head)
    }

    fn resolve_name(&self, name: &str) -> ModelResult<Term> {
        if let Some(label) = name.strip_prefix("_:") {
            if label.is_empty() {
                return Err(self.error("empty blank node label"));
            }
            return Ok(Term::blank(label));
        }
        let Some((prefix, local)) = name.split_once(':') else {
            return Err(self.error(format!("unexpected token '{}'", name)));
        };
        let Some(namespace) = self.prefixes.get(prefix) else {
            return Err(self.error(format!("undefined prefix '{}:'", prefix)));
        };
        let mut iri = namespace.clone();
        let mut chars = local.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    iri.push(escaped);
                }
            } else {
                iri.push(c);
            }
        }
        Ok(Term::Iri(iri))
    }

    fn iri_ref(&mut self) -> ModelResult<String> {
        self.expect('<')?;
        let mut iri = String::new();
        loop {
            match self.bump() {
                Some('>') => break,
                Some('\\') => iri.push(self.unicode_escape()?),
                Some(c) if c == '\n' => return Err(self.error("newline in IRI")),
                Some(c) => iri.push(c),
                None => return Err(self.error("unterminated IRI")),
            }
        }
        Ok(self.resolve_iri(iri))
    }

    fn resolve_iri(&self, iri: String) -> String {
        let Some(base) = &self.base else {
            return iri;
        };
        if iri.is_empty() {
            return base.clone();
        }
        let has_scheme = iri.split_once(':').is_some_and(|(scheme, _)| {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c))
        });
        if has_scheme {
            return iri;
        }
        if iri.starts_with('#') {
            let stem = base.split('#').next().unwrap_or(base);
            return format!("{}{}", stem, iri);
        }
        format!("{}{}", base, iri)
    }

    fn unicode_escape(&mut self) -> ModelResult<char> {
        let width = match self.bump() {
            Some('u') => 4,
            Some('U') => 8,
            Some(c) => return Err(self.error(format!("invalid escape '\\{}'", c))),
            None => return Err(self.error("unterminated escape")),
        };
        let mut hex = String::with_capacity(width);
        for _ in 0..width {
            match self.bump() {
                Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                _ => return Err(self.error("invalid unicode escape")),
            }
        }
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error(format!("invalid code point U+{}", hex)))
    }

    fn literal(&mut self) -> ModelResult<Term> {
        let value = self.string()?;
        match self.peek() {
            Some('@') => {
                self.bump();
                let mut lang = String::new();
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == '-' {
                        lang.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                if lang.is_empty() {
                    return Err(self.error("empty language tag"));
                }
                Ok(Term::lang(value, lang))
            }
            Some('^') if self.peek_at(1) == Some('^') => {
                self.bump();
                self.bump();
                let datatype = if self.peek() == Some('<') {
                    self.iri_ref()?
                } else {
                    let name = self.read_name();
                    match self.resolve_name(&name)? {
                        Term::Iri(iri) => iri,
                        _ => return Err(self.error("datatype must be an IRI")),
                    }
                };
                Ok(Term::typed(value, datatype))
            }
            _ => Ok(Term::literal(value)),
        }
    }

    fn string(&mut self) -> ModelResult<String> {
        let Some(quote) = self.bump() else {
            return Err(self.error("expected string"));
        };
        let long = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if long {
            self.bump();
            self.bump();
        } else if self.peek() == Some(quote) {
            self.bump();
            return Ok(String::new());
        }
        let mut value = String::new();
        loop {
            if !long && matches!(self.peek(), Some('\n') | Some('\r')) {
                return Err(self.error("newline in short string"));
            }
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string"));
            };
            if c == quote {
                if !long {
                    return Ok(value);
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.bump();
                    self.bump();
                    // Quotes directly before the closing delimiter belong to the value.
                    while self.peek() == Some(quote) {
                        value.push(quote);
                        self.bump();
                    }
                    return Ok(value);
                }
                value.push(c);
                continue;
            }
            if c == '\\' {
                value.push(self.string_escape()?);
            } else {
                value.push(c);
            }
        }
    }

    fn string_escape(&mut self) -> ModelResult<char> {
        match self.peek() {
            Some('u') | Some('U') => self.unicode_escape(),
            Some(c) => {
                self.bump();
                Ok(match c {
                    't' => '\t',
                    'b' => '\u{8}',
                    'n' => '\n',
                    'r' => '\r',
                    'f' => '\u{c}',
                    '"' => '"',
                    '\'' => '\'',
                    '\\' => '\\',
                    other => return Err(self.error(format!("invalid escape '\\{}'", other))),
                })
            }
            None => Err(self.error("unterminated escape")),
        }
    }
}

/// Writes a graph as Turtle, grouping triples by subject. Only prefixes
/// that are used appear in the header.
pub fn serialize(graph: &Graph, prefixes: &Prefixes) -> String {
    let rdf_type = Term::iri(format!("{}type", RDF));
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut body = String::new();
    for subject in graph.subjects() {
        let Some(properties) = graph.properties(subject) else {
            continue;
        };
        body.push_str(&format_term(subject, prefixes, &mut used));
        let mut first = true;
        for (predicate, objects) in properties {
            body.push_str(if first { " " } else { " ;\n    " });
            first = false;
            if *predicate == rdf_type {
                body.push('a');
            } else {
                body.push_str(&format_term(predicate, prefixes, &mut used));
            }
            body.push(' ');
            let rendered: Vec<String> = objects
                .iter()
                .map(|o| format_term(o, prefixes, &mut used))
                .collect();
            body.push_str(&rendered.join(", "));
        }
        body.push_str(" .\n\n");
    }
    let mut out = String::new();
    for (prefix, namespace) in prefixes.iter() {
        if used.contains(prefix) {
            out.push_str(&format!("@prefix {}: <{}> .\n", prefix, namespace));
        }
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&body);
    out
}

fn format_term(term: &Term, prefixes: &Prefixes, used: &mut BTreeSet<String>) -> String {
    match term {
        Term::Iri(iri) => format_iri(iri, prefixes, used),
        Term::Blank(id) => format!("_:{}", id),
        Term::Literal(lit) => {
            let mut out = format!("\"{}\"", escape_literal(&lit.value));
            if let Some(lang) = &lit.lang {
                out.push('@');
                out.push_str(lang);
            } else if let Some(dt) = &lit.datatype {
                out.push_str("^^");
                out.push_str(&format_iri(dt, prefixes, used));
            }
            out
        }
    }
}

fn format_iri(iri: &str, prefixes: &Prefixes, used: &mut BTreeSet<String>) -> String {
    if let Some((prefix, local)) = prefixes.shorten(iri) {
        if is_safe_local(local) {
            used.insert(prefix.to_string());
            return format!("{}:{}", prefix, local);
        }
    }
    Term::iri(iri).to_string()
}

fn is_safe_local(local: &str) -> bool {
    let mut chars = local.chars();
    match chars.next() {
        None => true,
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':')
        }
        Some(_) => false,
    }
}
