//! In-memory triple store.
//!
//! Triples are indexed subject → predicate → objects in ordered maps, so
//! iteration is deterministic and serializations of equal graphs are
//! byte-identical.

use crate::term::{Term, Triple};
use std::collections::{BTreeMap, BTreeSet};

type Objects = BTreeSet<Term>;
type Predicates = BTreeMap<Term, Objects>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    spo: BTreeMap<Term, Predicates>,
    len: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds a triple. Returns false if it was already present.
    pub fn insert(&mut self, subject: Term, predicate: Term, object: Term) -> bool {
        let added = self
            .spo
            .entry(subject)
            .or_default()
            .entry(predicate)
            .or_default()
            .insert(object);
        if added {
            self.len += 1;
        }
        added
    }

    pub fn insert_triple(&mut self, triple: Triple) -> bool {
        self.insert(triple.subject, triple.predicate, triple.object)
    }

    /// Removes a triple. Returns false if it was absent.
    pub fn remove(&mut self, subject: &Term, predicate: &Term, object: &Term) -> bool {
        let Some(predicates) = self.spo.get_mut(subject) else {
            return false;
        };
        let Some(objects) = predicates.get_mut(predicate) else {
            return false;
        };
        if !objects.remove(object) {
            return false;
        }
        if objects.is_empty() {
            predicates.remove(predicate);
        }
        if predicates.is_empty() {
            self.spo.remove(subject);
        }
        self.len -= 1;
        true
    }

    pub fn contains(&self, subject: &Term, predicate: &Term, object: &Term) -> bool {
        self.spo
            .get(subject)
            .and_then(|p| p.get(predicate))
            .is_some_and(|o| o.contains(object))
    }

    /// Iterates all triples in subject, predicate, object order.
    pub fn iter(&self) -> impl Iterator<Item = (&Term, &Term, &Term)> + '_ {
        self.spo.iter().flat_map(|(s, preds)| {
            preds
                .iter()
                .flat_map(move |(p, objs)| objs.iter().map(move |o| (s, p, o)))
        })
    }

    pub fn triples(&self) -> Vec<Triple> {
        self.iter()
            .map(|(s, p, o)| Triple::new(s.clone(), p.clone(), o.clone()))
            .collect()
    }

    /// Every subject that has at least one triple.
    pub fn subjects(&self) -> impl Iterator<Item = &Term> + '_ {
        self.spo.keys()
    }

    /// Predicate → objects of a subject.
    pub fn properties(&self, subject: &Term) -> Option<&BTreeMap<Term, BTreeSet<Term>>> {
        self.spo.get(subject)
    }

    /// Objects of `(subject, predicate, ?)`, in order.
    pub fn objects<'a>(
        &'a self,
        subject: &Term,
        predicate: &Term,
    ) -> impl Iterator<Item = &'a Term> + 'a {
        self.spo
            .get(subject)
            .and_then(|p| p.get(predicate))
            .into_iter()
            .flatten()
    }

    /// First object of `(subject, predicate, ?)`.
    pub fn object(&self, subject: &Term, predicate: &Term) -> Option<&Term> {
        self.objects(subject, predicate).next()
    }

    /// Subjects of `(?, predicate, object)`.
    pub fn subjects_with<'a>(
        &'a self,
        predicate: &'a Term,
        object: &'a Term,
    ) -> impl Iterator<Item = &'a Term> + 'a {
        self.spo.iter().filter_map(move |(s, preds)| {
            preds
                .get(predicate)
                .is_some_and(|objs| objs.contains(object))
                .then_some(s)
        })
    }

    /// Adds every triple of `other`.
    pub fn extend(&mut self, other: &Graph) {
        for (s, p, o) in other.iter() {
            self.insert(s.clone(), p.clone(), o.clone());
        }
    }

    /// Removes every triple of `other`.
    pub fn subtract(&mut self, other: &Graph) {
        for (s, p, o) in other.iter() {
            self.remove(s, p, o);
        }
    }

    /// Triples of `self` absent from `other`.
    pub fn difference(&self, other: &Graph) -> Graph {
        let mut out = Graph::new();
        for (s, p, o) in self.iter() {
            if !other.contains(s, p, o) {
                out.insert(s.clone(), p.clone(), o.clone());
            }
        }
        out
    }
}

impl FromIterator<Triple> for Graph {
    fn from_iter<I: IntoIterator<Item = Triple>>(iter: I) -> Self {
        let mut graph = Graph::new();
        for triple in iter {
            graph.insert_triple(triple);
        }
        graph
    }
}
