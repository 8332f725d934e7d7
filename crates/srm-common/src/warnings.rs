//! Per-component warning accumulation.
//!
//! A warning seen in several consecutive cycles is escalated so that it
//! shows up in the service state table rather than only in the logs.

use std::collections::BTreeMap;

/// Counts consecutive occurrences of warning messages.
#[derive(Debug, Clone)]
pub struct WarningsTracker {
    threshold: u32,
    counts: BTreeMap<String, u32>,
}

impl WarningsTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: BTreeMap::new(),
        }
    }

    /// Records the warnings of one cycle and returns those that reached the
    /// threshold. Warnings absent from this cycle are forgotten.
    pub fn observe<I, S>(&mut self, warnings: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next: BTreeMap<String, u32> = BTreeMap::new();
        for warning in warnings {
            let warning = warning.into();
            let count = self.counts.get(&warning).copied().unwrap_or(0);
            next.entry(warning).or_insert(count + 1);
        }
        self.counts = next;
        self.escalated()
    }

    /// Warnings currently at or above the threshold.
    pub fn escalated(&self) -> Vec<String> {
        self.counts
            .iter()
            .filter(|(_, count)| **count >= self.threshold)
            .map(|(warning, _)| warning.clone())
            .collect()
    }

    /// All warnings seen in the last cycle.
    pub fn current(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for WarningsTracker {
    fn default() -> Self {
        Self::new(5)
    }
}
