//! N+1 query detection.
//!
//! Counts lazy relationship loads per (table, relationship) pair within a
//! session and warns once a pair reaches the threshold. Loading the same
//! relationship for many parents one at a time is almost always better done
//! with a single select-in load.
//!
//! The first few loads of each pair are kept as samples naming the parent
//! row, so the warning can point at the rows that triggered it.

use scopedb_core::Value;
use std::collections::HashMap;

/// Samples kept per (table, relationship) pair.
const SAMPLES_PER_RELATIONSHIP: usize = 5;

/// One recorded lazy load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSample {
    pub table: &'static str,
    pub relationship: &'static str,
    /// Key of the parent whose relationship was loaded
    pub parent: Option<Value>,
}

/// Summary of recorded lazy loads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct N1Stats {
    /// Total number of lazy loads recorded
    pub total_loads: usize,
    /// Number of distinct relationships loaded
    pub relationships_loaded: usize,
    /// Number of relationships at or over the threshold
    pub potential_n1: usize,
}

/// Tracks lazy loads for N+1 detection.
#[derive(Debug)]
pub struct N1QueryTracker {
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    samples: Vec<LoadSample>,
}

impl Default for N1QueryTracker {
    fn default() -> Self {
        Self::new(3)
    }
}

impl N1QueryTracker {
    /// Create a tracker that warns at `threshold` loads (minimum 1).
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold: threshold.max(1),
            samples: Vec::new(),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one lazy load of `relationship` on the `table` row keyed
    /// `parent`, warning when the pair reaches the threshold.
    pub fn record_load(
        &mut self,
        table: &'static str,
        relationship: &'static str,
        parent: Option<Value>,
    ) {
        let count = self.counts.entry((table, relationship)).or_insert(0);
        *count += 1;
        let count = *count;

        if count <= SAMPLES_PER_RELATIONSHIP {
            self.samples.push(LoadSample {
                table,
                relationship,
                parent,
            });
        }

        if count == self.threshold {
            tracing::warn!(
                target: "scopedb::n1",
                table,
                relationship,
                queries = count,
                threshold = self.threshold,
                "N+1 query pattern detected; load this relationship with select_in instead"
            );
            for sample in self
                .samples
                .iter()
                .filter(|s| s.table == table && s.relationship == relationship)
            {
                tracing::debug!(target: "scopedb::n1", parent = ?sample.parent, "lazy load");
            }
        }
    }

    /// Reset all counts and samples.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.samples.clear();
    }

    #[must_use]
    pub fn count_for(&self, table: &str, relationship: &str) -> usize {
        self.counts
            .iter()
            .find(|((t, r), _)| *t == table && *r == relationship)
            .map_or(0, |(_, c)| *c)
    }

    #[must_use]
    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            relationships_loaded: self.counts.len(),
            potential_n1: self
                .counts
                .values()
                .filter(|c| **c >= self.threshold)
                .count(),
        }
    }

    /// The first loads of each pair, in recording order.
    #[must_use]
    pub fn samples(&self) -> &[LoadSample] {
        &self.samples
    }
}
