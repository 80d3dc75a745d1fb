//! Deterministic identifiers for steps, tasks and resource actions.
//!
//! Every occurrence of a named operation gets the id `{name}_{n}`, where
//! `name` is the dot-joined path of enclosing step and task ids and `n`
//! counts invocations of that exact path within one run. Two runs that
//! execute identical code paths in identical order therefore emit identical
//! id sequences, which is what lines history lookups up during replay.
//!
//! A fresh generator is constructed for every run, including resumed runs.
//! Reusing a generator across runs drifts the counters and silently
//! misattributes cached results to the wrong invocation.

use std::collections::HashMap;

/// Per-run counter table for unique event ids.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counters: HashMap<String, u64>,
}

impl IdGenerator {
    /// Create a generator with all counters at their initial position.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next id for `name` and advance its counter.
    pub fn next_id(&mut self, name: &str) -> String {
        let counter = self.counters.entry(name.to_string()).or_insert(0);
        let id = format!("{name}_{}", *counter);
        *counter += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_per_name() {
        let mut ids = IdGenerator::new();
        assert_eq!(ids.next_id("wf.greet"), "wf.greet_0");
        assert_eq!(ids.next_id("wf.greet"), "wf.greet_1");
        assert_eq!(ids.next_id("wf.farewell"), "wf.farewell_0");
        assert_eq!(ids.next_id("wf.greet"), "wf.greet_2");
    }

    #[test]
    fn fresh_generator_reproduces_the_sequence() {
        let names = ["wf.a", "wf.a", "wf.a.inner", "wf.b", "wf.a"];

        let mut first = IdGenerator::new();
        let recorded: Vec<String> = names.iter().map(|n| first.next_id(n)).collect();

        let mut second = IdGenerator::new();
        let replayed: Vec<String> = names.iter().map(|n| second.next_id(n)).collect();

        assert_eq!(recorded, replayed);
    }

    #[test]
    fn reused_generator_drifts_and_misattributes() {
        // A resumed run MUST NOT reuse the previous run's generator: the
        // same code path would get different ids and cache lookups would
        // land on the wrong records.
        let mut ids = IdGenerator::new();
        let first_run = ids.next_id("wf.charge");
        let resumed_run = ids.next_id("wf.charge");
        assert_ne!(first_run, resumed_run);
    }
}
