//! Per-thread aggregation of drained call records.

use super::call_graph::CallGraph;
use super::shadow_stack::ShadowStack;
use crate::domain::{Overhead, ThreadId};
use mprof_common::CallRecord;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct ThreadAnalysis {
    stack: ShadowStack,
    graph: CallGraph,
}

/// Shadow stacks and statistics for every thread seen so far.
///
/// Statistics can be cleared between reports while the call stacks of
/// every thread are kept, so calls in progress are still accounted once
/// they complete.
#[derive(Debug, Clone)]
pub struct Analyzer {
    overhead: Overhead,
    threads: BTreeMap<ThreadId, ThreadAnalysis>,
    records_accepted: u64,
}

impl Analyzer {
    #[must_use]
    pub fn new(overhead: Overhead) -> Self {
        Self { overhead, threads: BTreeMap::new(), records_accepted: 0 }
    }

    #[must_use]
    pub fn overhead(&self) -> Overhead {
        self.overhead
    }

    /// Feed one drained chunk of `thread_id`'s trace.
    pub fn accept(&mut self, thread_id: ThreadId, records: &[CallRecord]) {
        let overhead = self.overhead;
        let thread = self
            .threads
            .entry(thread_id)
            .or_insert_with(|| ThreadAnalysis { stack: ShadowStack::new(overhead), graph: CallGraph::new() });

        thread.stack.update(records, &mut thread.graph);
        self.records_accepted += records.len() as u64;
    }

    /// Drop accumulated statistics, keeping open calls.
    pub fn clear(&mut self) {
        for thread in self.threads.values_mut() {
            thread.graph.clear();
        }
    }

    /// Whether any thread has statistics
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.threads.values().any(|t| !t.graph.is_empty())
    }

    pub fn thread_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.keys().copied()
    }

    #[must_use]
    pub fn thread(&self, thread_id: ThreadId) -> Option<&CallGraph> {
        self.threads.get(&thread_id).map(|t| &t.graph)
    }

    /// Statistics of all threads combined path by path
    #[must_use]
    pub fn merged(&self) -> CallGraph {
        let mut merged = CallGraph::new();

        for thread in self.threads.values() {
            merged.merge(&thread.graph);
        }
        merged
    }

    #[must_use]
    pub fn records_accepted(&self) -> u64 {
        self.records_accepted
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(Overhead::default())
    }
}
