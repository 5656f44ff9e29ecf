//! Path-keyed statistics tree.
//!
//! Every node holds the statistics of one function as reached through one
//! particular chain of callers, plus the nodes of its direct callees:
//!
//! ```text
//!   main ─┬─ parse ── read        (main → parse → read)
//!         └─ read                 (main → read, a separate node)
//! ```
//!
//! Nodes live in an arena and are addressed by [`NodeId`], which stays
//! valid until [`CallGraph::clear`].

use mprof_common::FunctionStatistics;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallNode {
    pub callee: usize,
    pub statistics: FunctionStatistics,
    callees: BTreeMap<usize, NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallGraph {
    nodes: Vec<CallNode>,
    roots: BTreeMap<usize, NodeId>,
}

impl CallGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total number of nodes at every depth
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }

    /// Node for `callee` under `parent` (a root when `None`), created empty
    /// if missing.
    pub fn entry(&mut self, parent: Option<NodeId>, callee: usize) -> NodeId {
        let existing = match parent {
            Some(parent) => self.nodes[parent.0].callees.get(&callee),
            None => self.roots.get(&callee),
        };
        if let Some(&id) = existing {
            return id;
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(CallNode { callee, ..CallNode::default() });
        match parent {
            Some(parent) => self.nodes[parent.0].callees.insert(callee, id),
            None => self.roots.insert(callee, id),
        };
        id
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &CallNode {
        &self.nodes[id.0]
    }

    pub fn statistics_mut(&mut self, id: NodeId) -> &mut FunctionStatistics {
        &mut self.nodes[id.0].statistics
    }

    /// Top-level nodes, ordered by callee address
    pub fn roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.roots.values().copied()
    }

    /// Direct callees of `id`, ordered by callee address
    pub fn callees(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id.0].callees.values().copied()
    }

    /// Node reached by following `path` from the roots
    #[must_use]
    pub fn find(&self, path: &[usize]) -> Option<&CallNode> {
        let (first, rest) = path.split_first()?;
        let mut id = *self.roots.get(first)?;

        for callee in rest {
            id = *self.nodes[id.0].callees.get(callee)?;
        }
        Some(&self.nodes[id.0])
    }

    /// Add every node of `other` onto the node with the same path here.
    pub fn merge(&mut self, other: &CallGraph) {
        let mut pending: Vec<(Option<NodeId>, NodeId)> = other.roots().map(|id| (None, id)).collect();

        while let Some((parent, source)) = pending.pop() {
            let node = other.node(source);
            let target = self.entry(parent, node.callee);

            *self.statistics_mut(target) += &node.statistics;
            pending.extend(other.callees(source).map(|child| (Some(target), child)));
        }
    }

    /// Statistics per callee regardless of the path it was reached by.
    ///
    /// Inclusive time of a function that appears nested under itself is
    /// counted once per path it shows up on.
    #[must_use]
    pub fn totals(&self) -> BTreeMap<usize, FunctionStatistics> {
        let mut totals: BTreeMap<usize, FunctionStatistics> = BTreeMap::new();

        for node in &self.nodes {
            *totals.entry(node.callee).or_default() += &node.statistics;
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(times_called: u64, inclusive_time: i64, exclusive_time: i64) -> FunctionStatistics {
        FunctionStatistics { times_called, inclusive_time, exclusive_time, ..FunctionStatistics::default() }
    }

    #[test]
    fn test_entry_is_idempotent_per_parent() {
        let mut graph = CallGraph::new();

        let main = graph.entry(None, 0x10);
        let read_under_main = graph.entry(Some(main), 0x20);
        let read_at_top = graph.entry(None, 0x20);

        assert_eq!(graph.entry(None, 0x10), main);
        assert_eq!(graph.entry(Some(main), 0x20), read_under_main);
        assert_ne!(read_under_main, read_at_top);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.roots().count(), 2);
    }

    #[test]
    fn test_find_follows_path() {
        let mut graph = CallGraph::new();
        let a = graph.entry(None, 1);
        let b = graph.entry(Some(a), 2);
        *graph.statistics_mut(b) = stats(3, 30, 10);

        assert_eq!(graph.find(&[1, 2]).map(|n| n.statistics), Some(stats(3, 30, 10)));
        assert!(graph.find(&[2]).is_none());
        assert!(graph.find(&[]).is_none());
    }

    #[test]
    fn test_merge_adds_by_path() {
        let mut lhs = CallGraph::new();
        let a = lhs.entry(None, 1);
        *lhs.statistics_mut(a) = stats(1, 10, 4);
        let b = lhs.entry(Some(a), 2);
        *lhs.statistics_mut(b) = stats(1, 6, 6);

        let mut rhs = CallGraph::new();
        let a = rhs.entry(None, 1);
        *rhs.statistics_mut(a) = stats(2, 20, 20);
        let c = rhs.entry(Some(a), 3);
        *rhs.statistics_mut(c) = stats(5, 5, 5);

        lhs.merge(&rhs);

        assert_eq!(lhs.find(&[1]).map(|n| n.statistics), Some(stats(3, 30, 24)));
        assert_eq!(lhs.find(&[1, 2]).map(|n| n.statistics), Some(stats(1, 6, 6)));
        assert_eq!(lhs.find(&[1, 3]).map(|n| n.statistics), Some(stats(5, 5, 5)));
    }

    #[test]
    fn test_totals_fold_paths_by_callee() {
        let mut graph = CallGraph::new();
        let a = graph.entry(None, 1);
        let b1 = graph.entry(Some(a), 2);
        let b2 = graph.entry(None, 2);
        *graph.statistics_mut(b1) = stats(1, 5, 5);
        *graph.statistics_mut(b2) = stats(2, 7, 3);

        let totals = graph.totals();

        assert_eq!(totals[&2], stats(3, 12, 8));
        assert_eq!(totals[&1], FunctionStatistics::default());
    }
}
