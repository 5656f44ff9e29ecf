//! # Shadow Stack
//!
//! Rebuilds one thread's call tree from its flat enter/exit stream.
//!
//! ```text
//!   records:  enter A ─ enter B ─ exit ─ exit
//!   stack:    [A]       [A, B]    [A]    []
//!   graph:    A         A          A       A (1 call)
//!                       └ B        └ B      └ B (1 call)
//! ```
//!
//! ## Timing
//!
//! For a closing frame:
//!
//! - `observed  = exit - entry - inner`
//! - `inclusive = observed - overhead of instrumented callees`
//! - `exclusive = observed - time observed in callees (plus their overhead)`
//!
//! where each completed callee charges its parent with `inner + outer`
//! ticks of instrumentation it did not spend in its own body.
//!
//! ## Chunking
//!
//! Open frames persist between [`ShadowStack::update`] calls, so a call can
//! be entered in one drained chunk and closed in a later one. The graph is
//! passed in on every update and may have been cleared in between; the
//! nodes of open frames are looked up again at the start of each update.

use super::call_graph::{CallGraph, NodeId};
use crate::domain::Overhead;
use log::debug;
use mprof_common::CallRecord;

#[derive(Debug, Clone, Copy)]
struct Frame {
    callee: usize,
    entered: u64,
    node: NodeId,
    /// Activations of the same node below this one on the stack
    level: u32,
    children_time_observed: i64,
    children_overhead: i64,
}

/// Call stack reconstruction for a single thread.
#[derive(Debug, Clone)]
pub struct ShadowStack {
    inner_overhead: i64,
    total_overhead: i64,
    stack: Vec<Frame>,
}

#[allow(clippy::cast_possible_wrap)]
fn elapsed(from: u64, to: u64) -> i64 {
    to.wrapping_sub(from) as i64
}

/// Node for `callee` entered on top of `parents`.
///
/// A function re-entering itself directly gets one nested node; deeper
/// direct self-recursion accumulates into that same node.
fn child_node(graph: &mut CallGraph, parents: &[Frame], callee: usize) -> NodeId {
    match parents {
        [.., grand, parent] if parent.callee == callee && grand.callee == callee => parent.node,
        [.., parent] => graph.entry(Some(parent.node), callee),
        [] => graph.entry(None, callee),
    }
}

impl ShadowStack {
    #[must_use]
    pub fn new(overhead: Overhead) -> Self {
        Self { inner_overhead: overhead.inner, total_overhead: overhead.total(), stack: Vec::new() }
    }

    /// Number of calls entered and not yet exited
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn restore_state(&mut self, graph: &mut CallGraph) {
        for i in 0..self.stack.len() {
            let node = child_node(graph, &self.stack[..i], self.stack[i].callee);
            self.stack[i].node = node;
        }
    }

    /// Account `records` into `graph`, adding onto whatever it holds.
    ///
    /// An exit with no open call is dropped.
    pub fn update(&mut self, records: &[CallRecord], graph: &mut CallGraph) {
        self.restore_state(graph);

        for record in records {
            if !record.is_exit() {
                let node = child_node(graph, &self.stack, record.callee);
                let level = self.stack.iter().filter(|f| f.node == node).count();

                self.stack.push(Frame {
                    callee: record.callee,
                    entered: record.timestamp,
                    node,
                    level: u32::try_from(level).unwrap_or(u32::MAX),
                    children_time_observed: 0,
                    children_overhead: 0,
                });
                continue;
            }

            let Some(frame) = self.stack.pop() else {
                debug!("Dropping exit at {} with no open call", record.timestamp);
                continue;
            };
            let observed = elapsed(frame.entered, record.timestamp) - self.inner_overhead;
            let inclusive = observed - frame.children_overhead;
            let exclusive = observed - frame.children_time_observed;

            graph.statistics_mut(frame.node).add_call(frame.level, inclusive, exclusive);
            if let Some(parent) = self.stack.last_mut() {
                parent.children_time_observed += observed + self.total_overhead;
                parent.children_overhead += self.total_overhead + frame.children_overhead;
            }
        }
    }
}
