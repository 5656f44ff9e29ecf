//! Statistics export
//!
//! Writes the analyzer's per-thread call trees as one JSON document:
//!
//! ```text
//! {
//!   "overhead": { "inner": 18, "outer": 41 },
//!   "threads": [ { "thread_id": 4121, "calls": [ CallEntry, ... ] } ],
//!   "hotspots": [ { "address": "0x4010a0", "name": "...", "statistics": {..}, "percentage": 42.3 } ]
//! }
//!
//! CallEntry = { "address", "name", "statistics", "callees": [ CallEntry, ... ] }
//! ```
//!
//! Addresses are hex strings; names come from an optional [`NameResolver`]
//! and are omitted when unknown.

use crate::analysis::{analyze_hotspots, Analyzer, CallGraph, NodeId};
use crate::domain::{ExportError, Overhead, ThreadId};
use crate::symbolization::NameResolver;
use mprof_common::FunctionStatistics;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct StatisticsReport {
    overhead: Overhead,
    threads: Vec<ThreadReport>,
    hotspots: Vec<HotspotEntry>,
}

#[derive(Debug, Serialize)]
struct ThreadReport {
    thread_id: ThreadId,
    calls: Vec<CallEntry>,
}

#[derive(Debug, Serialize)]
struct CallEntry {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    statistics: FunctionStatistics,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    callees: Vec<CallEntry>,
}

#[derive(Debug, Serialize)]
struct HotspotEntry {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    statistics: FunctionStatistics,
    percentage: f64,
}

/// JSON report writer over an [`Analyzer`]
pub struct StatisticsExporter<'a> {
    names: Option<&'a dyn NameResolver>,
}

impl<'a> StatisticsExporter<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self { names: None }
    }

    #[must_use]
    pub fn with_names(names: &'a dyn NameResolver) -> Self {
        Self { names: Some(names) }
    }

    fn name_of(&self, address: usize) -> Option<String> {
        self.names.and_then(|names| names.name_of(address))
    }

    fn call_entry(&self, graph: &CallGraph, id: NodeId) -> CallEntry {
        let node = graph.node(id);
        CallEntry {
            address: format!("{:#x}", node.callee),
            name: self.name_of(node.callee),
            statistics: node.statistics,
            callees: graph.callees(id).map(|child| self.call_entry(graph, child)).collect(),
        }
    }

    fn report(&self, analyzer: &Analyzer) -> StatisticsReport {
        let threads = analyzer
            .thread_ids()
            .filter_map(|thread_id| {
                let graph = analyzer.thread(thread_id)?;
                let calls = graph.roots().map(|root| self.call_entry(graph, root)).collect();
                Some(ThreadReport { thread_id, calls })
            })
            .collect();

        let hotspots = analyze_hotspots(&analyzer.merged())
            .into_iter()
            .map(|hotspot| HotspotEntry {
                address: format!("{:#x}", hotspot.address),
                name: self.name_of(hotspot.address),
                statistics: hotspot.statistics,
                percentage: hotspot.percentage,
            })
            .collect();

        StatisticsReport { overhead: analyzer.overhead(), threads, hotspots }
    }

    /// Write the report for `analyzer` as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if serialization or the underlying writer fails
    pub fn export<W: Write>(&self, analyzer: &Analyzer, mut writer: W) -> Result<(), ExportError> {
        let report = self.report(analyzer);
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl Default for StatisticsExporter<'_> {
    fn default() -> Self {
        Self::new()
    }
}
