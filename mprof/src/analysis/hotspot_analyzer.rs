//! Hotspot ranking.
//!
//! Folds a [`CallGraph`] by function and orders functions by the time spent
//! in their own bodies.
//!
//! ```text
//! FUNCTION                  CALLS   EXCL%   EXCLUSIVE   INCLUSIVE
//! ───────────────────────────────────────────────────────────────
//! parser::next_token        41202   42.3%     1839203     2219020
//! alloc::grow                9120   18.7%      812039      812039
//! ```

// Percentage calculations intentionally convert i64 to f64
#![allow(clippy::cast_precision_loss)]

use super::call_graph::CallGraph;
use mprof_common::FunctionStatistics;

/// One function's totals across every path it was reached by.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionHotspot {
    pub address: usize,

    /// Resolved name, filled in by the caller when symbols are available.
    pub name: Option<String>,

    pub statistics: FunctionStatistics,

    /// Share of the total exclusive time (0.0 - 100.0).
    pub percentage: f64,
}

impl FunctionHotspot {
    /// Name if resolved, hex address otherwise
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("{:#x}", self.address))
    }
}

/// Rank the functions of `graph` by exclusive time, largest first.
///
/// Functions that were entered but never completed a call are left out.
#[must_use]
pub fn analyze_hotspots(graph: &CallGraph) -> Vec<FunctionHotspot> {
    let totals = graph.totals();
    let total_exclusive: i64 = totals.values().map(|s| s.exclusive_time.max(0)).sum();

    let mut hotspots: Vec<FunctionHotspot> = totals
        .into_iter()
        .filter(|(_, statistics)| statistics.times_called > 0)
        .map(|(address, statistics)| {
            let percentage = if total_exclusive > 0 {
                (statistics.exclusive_time.max(0) as f64 / total_exclusive as f64) * 100.0
            } else {
                0.0
            };
            FunctionHotspot { address, name: None, statistics, percentage }
        })
        .collect();

    hotspots.sort_by(|a, b| {
        b.statistics.exclusive_time.cmp(&a.statistics.exclusive_time).then(a.address.cmp(&b.address))
    });
    hotspots
}
