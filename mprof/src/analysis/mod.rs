//! Analysis of collected call records
//!
//! Turns the flat per-thread enter/exit streams into call trees and ranks
//! functions by where the time went.
//!
//! ```text
//!   (thread, records) ──► Analyzer ──► ShadowStack per thread ──► CallGraph
//!                                                                  │
//!                                          analyze_hotspots ◄──────┘
//! ```

pub mod analyzer;
pub mod call_graph;
pub mod hotspot_analyzer;
pub mod shadow_stack;

pub use analyzer::Analyzer;
pub use call_graph::{CallGraph, CallNode, NodeId};
pub use hotspot_analyzer::{analyze_hotspots, FunctionHotspot};
pub use shadow_stack::ShadowStack;
