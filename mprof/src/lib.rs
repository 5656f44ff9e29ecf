//! # mprof - In-Process Function Profiler Core
//!
//! mprof instruments machine-code functions of a running process in place,
//! records every entry and exit with a tick timestamp, and turns the per-thread
//! record streams into call trees with inclusive/exclusive timing.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Instrumented Process (x86-64)                   │
//! │                                                                 │
//! │   caller ──► jumper ──► trampoline ──► original function body   │
//! │                           │    ▲                                │
//! │                   on_enter│    │on_exit (saved return address)  │
//! │                           ▼    │                                │
//! │                  ┌──────────────────┐                           │
//! │                  │  CallsCollector  │  per-thread double buffer │
//! │                  └────────┬─────────┘                           │
//! └───────────────────────────┼─────────────────────────────────────┘
//!                             │ read_collected (Poller)
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Analyzer ── ShadowStack per thread ──► CallGraph statistics   │
//! │        │                                       │                │
//! │        ▼                                       ▼                │
//! │   TraceData (replay)                 hotspots / JSON export     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Instrumentation
//!
//! - [`memory`]: page protection, executable memory within `rel32` reach of
//!   a module, `/proc/self/maps` parsing
//! - [`patcher`]: jumpers, trampoline code generation, function patches
//!   (in-place and with relocated leading instructions)
//! - [`patch_manager`]: module-relative apply/revert/query that survives
//!   module unload and reload
//!
//! ### Recording and Analysis
//!
//! - [`collector`]: the calls collector, its drain poller and overhead
//!   calibration
//! - [`analysis`]: shadow stacks, path-keyed call graphs, hotspot ranking
//! - [`trace_data`]: recorded traces on disk
//! - [`export`]: JSON statistics report
//! - [`symbolization`]: DWARF names for reported addresses
//!
//! ### Shared
//!
//! - [`domain`]: identifiers, overhead pair and error types
//! - [`cli`]: command-line arguments of the `mprof` binary
//!
//! ## Typical Usage
//!
//! ```bash
//! # Measure the per-call overhead on this machine
//! mprof calibrate
//!
//! # Instrument generated code and record what it did
//! mprof demo --threads 4 --record run.json
//!
//! # Analyze a recorded trace with overhead correction
//! mprof analyze run.json --inner 18 --outer 41 --export stats.json
//! ```

pub mod analysis;
pub mod cli;
pub mod collector;
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub mod demo;
pub mod domain;
pub mod export;
pub mod memory;
pub mod patch_manager;
pub mod patcher;
pub mod symbolization;
pub mod trace_data;
