//! CLI argument definitions

use super::parse_address;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mprof",
    about = "Function-level profiler core: calibration, trace analysis and a self-instrumenting demo",
    after_help = "\
EXAMPLES:
    mprof calibrate --iterations 50000         Measure instrumentation overhead
    mprof demo --threads 4 --record run.json   Instrument generated code and record its trace
    mprof analyze run.json --inner 18 --outer 41 --export stats.json"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Measure the self-cost of one instrumented call on this machine
    Calibrate {
        /// Number of measured calls
        #[arg(long, default_value = "10000")]
        iterations: usize,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Analyze a recorded trace file
    Analyze {
        /// Trace file (JSON array of per-thread chunks)
        #[arg(value_name = "TRACE")]
        trace: PathBuf,

        /// Overhead ticks inside each recorded call
        #[arg(long, default_value = "0")]
        inner: i64,

        /// Overhead ticks a caller sees on top of each call
        #[arg(long, default_value = "0")]
        outer: i64,

        /// Write the statistics tree as JSON
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,

        /// Binary to resolve callee addresses against
        #[arg(long, value_name = "PATH")]
        binary: Option<PathBuf>,

        /// Runtime address the binary was loaded at (hex)
        #[arg(long, value_parser = parse_address, default_value = "0", requires = "binary")]
        load_base: usize,

        /// Number of functions to list
        #[arg(long, default_value = "20")]
        top: usize,
    },

    /// Instrument generated code in this process and report its statistics
    Demo {
        /// Worker threads calling the instrumented code
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Calls per worker thread
        #[arg(long, default_value = "1000")]
        calls: usize,

        /// Records a thread may buffer before blocking (0 = unlimited)
        #[arg(long, default_value = "0")]
        trace_limit: usize,

        /// Calibrate overhead first and correct the statistics with it
        #[arg(long)]
        calibrate: bool,

        /// Write the statistics tree as JSON
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,

        /// Save the collected trace for `mprof analyze`
        #[arg(long, value_name = "FILE")]
        record: Option<PathBuf>,
    },
}
