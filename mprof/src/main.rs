//! # mprof - Main Entry Point
//!
//! - **calibrate**: measure the instrumentation overhead of this machine
//! - **analyze**: replay a recorded trace through the shadow-stack analyzer
//! - **demo**: instrument generated code in-process (x86-64 Linux)

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use mprof::analysis::{analyze_hotspots, Analyzer};
use mprof::cli::{format_hotspots, resolve_names, Args, Command};
use mprof::collector::timestamp;
use mprof::domain::{Overhead, PatchError};
use mprof::export::StatisticsExporter;
use mprof::symbolization::{BinarySymbols, NameResolver, Symbolizer};
use mprof::trace_data::TraceData;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_UNSUPPORTED: i32 = 3;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PatchError>() {
        Some(PatchError::Unsupported) => EXIT_UNSUPPORTED,
        _ => EXIT_ERROR,
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    match args.command {
        Command::Calibrate { iterations, json } => {
            let overhead = calibrate(iterations)?;
            if json {
                println!("{}", serde_json::to_string(&overhead)?);
            } else {
                println!("inner: {}", overhead.inner);
                println!("outer: {}", overhead.outer);
                if !quiet {
                    let frequency = timestamp::ticks_per_second(Duration::from_millis(100));
                    println!("ticks/s: {frequency}");
                }
            }
        }

        Command::Analyze { trace, inner, outer, export, binary, load_base, top } => {
            let data = TraceData::from_file(&trace)
                .with_context(|| format!("Failed to load trace {}", trace.display()))?;
            if !quiet {
                println!("trace: {}", trace.display());
                println!("threads: {}, records: {}", data.thread_ids().len(), data.record_count());
            }

            let mut analyzer = Analyzer::new(Overhead::new(inner, outer));
            data.replay(&mut analyzer);

            let symbols = binary
                .map(|path| -> Result<BinarySymbols> {
                    let symbolizer = Symbolizer::new(&path).context("Failed to create symbolizer")?;
                    Ok(BinarySymbols::new(symbolizer, load_base))
                })
                .transpose()?;
            let names = symbols.as_ref().map(|s| s as &dyn NameResolver);

            report(&analyzer, names, top, quiet);
            if let Some(path) = export {
                export_statistics(&analyzer, names, &path, quiet)?;
            }
        }

        Command::Demo { threads, calls, trace_limit, calibrate: with_calibration, export, record } => {
            let overhead =
                if with_calibration { calibrate(mprof::collector::DEFAULT_ITERATIONS)? } else { Overhead::default() };
            demo(threads, calls, trace_limit, overhead, export.as_deref(), record.as_deref(), quiet)?;
        }
    }

    Ok(())
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn demo(
    threads: usize,
    calls: usize,
    trace_limit: usize,
    overhead: Overhead,
    export: Option<&Path>,
    record: Option<&Path>,
    quiet: bool,
) -> Result<()> {
    let options = mprof::demo::DemoOptions { threads, calls, trace_limit, overhead, record: record.is_some() };
    let outcome = mprof::demo::run_demo(&options)?;

    if !quiet {
        for patch in &outcome.patches {
            println!("patch #{} rva {:#x}: {:?}", patch.id, patch.rva, patch.state);
        }
    }
    report(&outcome.analyzer, Some(&outcome.names), usize::MAX, quiet);

    if let (Some(path), Some(trace)) = (record, &outcome.trace) {
        trace.save(path).with_context(|| format!("Failed to write trace {}", path.display()))?;
        if !quiet {
            println!("recorded: {}", path.display());
        }
    }
    if let Some(path) = export {
        export_statistics(&outcome.analyzer, Some(&outcome.names), path, quiet)?;
    }
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
fn demo(
    _threads: usize,
    _calls: usize,
    _trace_limit: usize,
    _overhead: Overhead,
    _export: Option<&Path>,
    _record: Option<&Path>,
    _quiet: bool,
) -> Result<()> {
    Err(PatchError::Unsupported.into())
}

fn calibrate(iterations: usize) -> Result<Overhead> {
    let overhead = mprof::collector::calibrate(iterations)?;
    info!("Calibrated overhead: {overhead}");
    Ok(overhead)
}

fn report(analyzer: &Analyzer, names: Option<&dyn NameResolver>, top: usize, quiet: bool) {
    let mut hotspots = analyze_hotspots(&analyzer.merged());
    if let Some(names) = names {
        resolve_names(&mut hotspots, names);
    }

    if !quiet {
        println!("overhead: {}", analyzer.overhead());
    }
    print!("{}", format_hotspots(&hotspots, top));
}

fn export_statistics(analyzer: &Analyzer, names: Option<&dyn NameResolver>, path: &Path, quiet: bool) -> Result<()> {
    let exporter = names.map_or_else(StatisticsExporter::new, StatisticsExporter::with_names);
    let file = File::create(path).context("Failed to create statistics output file")?;
    exporter.export(analyzer, BufWriter::new(file)).context("Failed to export statistics")?;

    if !quiet {
        println!("saved: {}", path.display());
    }
    Ok(())
}
