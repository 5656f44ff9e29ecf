//! # Self-Profiling Demo
//!
//! Generates a tiny module at runtime, registers it like a loaded image and
//! drives it through the whole pipeline:
//!
//! ```text
//!   ModuleTracker ──mapped──► ImagePatchManager ──apply──► FunctionPatch ×2
//!                                                               │ on_enter/on_exit
//!   worker threads ──call outer()──► patched code ──────────────┘
//!                                                               ▼
//!                    Poller ◄──read_collected── CallsCollector
//!                      │
//!                      └──► Analyzer (+ TraceData when recording)
//! ```
//!
//! Module layout (int3 filler everywhere else):
//!
//! ```text
//!   +0x100 leaf:   mov eax, 42 ; ret
//!   +0x200 outer:  sub rsp, 8 ; call leaf ; call leaf ; add rsp, 8 ; ret
//! ```

#![allow(unsafe_code)] // generates and calls machine code

use crate::analysis::Analyzer;
use crate::collector::{CallsCollector, ChunkSink, CollectorConfig, Poller};
use crate::domain::{FunctionTarget, ModuleId, Overhead, ThreadId};
use crate::memory::native::{MappedPages, NativeMemoryManager};
use crate::memory::Protection;
use crate::patch_manager::{
    function_patch_factory, ImagePatchManager, MappedRegion, Mapping, MappingAccess, ModuleTracker, PatchManager,
};
use crate::patcher::InterceptorHandle;
use crate::trace_data::TraceData;
use anyhow::{bail, Context, Result};
use log::{debug, info};
use mprof_common::{CallRecord, ChangeOutcome, PatchState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const MODULE_SIZE: usize = 0x1000;
const FILLER: u8 = 0xCC;

const LEAF_RVA: u32 = 0x100;
const OUTER_RVA: u32 = 0x200;

/// `mov eax, 42 ; ret`
const LEAF_CODE: [u8; 6] = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
const LEAF_RESULT: u32 = 42;

const DEMO_MODULE: ModuleId = ModuleId(1);

/// Parameters of one demo run
#[derive(Debug, Clone, Copy)]
pub struct DemoOptions {
    pub threads: usize,
    /// Calls of `outer` per thread
    pub calls: usize,
    pub trace_limit: usize,
    pub overhead: Overhead,
    /// Keep every drained chunk for saving as a trace file
    pub record: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self { threads: 4, calls: 1000, trace_limit: 0, overhead: Overhead::default(), record: false }
    }
}

pub struct DemoOutcome {
    pub analyzer: Analyzer,
    pub names: HashMap<usize, String>,
    /// Patch states while the workers ran
    pub patches: Vec<PatchState>,
    pub trace: Option<TraceData>,
}

struct DemoSink {
    analyzer: Analyzer,
    trace: Option<TraceData>,
}

impl ChunkSink for DemoSink {
    fn accept_chunk(&mut self, thread_id: ThreadId, records: &[CallRecord]) {
        self.analyzer.accept(thread_id, records);
        if let Some(trace) = &mut self.trace {
            trace.push(thread_id, records);
        }
    }
}

fn outer_code() -> Vec<u8> {
    let call_leaf = |at: u32| {
        let next = i64::from(OUTER_RVA + at + 5);
        let rel = i32::try_from(i64::from(LEAF_RVA) - next).unwrap_or_default();
        let mut call = vec![0xE8];
        call.extend_from_slice(&rel.to_le_bytes());
        call
    };

    let mut code = vec![0x48, 0x83, 0xEC, 0x08];
    code.extend(call_leaf(4));
    code.extend(call_leaf(9));
    code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x08, 0xC3]);
    code
}

fn build_module() -> Result<MappedPages> {
    let rwx = Protection::READ | Protection::WRITE | Protection::EXECUTE;
    let page = MappedPages::new(MODULE_SIZE, rwx).context("Failed to map demo module")?;
    let outer = outer_code();

    // SAFETY: the page is writable and both functions fit inside it
    unsafe {
        std::ptr::write_bytes(page.as_ptr(), FILLER, page.len());
        std::ptr::copy_nonoverlapping(LEAF_CODE.as_ptr(), page.as_ptr().add(LEAF_RVA as usize), LEAF_CODE.len());
        std::ptr::copy_nonoverlapping(outer.as_ptr(), page.as_ptr().add(OUTER_RVA as usize), outer.len());
    }
    Ok(page)
}

/// Instrument the generated module, run `outer` on worker threads and
/// collect the statistics.
///
/// # Errors
/// Returns an error if the module cannot be mapped or a function cannot be
/// instrumented.
pub fn run_demo(options: &DemoOptions) -> Result<DemoOutcome> {
    let page = build_module()?;
    let base = page.address();
    let names: HashMap<usize, String> = [
        (base + LEAF_RVA as usize, "demo::leaf".to_string()),
        (base + OUTER_RVA as usize, "demo::outer".to_string()),
    ]
    .into_iter()
    .collect();

    let config = CollectorConfig { trace_limit: options.trace_limit, ..CollectorConfig::default() };
    let collector = Arc::new(CallsCollector::new(config));
    let tracker = Arc::new(ModuleTracker::new());
    let manager = ImagePatchManager::new(
        function_patch_factory(InterceptorHandle::new(Arc::clone(&collector))),
        Arc::clone(&tracker) as Arc<dyn MappingAccess>,
        Arc::new(NativeMemoryManager::default()),
    );

    let mapping = Mapping {
        path: Some("<demo>".to_string()),
        base,
        regions: vec![MappedRegion::new(page.range(), Protection::READ | Protection::WRITE | Protection::EXECUTE)],
    };
    let mapping_id = tracker.load(DEMO_MODULE, mapping);

    let outer_len = u32::try_from(outer_code().len()).unwrap_or_default();
    let targets = [FunctionTarget::new(LEAF_RVA, 6), FunctionTarget::new(OUTER_RVA, outer_len)];
    for result in manager.apply(DEMO_MODULE, &targets) {
        if result.result != ChangeOutcome::Ok {
            bail!("Failed to instrument rva {:#x}: {:?}", result.rva, result.result);
        }
        debug!("Instrumented rva {:#x} as patch #{}", result.rva, result.id);
    }

    let sink = Arc::new(Mutex::new(DemoSink {
        analyzer: Analyzer::new(options.overhead),
        trace: options.record.then(TraceData::new),
    }));
    let poller = Poller::start(Arc::clone(&collector), Arc::clone(&sink), config.drain_interval);

    // SAFETY: OUTER_RVA starts a complete System V function taking nothing
    // and returning an int; its patch keeps that ABI
    let outer: extern "C" fn() -> u32 = unsafe { std::mem::transmute(page.as_ptr().add(OUTER_RVA as usize)) };

    let calls = options.calls;
    let checksum: u64 = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..options.threads.max(1))
            .map(|_| scope.spawn(move || (0..calls).map(|_| u64::from(std::hint::black_box(outer()))).sum::<u64>()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap_or_default()).sum()
    });

    poller.stop();
    let patches = manager.query(DEMO_MODULE);
    manager.revert(DEMO_MODULE, &[LEAF_RVA, OUTER_RVA]);
    tracker.unload(mapping_id);
    drop(manager);

    let expected = u64::from(LEAF_RESULT) * options.threads.max(1) as u64 * calls as u64;
    if checksum != expected {
        bail!("Instrumented code returned {checksum}, expected {expected}");
    }

    let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
    let analyzer = std::mem::take(&mut sink.analyzer);
    let trace = sink.trace.take();
    info!("Demo finished: {} records from {} threads", analyzer.records_accepted(), analyzer.thread_ids().count());

    Ok(DemoOutcome { analyzer, names, patches, trace })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mprof_common::PatchStatus;

    #[test]
    fn test_outer_calls_reach_leaf() {
        let code = outer_code();

        assert_eq!(code.len(), 0x13);
        // call at +4 lands on LEAF_RVA
        let rel = i32::from_le_bytes([code[5], code[6], code[7], code[8]]);
        assert_eq!(i64::from(OUTER_RVA) + 9 + i64::from(rel), i64::from(LEAF_RVA));
        let rel = i32::from_le_bytes([code[10], code[11], code[12], code[13]]);
        assert_eq!(i64::from(OUTER_RVA) + 14 + i64::from(rel), i64::from(LEAF_RVA));
    }

    #[test]
    fn test_demo_collects_nested_calls() {
        let options = DemoOptions { threads: 2, calls: 100, record: true, ..DemoOptions::default() };

        let outcome = run_demo(&options).unwrap();

        assert!(outcome.patches.iter().all(|p| p.state == PatchStatus::Active));
        let by_name: HashMap<&str, usize> = outcome.names.iter().map(|(a, n)| (n.as_str(), *a)).collect();
        let outer = by_name["demo::outer"];
        let leaf = by_name["demo::leaf"];

        let merged = outcome.analyzer.merged();
        assert_eq!(merged.find(&[outer]).unwrap().statistics.times_called, 200);
        assert_eq!(merged.find(&[outer, leaf]).unwrap().statistics.times_called, 400);
        assert!(merged.find(&[leaf]).is_none());
        assert_eq!(outcome.analyzer.thread_ids().count(), 2);

        let trace = outcome.trace.unwrap();
        assert_eq!(trace.record_count(), 1200);
    }

    #[test]
    fn test_demo_with_trace_limit() {
        let options = DemoOptions { threads: 1, calls: 500, trace_limit: 64, ..DemoOptions::default() };

        let outcome = run_demo(&options).unwrap();

        let merged = outcome.analyzer.merged();
        assert_eq!(merged.totals().values().map(|s| s.times_called).sum::<u64>(), 1500);
    }
}
