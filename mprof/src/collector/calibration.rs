//! Overhead calibration.
//!
//! Instruments a trivial function in a private page with a private
//! collector, calls it repeatedly and compares what the hooks recorded
//! with what the caller observed:
//!
//! ```text
//!   t0 ─┬─ trampoline entry ─ enter_ts ── original ── exit_ts ─ return ─┬─ t1
//!       │                     └────────── inner ────────────┘           │
//!       └──────────────────────────── total ────────────────────────────┘
//!   outer = total - inner
//! ```
//!
//! Minimums over all iterations are taken, so preemption during a single
//! iteration does not skew the result.

#![allow(unsafe_code)] // generates and calls machine code

use super::calls_collector::{CallsCollector, CollectorConfig};
use super::timestamp;
use crate::domain::{Overhead, PatchError};
use crate::memory::native::{MappedPages, ReachableAllocator};
use crate::memory::{Protection, REL32_DISTANCE_ORDER};
use crate::patcher::{FunctionPatch, InterceptorHandle, Patch};
use log::debug;
use mprof_common::CallRecord;
use std::sync::Arc;

/// Default number of calls measured
pub const DEFAULT_ITERATIONS: usize = 10_000;

/// `xor eax, eax; ret`, preceded by int3 padding for the jumper
const PROBE_CODE: [u8; 3] = [0x31, 0xC0, 0xC3];
const PROBE_OFFSET: usize = 0x100;
const PROBE_FILLER: u8 = 0xCC;

const TRAMPOLINE_BLOCK_SIZE: usize = 0x10000;

/// Measure the self-cost of one instrumented call on this machine.
///
/// # Errors
/// Returns an error if the probe page or its trampoline cannot be set up.
pub fn calibrate(iterations: usize) -> Result<Overhead, PatchError> {
    let iterations = iterations.max(1);
    let rwx = Protection::READ | Protection::WRITE | Protection::EXECUTE;
    let page = MappedPages::new(PROBE_OFFSET + PROBE_CODE.len(), rwx)?;

    // SAFETY: the page is writable and PROBE_OFFSET + code fits in it
    unsafe {
        std::ptr::write_bytes(page.as_ptr(), PROBE_FILLER, page.len());
        std::ptr::copy_nonoverlapping(PROBE_CODE.as_ptr(), page.as_ptr().add(PROBE_OFFSET), PROBE_CODE.len());
    }
    // SAFETY: offset lies within the page
    let target = unsafe { page.as_ptr().add(PROBE_OFFSET) };

    let collector = Arc::new(CallsCollector::new(CollectorConfig::default()));
    let allocator = ReachableAllocator::new(page.range(), REL32_DISTANCE_ORDER, TRAMPOLINE_BLOCK_SIZE);
    let interceptor = InterceptorHandle::new(Arc::clone(&collector));

    // SAFETY: the target is a complete function in memory owned here
    let mut patch = unsafe { FunctionPatch::new(target, target.cast_const().cast(), &interceptor, &allocator) }?;
    patch.activate()?;

    // SAFETY: target starts a System V function taking nothing and returning
    // an int; the jumper diverts it through a trampoline honoring that ABI
    let probe: extern "C" fn() -> u32 = unsafe { std::mem::transmute(target) };

    let mut observed = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let t0 = timestamp::read();
        std::hint::black_box(probe());
        let t1 = timestamp::read();
        observed.push(tick_delta(t0, t1));
    }

    let mut recorded = Vec::with_capacity(iterations * 2);
    collector.read_collected(&mut |_, records| recorded.extend_from_slice(records));
    patch.revert()?;

    let overhead = reduce(&observed, &recorded);
    debug!("Calibrated over {iterations} calls: {overhead}");
    Ok(overhead)
}

fn tick_delta(from: u64, to: u64) -> i64 {
    i64::try_from(to.wrapping_sub(from)).unwrap_or(i64::MAX)
}

/// Pair each caller-observed duration with the recorded enter/exit pair of
/// the same call and take minimums.
fn reduce(observed: &[i64], recorded: &[CallRecord]) -> Overhead {
    let mut inner = i64::MAX;
    let mut outer = i64::MAX;

    for (total, pair) in observed.iter().zip(recorded.chunks_exact(2)) {
        let measured = tick_delta(pair[0].timestamp, pair[1].timestamp);
        inner = inner.min(measured);
        outer = outer.min(total - measured);
    }
    if inner == i64::MAX {
        return Overhead::default();
    }
    Overhead::new(inner, outer.max(0))
}
