//! # Shared Value Types (Patched Code ↔ Recorder ↔ Protocol Layer)
//!
//! Plain data exchanged between the code injected into a profiled process, the
//! calls collector that records it, and whatever protocol layer ships results
//! out of the process. All types use `#[repr(C)]` so they can be written from
//! machine-code stubs and copied across process boundaries verbatim.
//!
//! ## Key Types
//!
//! - [`CallRecord`] - one enter/exit event as appended by the trampolines
//! - [`FunctionStatistics`] - additive per-function timing counters
//! - [`PatchState`] / [`PatchStatus`] - public view of an instrumented function
//! - [`PatchChangeResult`] / [`ChangeOutcome`] - outcome of an apply/revert request
//!
//! Enable the `serde` feature to derive `Serialize`/`Deserialize` on all of them.

#![no_std]

use core::ops::AddAssign;

// ============================================================================
// Constants
// ============================================================================

/// Callee value marking an exit record.
///
/// An exit always closes the most recently entered call that is still open on
/// the same thread, so it carries no address of its own.
pub const EXIT_CALLEE: usize = 0;

// ============================================================================
// Trace Records
// ============================================================================

/// A single timestamped event captured by an instrumented function.
///
/// **Memory Layout**: `#[repr(C)]`, 16 bytes on 64-bit targets. The trampolines
/// never write these directly; they pass the values to the collector which
/// appends them to the calling thread's active buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallRecord {
    /// Raw tick counter value at the moment of entry or exit
    pub timestamp: u64,
    /// Address of the entered function, or [`EXIT_CALLEE`] for an exit
    pub callee: usize,
}

impl CallRecord {
    #[must_use]
    pub const fn enter(timestamp: u64, callee: usize) -> Self {
        Self { timestamp, callee }
    }

    #[must_use]
    pub const fn exit(timestamp: u64) -> Self {
        Self { timestamp, callee: EXIT_CALLEE }
    }

    #[must_use]
    pub const fn is_exit(&self) -> bool {
        self.callee == EXIT_CALLEE
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Timing counters of one function (or of one caller → callee edge).
///
/// Times are signed tick counts: overhead correction is subtracted from the
/// observed durations and may push very short calls below zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionStatistics {
    pub times_called: u64,
    /// Deepest recursion level observed (0 = never re-entered)
    pub max_reentrance: u32,
    pub inclusive_time: i64,
    pub exclusive_time: i64,
    pub max_call_time: i64,
}

impl FunctionStatistics {
    /// Account one completed call observed at recursion `level`.
    ///
    /// Inclusive time is only taken from the outermost activation so that a
    /// recursive function does not count its own nested time twice.
    pub fn add_call(&mut self, level: u32, inclusive_time: i64, exclusive_time: i64) {
        self.times_called += 1;
        if level > self.max_reentrance {
            self.max_reentrance = level;
        }
        if level == 0 {
            self.inclusive_time += inclusive_time;
        }
        self.exclusive_time += exclusive_time;
        if inclusive_time > self.max_call_time {
            self.max_call_time = inclusive_time;
        }
    }
}

impl AddAssign<&FunctionStatistics> for FunctionStatistics {
    fn add_assign(&mut self, rhs: &FunctionStatistics) {
        self.times_called += rhs.times_called;
        if rhs.max_reentrance > self.max_reentrance {
            self.max_reentrance = rhs.max_reentrance;
        }
        self.inclusive_time += rhs.inclusive_time;
        self.exclusive_time += rhs.exclusive_time;
        if rhs.max_call_time > self.max_call_time {
            self.max_call_time = rhs.max_call_time;
        }
    }
}

// ============================================================================
// Patch Reporting
// ============================================================================

/// Public state of an instrumented function.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PatchStatus {
    /// Requested active, but the module is not mapped right now
    Pending,
    Active,
    Dormant,
    /// Instantiation failed; terminal for the lifetime of the manager
    UnrecoverableError,
    /// A backing patch exists but refused to activate
    ActivationError,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PatchState {
    pub id: u32,
    pub rva: u32,
    pub size: u32,
    pub state: PatchStatus,
}

/// Outcome of a single target in an apply/revert batch.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ChangeOutcome {
    Ok,
    Unchanged,
    ActivationError,
    UnrecoverableError,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PatchChangeResult {
    /// Record id, or 0 when the request did not refer to a known record
    pub id: u32,
    pub rva: u32,
    pub size: u32,
    pub result: ChangeOutcome,
}
