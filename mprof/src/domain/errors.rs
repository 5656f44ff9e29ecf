//! Structured error types for mprof
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

/// Reasons a jumper refuses to be installed at a target.
///
/// All of them are final for that one attempt: retrying the same target
/// without changing its bytes fails the same way.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumperError {
    #[error("Leading instruction at {0:#x} is a relative branch; relocating it is currently prohibited")]
    CurrentlyProhibited(usize),

    #[error("Leading instruction at {0:#x} is shorter than a short jump")]
    LeadingTooShort(usize),

    #[error("Padding before {0:#x} is not uniformly filled")]
    PaddingInsufficient(usize),
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to map {size} bytes of executable memory: {source}")]
    MapFailed { size: usize, source: std::io::Error },

    #[error("Failed to change protection of {start:#x}..{end:#x}: {source}")]
    ProtectFailed { start: usize, end: usize, source: std::io::Error },

    #[error("No free gap within reach of {start:#x}..{end:#x}")]
    OutOfReach { start: usize, end: usize },

    #[error("Allocation of {requested} bytes exceeds block size {block_size}")]
    TooLarge { requested: usize, block_size: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    Jumper(#[from] JumperError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Failed to decode instruction at {0:#x}")]
    Undecodable(usize),

    #[error("Cannot relocate instruction at {address:#x}: {reason}")]
    Untranslatable { address: usize, reason: &'static str },

    #[error("Displacement from {from:#x} to {to:#x} does not fit in 32 bits")]
    OutOfRange { from: usize, to: usize },

    #[error("Instrumentation is not supported on this platform")]
    Unsupported,
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Invalid trace data: {0}")]
    InvalidTraceData(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
