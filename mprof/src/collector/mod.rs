//! # Call Collection
//!
//! Everything between a patched function and the analyzer.
//!
//! ```text
//!   trampoline ──on_enter/on_exit──► CallsCollector (per-thread buffers)
//!                                          │ read_collected
//!                                          ▼
//!                               Poller ──► Analyzer
//! ```
//!
//! - [`timestamp`]: tick counter read by the hooks
//! - [`calls_collector`]: double-buffered per-thread recorder
//! - `calibration`: self-cost measurement of one instrumented call
//! - [`poller`]: periodic drain into an analyzer

pub mod calls_collector;
pub mod poller;
pub mod timestamp;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub mod calibration;

pub use calls_collector::{CallsCollector, CollectorConfig, DEFAULT_DRAIN_INTERVAL};
pub use poller::{ChunkSink, Poller};

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub use calibration::{calibrate, DEFAULT_ITERATIONS};

use crate::domain::ThreadId;

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
pub const DEFAULT_ITERATIONS: usize = 10_000;

/// Overhead calibration needs code generation, which this target lacks.
///
/// # Errors
/// Always returns [`PatchError::Unsupported`](crate::domain::PatchError::Unsupported)
#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
pub fn calibrate(_iterations: usize) -> Result<crate::domain::Overhead, crate::domain::PatchError> {
    Err(crate::domain::PatchError::Unsupported)
}

/// Kernel id of the calling thread.
#[cfg(target_os = "linux")]
#[must_use]
pub fn current_thread_id() -> ThreadId {
    // SAFETY: gettid has no preconditions
    #[allow(unsafe_code)]
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    ThreadId(u64::try_from(tid).unwrap_or_default())
}

/// Process-unique id of the calling thread.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn current_thread_id() -> ThreadId {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ThreadId(ID.with(|id| *id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_differ_between_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();

        assert_eq!(here, current_thread_id());
        assert_ne!(here, there);
    }
}
