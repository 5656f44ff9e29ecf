//! # Calls Collector
//!
//! Per-thread double-buffered recording of enter/exit events.
//!
//! ```text
//!   producer thread                         drain (one consumer)
//!   ───────────────                         ────────────────────
//!   track ─► lock(active) push unlock       lock(threads) snapshot
//!                                           per thread:
//!                                             lock(inactive)
//!                                             lock(active) swap unlock
//!                                             acceptor(thread, inactive)
//!                                             clear
//! ```
//!
//! Producers only ever contend with the drain for the duration of one
//! pointer swap. Each collector owns its thread registry; the calling
//! thread finds its own buffer through a thread-local slot keyed by the
//! collector's id. A thread that has exited leaves the registry at the
//! first drain that finds its buffer empty.

#![allow(unsafe_code)] // return addresses are read off the traced stack

use super::current_thread_id;
use crate::domain::ThreadId;
#[cfg(target_arch = "x86_64")]
use crate::patcher::Interceptor;
use mprof_common::CallRecord;
use std::cell::RefCell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Default period between drains
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Records a thread may buffer before it blocks until the next drain
    /// (0 = unlimited)
    pub trace_limit: usize,
    pub drain_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { trace_limit: 0, drain_interval: DEFAULT_DRAIN_INTERVAL }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// PER-THREAD STATE
// =============================================================================

struct ThreadTrace {
    thread_id: ThreadId,
    trace_limit: usize,
    active: Mutex<Vec<CallRecord>>,
    inactive: Mutex<Vec<CallRecord>>,
    drained: Condvar,
}

impl ThreadTrace {
    fn new(thread_id: ThreadId, trace_limit: usize) -> Self {
        Self {
            thread_id,
            trace_limit,
            active: Mutex::new(Vec::new()),
            inactive: Mutex::new(Vec::new()),
            drained: Condvar::new(),
        }
    }

    fn track(&self, record: CallRecord) {
        let mut active = lock(&self.active);

        while self.trace_limit != 0 && active.len() >= self.trace_limit {
            active = self.drained.wait(active).unwrap_or_else(PoisonError::into_inner);
        }
        active.push(record);
    }

    fn read_collected(&self, acceptor: &mut dyn FnMut(ThreadId, &[CallRecord])) {
        let mut inactive = lock(&self.inactive);

        std::mem::swap(&mut *lock(&self.active), &mut *inactive);
        self.drained.notify_all();
        if !inactive.is_empty() {
            acceptor(self.thread_id, &inactive);
        }
        inactive.clear();
    }

    fn is_empty(&self) -> bool {
        lock(&self.active).is_empty()
    }
}

#[derive(Clone, Copy)]
struct ReturnEntry {
    stack_ptr: usize,
    return_address: usize,
}

/// Bottom of every return stack; never popped by a well-formed exit.
const RETURN_STACK_SENTINEL: ReturnEntry = ReturnEntry { stack_ptr: usize::MAX, return_address: 0 };

struct ThreadSlot {
    collector_id: u64,
    trace: Arc<ThreadTrace>,
    return_stack: Vec<ReturnEntry>,
}

thread_local! {
    static SLOTS: RefCell<Vec<ThreadSlot>> = const { RefCell::new(Vec::new()) };
}

static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// COLLECTOR
// =============================================================================

/// Recorder of call events from any number of threads.
pub struct CallsCollector {
    id: u64,
    config: CollectorConfig,
    threads: Mutex<Vec<Arc<ThreadTrace>>>,
    drain: Mutex<()>,
}

impl CallsCollector {
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            id: NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed),
            config,
            threads: Mutex::new(Vec::new()),
            drain: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> CollectorConfig {
        self.config
    }

    /// Threads registered with this collector: live ones that have recorded
    /// anything, and exited ones whose records are not drained yet
    #[must_use]
    pub fn thread_count(&self) -> usize {
        lock(&self.threads).len()
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut ThreadSlot) -> R) -> R {
        SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let index = match slots.iter().position(|s| s.collector_id == self.id) {
                Some(index) => index,
                None => {
                    let trace = Arc::new(ThreadTrace::new(current_thread_id(), self.config.trace_limit));
                    lock(&self.threads).push(Arc::clone(&trace));
                    slots.push(ThreadSlot {
                        collector_id: self.id,
                        trace,
                        return_stack: vec![RETURN_STACK_SENTINEL],
                    });
                    slots.len() - 1
                }
            };
            f(&mut slots[index])
        })
    }

    /// Append one record to the calling thread's buffer. `callee == 0`
    /// records an exit.
    pub fn track(&self, timestamp: u64, callee: usize) {
        self.with_slot(|slot| slot.trace.track(CallRecord { timestamp, callee }));
    }

    /// Record entry into `callee`, remembering the return address stored at
    /// `stack_ptr`.
    ///
    /// An entry with the same stack slot as the innermost open call is a
    /// tail call: that call is closed first.
    ///
    /// # Safety
    /// `stack_ptr` must point to the readable return address slot of the
    /// call being entered.
    pub unsafe fn enter(&self, stack_ptr: *const *const c_void, timestamp: u64, callee: usize) {
        self.with_slot(|slot| {
            let stack_ptr = stack_ptr as usize;
            let top = slot.return_stack.last().copied().unwrap_or(RETURN_STACK_SENTINEL);

            if top.stack_ptr == stack_ptr {
                slot.trace.track(CallRecord::exit(timestamp));
            } else {
                // SAFETY: forwarded from the caller
                let return_address = unsafe { *(stack_ptr as *const *const c_void) } as usize;
                slot.return_stack.push(ReturnEntry { stack_ptr, return_address });
            }
            slot.trace.track(CallRecord::enter(timestamp, callee));
        });
    }

    /// Record exit from the call(s) at or below `stack_ptr` and return the
    /// caller's original return address.
    ///
    /// Calls abandoned without an exit (unwinding, `longjmp`) are closed at
    /// the same timestamp.
    pub fn exit(&self, stack_ptr: *const *const c_void, timestamp: u64) -> usize {
        let stack_ptr = stack_ptr as usize;

        self.with_slot(|slot| {
            let mut return_address = 0;

            while slot.return_stack.len() > 1 {
                if let Some(entry) = slot.return_stack.pop() {
                    return_address = entry.return_address;
                }
                slot.trace.track(CallRecord::exit(timestamp));
                if slot.return_stack.last().map_or(true, |top| top.stack_ptr > stack_ptr) {
                    break;
                }
            }
            return_address
        })
    }

    /// Hand every thread's buffered records to `acceptor` and clear them.
    ///
    /// Threads with nothing recorded since the last drain are skipped.
    /// Drains are serialized, so chunks of one thread reach acceptors in
    /// recording order.
    pub fn read_collected(&self, acceptor: &mut dyn FnMut(ThreadId, &[CallRecord])) {
        let _drain = lock(&self.drain);
        let threads: Vec<Arc<ThreadTrace>> = lock(&self.threads).clone();

        for thread in &threads {
            thread.read_collected(acceptor);
        }
        drop(threads);

        // Only the registry holds traces of exited threads, whose slots are gone
        lock(&self.threads).retain(|trace| Arc::strong_count(trace) > 1 || !trace.is_empty());
    }
}

impl Default for CallsCollector {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

impl Drop for CallsCollector {
    fn drop(&mut self) {
        let id = self.id;
        // Other threads' slots are released when those threads exit
        let _ = SLOTS.try_with(|slots| slots.borrow_mut().retain(|s| s.collector_id != id));
    }
}

#[cfg(target_arch = "x86_64")]
impl Interceptor for CallsCollector {
    fn on_enter(&self, stack_ptr: *const *const c_void, timestamp: u64, callee: *const c_void) {
        // SAFETY: trampolines pass the address of the live return address slot
        unsafe { self.enter(stack_ptr, timestamp, callee as usize) };
    }

    fn on_exit(&self, stack_ptr: *const *const c_void, timestamp: u64) -> *const c_void {
        self.exit(stack_ptr, timestamp) as *const c_void
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn drain(collector: &CallsCollector) -> Vec<(ThreadId, Vec<CallRecord>)> {
        let mut chunks = Vec::new();
        collector.read_collected(&mut |thread, records| chunks.push((thread, records.to_vec())));
        chunks
    }

    #[test]
    fn test_records_are_drained_once() {
        let collector = CallsCollector::default();

        collector.track(100, 0x1234);
        collector.track(110, 0);

        let chunks = drain(&collector);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, current_thread_id());
        assert_eq!(chunks[0].1, vec![CallRecord::enter(100, 0x1234), CallRecord::exit(110)]);
        assert!(drain(&collector).is_empty());
    }

    #[test]
    fn test_threads_get_separate_buffers() {
        let collector = Arc::new(CallsCollector::default());

        let workers: Vec<_> = (0..3u64)
            .map(|i| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for n in 0..10 {
                        collector.track(n, 0x1000 + i as usize);
                        collector.track(n + 1, 0);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(collector.thread_count(), 3);
        let chunks = drain(&collector);
        assert_eq!(chunks.len(), 3);
        for (_, records) in &chunks {
            assert_eq!(records.len(), 20);
            let callee = records[0].callee;
            assert!(records.iter().step_by(2).all(|r| r.callee == callee));
        }
    }

    #[test]
    fn test_exited_threads_leave_registry_after_drain() {
        let collector = Arc::new(CallsCollector::default());
        collector.track(1, 0x1);

        let worker = {
            let collector = Arc::clone(&collector);
            std::thread::spawn(move || {
                collector.track(2, 0x2);
                collector.track(3, 0);
            })
        };
        worker.join().unwrap();
        assert_eq!(collector.thread_count(), 2);

        let chunks = drain(&collector);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().any(|(_, records)| records.len() == 2));
        // the live thread stays registered with an empty buffer
        assert_eq!(collector.thread_count(), 1);

        collector.track(4, 0x1);
        assert_eq!(drain(&collector), vec![(current_thread_id(), vec![CallRecord::enter(4, 0x1)])]);
    }

    #[test]
    fn test_collectors_do_not_share_thread_buffers() {
        let a = CallsCollector::default();
        let b = CallsCollector::default();

        a.track(1, 0xA);
        b.track(2, 0xB);

        assert_eq!(drain(&a)[0].1, vec![CallRecord::enter(1, 0xA)]);
        assert_eq!(drain(&b)[0].1, vec![CallRecord::enter(2, 0xB)]);
    }

    #[test]
    fn test_enter_exit_returns_saved_address() {
        let collector = CallsCollector::default();
        let outer_slot: *const c_void = 0x4000_1000 as *const c_void;
        let inner_slot: *const c_void = 0x4000_2000 as *const c_void;
        let stack = [inner_slot, outer_slot];
        let inner_ptr = &stack[0] as *const *const c_void;
        let outer_ptr = &stack[1] as *const *const c_void;

        unsafe {
            collector.enter(outer_ptr, 10, 0x100);
            collector.enter(inner_ptr, 20, 0x200);
        }
        assert_eq!(collector.exit(inner_ptr, 30), 0x4000_2000);
        assert_eq!(collector.exit(outer_ptr, 40), 0x4000_1000);

        assert_eq!(
            drain(&collector)[0].1,
            vec![
                CallRecord::enter(10, 0x100),
                CallRecord::enter(20, 0x200),
                CallRecord::exit(30),
                CallRecord::exit(40),
            ]
        );
    }

    #[test]
    fn test_tail_call_closes_previous_call() {
        let collector = CallsCollector::default();
        let stack = [0x7777 as *const c_void];
        let slot = stack.as_ptr();

        unsafe {
            collector.enter(slot, 10, 0x100);
            collector.enter(slot, 15, 0x200);
        }
        assert_eq!(collector.exit(slot, 30), 0x7777);

        assert_eq!(
            drain(&collector)[0].1,
            vec![
                CallRecord::enter(10, 0x100),
                CallRecord::exit(15),
                CallRecord::enter(15, 0x200),
                CallRecord::exit(30),
            ]
        );
    }

    #[test]
    fn test_exit_unwinds_abandoned_frames() {
        let collector = CallsCollector::default();
        let stack = [0x1 as *const c_void, 0x2 as *const c_void, 0x3 as *const c_void];
        let base = stack.as_ptr();

        unsafe {
            collector.enter(base.add(2), 1, 0x100);
            collector.enter(base.add(1), 2, 0x200);
            collector.enter(base, 3, 0x300);
        }
        // Exit observed for the outermost call only
        assert_eq!(collector.exit(unsafe { base.add(2) }, 9), 0x3);

        let records = &drain(&collector)[0].1;
        assert_eq!(records.iter().filter(|r| r.is_exit()).count(), 3);
        assert!(records[3..].iter().all(|r| *r == CallRecord::exit(9)));
    }

    #[test]
    fn test_trace_limit_blocks_until_drained() {
        let collector = Arc::new(CallsCollector::new(CollectorConfig { trace_limit: 2, ..Default::default() }));
        let finished = Arc::new(AtomicBool::new(false));

        let producer = {
            let collector = Arc::clone(&collector);
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                for n in 0..4 {
                    collector.track(n, 0x10);
                }
                finished.store(true, Ordering::SeqCst);
            })
        };

        let mut total = 0;
        while total < 4 {
            collector.read_collected(&mut |_, records| {
                assert!(records.len() <= 2);
                total += records.len();
            });
            std::thread::sleep(Duration::from_millis(1));
        }
        producer.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }
}
