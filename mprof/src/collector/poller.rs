//! Background thread draining a collector into a sink.

use super::calls_collector::CallsCollector;
use crate::analysis::Analyzer;
use crate::domain::ThreadId;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, warn};
use mprof_common::CallRecord;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Consumer of drained chunks.
pub trait ChunkSink: Send + 'static {
    fn accept_chunk(&mut self, thread_id: ThreadId, records: &[CallRecord]);
}

impl ChunkSink for Analyzer {
    fn accept_chunk(&mut self, thread_id: ThreadId, records: &[CallRecord]) {
        self.accept(thread_id, records);
    }
}

fn drain<S: ChunkSink>(collector: &CallsCollector, sink: &Mutex<S>) {
    let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
    collector.read_collected(&mut |thread_id, records| sink.accept_chunk(thread_id, records));
}

/// Drains `collector` into a sink every `interval` until stopped or dropped.
///
/// One last drain runs on stop, so nothing recorded before [`Poller::stop`]
/// returns is lost.
pub struct Poller {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Poller {
    #[must_use]
    pub fn start<S: ChunkSink>(collector: Arc<CallsCollector>, sink: Arc<Mutex<S>>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let worker = std::thread::spawn(move || {
            debug!("Poller started ({interval:?})");
            loop {
                select! {
                    recv(ticker) -> _ => drain(&collector, &sink),
                    recv(stop_rx) -> _ => break,
                }
            }
            drain(&collector, &sink);
            debug!("Poller stopped");
        });

        Self { stop: Some(stop_tx), worker: Some(worker) }
    }

    /// Stop polling after a final drain.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the worker with a disconnect
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Poller thread panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
