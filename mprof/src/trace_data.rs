//! Recorded traces on disk
//!
//! A trace file is the sequence of chunks a collector drained, in drain
//! order, so replaying it through an [`Analyzer`] reproduces the live
//! analysis exactly:
//!
//! ```json
//! [
//!   { "thread_id": 4121, "records": [ { "timestamp": 100, "callee": 4198400 },
//!                                     { "timestamp": 130, "callee": 0 } ] }
//! ]
//! ```

use crate::analysis::Analyzer;
use crate::collector::ChunkSink;
use crate::domain::{ThreadId, TraceError};
use mprof_common::CallRecord;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// One drained chunk of one thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceChunk {
    pub thread_id: ThreadId,
    pub records: Vec<CallRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceData {
    pub chunks: Vec<TraceChunk>,
}

impl TraceData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a trace from `reader`.
    ///
    /// # Errors
    /// Returns an error if the input is empty, unreadable or not a trace
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, TraceError> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        if content.trim().is_empty() {
            return Err(TraceError::InvalidTraceData("trace is empty".to_string()));
        }

        let chunks: Vec<TraceChunk> = serde_json::from_str(&content)?;
        Ok(Self { chunks })
    }

    /// Load a trace file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// # Errors
    /// Returns an error if writing fails
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), TraceError> {
        serde_json::to_writer(writer, &self.chunks)?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the file cannot be created or written
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn push(&mut self, thread_id: ThreadId, records: &[CallRecord]) {
        self.chunks.push(TraceChunk { thread_id, records: records.to_vec() });
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.chunks.iter().map(|c| c.records.len()).sum()
    }

    /// Distinct threads, in order of first appearance
    #[must_use]
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut seen = Vec::new();
        for chunk in &self.chunks {
            if !seen.contains(&chunk.thread_id) {
                seen.push(chunk.thread_id);
            }
        }
        seen
    }

    /// Feed every chunk to `analyzer` in recorded order.
    pub fn replay(&self, analyzer: &mut Analyzer) {
        for chunk in &self.chunks {
            analyzer.accept(chunk.thread_id, &chunk.records);
        }
    }
}

impl ChunkSink for TraceData {
    fn accept_chunk(&mut self, thread_id: ThreadId, records: &[CallRecord]) {
        self.push(thread_id, records);
    }
}
