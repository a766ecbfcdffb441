//! Per-source accumulation of retrieved bytes and the decode-level
//! staircase used while a frame is still arriving.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Payloads received below `below_fraction` of the total are decoded at
/// `level`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodeLevelStep {
    pub below_fraction: f64,
    pub level: u8,
}

/// Maps a completion fraction to a subresolution level. Steps are checked
/// in order; past the last one the level is 0 (full resolution).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeLevelStaircase {
    steps: Vec<DecodeLevelStep>,
}

impl DecodeLevelStaircase {
    pub fn new(steps: Vec<DecodeLevelStep>) -> Self {
        Self { steps }
    }

    pub fn level_for(&self, fraction: f64) -> u8 {
        self.steps
            .iter()
            .find(|step| fraction < step.below_fraction)
            .map_or(0, |step| step.level)
    }

    pub fn coarsest(&self) -> u8 {
        self.steps.iter().map(|step| step.level).max().unwrap_or(0)
    }
}

/// Bytes accumulated for one source. The buffer only grows and a learned
/// total is never lowered.
#[derive(Debug, Default)]
pub struct StreamingState {
    total_bytes: Option<u64>,
    bytes_fetched: u64,
    ranges_fetched: u32,
    buffer: Vec<u8>,
}

impl StreamingState {
    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched
    }

    pub fn ranges_fetched(&self) -> u32 {
        self.ranges_fetched
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Append a chunk of a streamed body.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        self.bytes_fetched += bytes.len() as u64;
    }

    /// Append the body of one range response.
    pub fn append_range(&mut self, bytes: &[u8]) {
        self.append(bytes);
        self.ranges_fetched += 1;
    }

    /// Record a total length from a definitive response header.
    pub fn learn_total(&mut self, total: u64) {
        if self.total_bytes.is_none_or(|known| total > known) {
            self.total_bytes = Some(total);
        }
    }

    /// Fraction of the known total received so far, clamped to 1.
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes
            .filter(|&total| total > 0)
            .map(|total| (self.bytes_fetched as f64 / total as f64).min(1.0))
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| self.bytes_fetched >= total)
    }
}

/// Shared handle to one source's state. Entries for different sources
/// never contend.
pub type StreamingHandle = Arc<Mutex<StreamingState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingSnapshot {
    pub total_bytes: Option<u64>,
    pub bytes_fetched: u64,
    pub ranges_fetched: u32,
    pub buffered: usize,
}

/// Injectable store of streaming states keyed by source uri.
#[derive(Debug, Default, Clone)]
pub struct StreamingStore {
    entries: Arc<Mutex<HashMap<String, StreamingHandle>>>,
}

impl StreamingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accumulating for `uri`, discarding any earlier state.
    pub fn begin(&self, uri: &str) -> StreamingHandle {
        let handle = StreamingHandle::default();
        self.entries
            .lock()
            .insert(uri.to_string(), Arc::clone(&handle));
        handle
    }

    /// Like [`begin`](Self::begin), but the entry is removed again when the
    /// returned lease is dropped.
    pub fn lease(&self, uri: &str) -> StoreLease {
        StoreLease {
            store: self.clone(),
            uri: uri.to_string(),
            handle: self.begin(uri),
        }
    }

    pub fn get(&self, uri: &str) -> Option<StreamingHandle> {
        self.entries.lock().get(uri).cloned()
    }

    pub fn snapshot(&self, uri: &str) -> Option<StreamingSnapshot> {
        let handle = self.get(uri)?;
        let state = handle.lock();
        Some(StreamingSnapshot {
            total_bytes: state.total_bytes,
            bytes_fetched: state.bytes_fetched,
            ranges_fetched: state.ranges_fetched,
            buffered: state.buffer.len(),
        })
    }

    pub fn remove(&self, uri: &str) -> bool {
        self.entries.lock().remove(uri).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// One retrieval's claim on a [`StreamingStore`] entry.
#[derive(Debug)]
pub struct StoreLease {
    store: StreamingStore,
    uri: String,
    handle: StreamingHandle,
}

impl StoreLease {
    pub fn lock(&self) -> MutexGuard<'_, StreamingState> {
        self.handle.lock()
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        let mut entries = self.store.entries.lock();
        // A later retrieval of the same uri owns its own entry.
        if entries.get(&self.uri).is_some_and(|current| Arc::ptr_eq(current, &self.handle)) {
            entries.remove(&self.uri);
        }
    }
}
