// mcpspy-common/src/table.rs
//
// Userland stream reassembly engine: the same start/append/emit/drop state
// machine the BPF programs run over their LRU map, for ingestion paths that
// live in process (the preload shim) and for exercising the machine directly.
//
// Capacity matches the kernel map: 256 streams of 64KB, least-recently
// touched evicted first. There is no time-based sweep; `last_update_ns` is
// kept for external tooling only.

use std::collections::HashMap;

use crate::json;
use crate::{StreamKey, StreamState, MAX_BUF, MAX_STREAMS};

/// What one fragment did to the table.
#[derive(Debug)]
pub enum FragmentOutcome {
    /// Classifier rejected the fragment and no stream existed. The common case.
    Ignored,
    /// Fragment absorbed; stream still open.
    Buffered,
    /// Brackets balanced: the stream's entire accumulation, removed from the
    /// table. At most one of these per stream lifetime.
    Completed(CompletedStream),
    /// Stream discarded without emission.
    Dropped(DropReason),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DropReason {
    /// Accumulation would have passed the 64KB window.
    Overflow,
    /// Cumulative close count overtook the open count.
    Imbalance,
}

/// A fully reassembled message ready for emission.
#[derive(Debug)]
pub struct CompletedStream {
    pub key: StreamKey,
    /// EVENT_READ or EVENT_WRITE.
    pub operation: u8,
    pub data: Vec<u8>,
}

impl CompletedStream {
    /// The bytes an event record actually carries: `min(size, MAX_BUF)`.
    pub fn event_payload(&self) -> &[u8] {
        &self.data[..self.data.len().min(MAX_BUF)]
    }
}

struct Entry {
    touched: u64,
    state: Box<StreamState>,
}

enum Update {
    Buffered,
    Drop(DropReason),
    Complete(CompletedStream),
}

pub struct StreamTable {
    capacity: usize,
    tick: u64,
    entries: HashMap<StreamKey, Entry>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STREAMS as usize)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn state(&self, key: &StreamKey) -> Option<&StreamState> {
        self.entries.get(key).map(|entry| entry.state.as_ref())
    }

    /// Feed one fragment.
    ///
    /// New keys pass through the classifier; existing streams absorb the
    /// fragment regardless of its leading bytes or direction (`operation` is
    /// fixed at creation and a mismatched later fragment still appends).
    pub fn on_fragment(
        &mut self,
        key: StreamKey,
        operation: u8,
        bytes: &[u8],
        now_ns: u64,
    ) -> FragmentOutcome {
        self.tick += 1;
        let tick = self.tick;

        let update = match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.touched = tick;
                Some(advance(&mut entry.state, key, bytes, now_ns))
            }
            None => None,
        };

        if let Some(update) = update {
            return match update {
                Update::Buffered => FragmentOutcome::Buffered,
                Update::Drop(reason) => {
                    self.entries.remove(&key);
                    FragmentOutcome::Dropped(reason)
                }
                Update::Complete(message) => {
                    self.entries.remove(&key);
                    FragmentOutcome::Completed(message)
                }
            };
        }

        if !json::looks_like_json_object(bytes) {
            return FragmentOutcome::Ignored;
        }

        let mut state = Box::new(StreamState::zeroed());
        state.reset(operation, now_ns);
        match advance(&mut state, key, bytes, now_ns) {
            Update::Drop(reason) => FragmentOutcome::Dropped(reason),
            Update::Complete(message) => FragmentOutcome::Completed(message),
            Update::Buffered => {
                if self.entries.len() >= self.capacity {
                    self.evict_one();
                }
                self.entries.insert(
                    key,
                    Entry {
                        touched: tick,
                        state,
                    },
                );
                FragmentOutcome::Buffered
            }
        }
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.touched)
            .map(|(key, _)| *key);
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(state: &mut StreamState, key: StreamKey, bytes: &[u8], now_ns: u64) -> Update {
    if state.append(bytes).is_err() {
        return Update::Drop(DropReason::Overflow);
    }
    if !state.update_brackets(bytes) {
        return Update::Drop(DropReason::Imbalance);
    }
    state.last_update_ns = now_ns;
    if state.is_complete() {
        return Update::Complete(CompletedStream {
            key,
            operation: state.operation,
            data: state.data[..state.accumulated_size as usize].to_vec(),
        });
    }
    Update::Buffered
}
