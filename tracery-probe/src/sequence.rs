//! The process-global sequence buffer.
//!
//! Sequence mode records the ordered stream of witnessed packed ids. Method
//! entries intern their signature and write a two-slot `NEW_METHOD` record;
//! everything else is one slot. The buffer flushes when it cannot hold the
//! next record, at test boundaries, and at shutdown. Interned indices are
//! never recycled; only the not-yet-shipped bindings travel with each flush.
//!
//! Not thread-safe by contract: callers hold the probe's sequence lock.

use std::collections::HashMap;

use tracery_wire::{marker, Payload, SequenceBatch, SignatureBinding};

use crate::sink::PayloadSink;

/// Fixed buffer capacity, in slots.
pub const SEQUENCE_CAPACITY: usize = 16_384;

pub struct SequenceState {
    buffer: Vec<u32>,
    indices: HashMap<String, i32>,
    next_index: i32,
    pending: Vec<SignatureBinding>,
    flushes: u64,
}

impl Default for SequenceState {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceState {
    pub fn new() -> Self {
        SequenceState {
            buffer: Vec::with_capacity(SEQUENCE_CAPACITY),
            indices: HashMap::new(),
            next_index: 1,
            pending: Vec::new(),
            flushes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.pending.is_empty()
    }

    /// How many times the buffer has been shipped.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Record entry into a method: `NEW_METHOD` marker plus the signature's
    /// interned index, two slots.
    pub fn enter_method(&mut self, signature: &str, object_count: u16, sink: &dyn PayloadSink) {
        if self.buffer.len() + 2 > SEQUENCE_CAPACITY {
            self.flush(sink);
        }
        let index = self.intern(signature, object_count);
        self.buffer.push(marker::NEW_METHOD);
        self.buffer.push(index as u32);
    }

    /// Record one witnessed entity.
    pub fn append(&mut self, packed: u32, sink: &dyn PayloadSink) {
        if self.buffer.len() >= SEQUENCE_CAPACITY {
            self.flush(sink);
        }
        self.buffer.push(packed);
    }

    /// Record an exceptional exit.
    pub fn append_exit(&mut self, sink: &dyn PayloadSink) {
        self.append(marker::BRANCH_EXIT, sink);
    }

    /// Close out one test: boundary marker, then ship everything.
    pub fn end_test(&mut self, sink: &dyn PayloadSink) {
        self.append(marker::NEW_TEST, sink);
        self.flush(sink);
    }

    /// Ship the buffered entries together with any bindings interned since
    /// the previous flush. The signature map itself persists.
    pub fn flush(&mut self, sink: &dyn PayloadSink) {
        if self.buffer.is_empty() && self.pending.is_empty() {
            return;
        }
        let batch = SequenceBatch {
            bindings: std::mem::take(&mut self.pending),
            entries: std::mem::take(&mut self.buffer),
        };
        self.buffer.reserve(SEQUENCE_CAPACITY);
        self.flushes += 1;
        sink.ship(&Payload::Sequence(batch));
    }

    fn intern(&mut self, signature: &str, object_count: u16) -> i32 {
        if let Some(&index) = self.indices.get(signature) {
            return index;
        }
        let index = self.next_index;
        assert!(index < i32::MAX, "signature index overflow");
        self.next_index += 1;
        self.indices.insert(signature.to_owned(), index);
        self.pending.push(SignatureBinding {
            object_count,
            index,
            signature: signature.to_owned(),
        });
        index
    }
}
