//! Event listeners.
//!
//! The receive loop turns decoded packets into the calls on this trait. A
//! listener declares which streams it can consume; the dispatcher checks the
//! declarations during the handshake and rejects subjects nobody wants.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracery_wire::{BlockType, BranchType, InstMode, ObjectType};

pub mod coverage;
pub mod fingerprint;
pub mod sequence;

pub use coverage::CoverageListener;
pub use fingerprint::FingerprintListener;
pub use sequence::SequenceWriter;

/// Index of a stream within one dispatcher run (0, or 1 for the second
/// connection of a subject-that-is-a-dispatcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub usize);

/// What kind of structural entity an event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Block(BlockType),
    Branch(BranchType),
}

impl EntityKind {
    /// Recover the kind from a packed-id type tag, which is the block or
    /// branch type code depending on the stream's object type.
    pub fn from_tag(object_type: ObjectType, tag: u32) -> Option<EntityKind> {
        let code = u8::try_from(tag).ok()?;
        match object_type {
            ObjectType::Block => BlockType::from_code(code).ok().map(EntityKind::Block),
            ObjectType::Branch => BranchType::from_code(code).ok().map(EntityKind::Branch),
        }
    }

    /// Selector letter, as used in sequence records and CLI masks.
    pub fn letter(self) -> char {
        match self {
            EntityKind::Block(t) => t.letter(),
            EntityKind::Branch(t) => t.letter(),
        }
    }
}

/// In-band markers a sequence stream can carry besides real events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMarker {
    /// Exceptional method exit (`)r` in sequence text).
    MethodExit,
    /// Test boundary under a test harness (`)x` in sequence text).
    TestBoundary,
}

#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stream object types this listener can consume.
    fn accepts_object(&self, object_type: ObjectType) -> bool;

    /// Instrumentation modes this listener can consume.
    fn accepts_mode(&self, mode: InstMode) -> bool;

    async fn stream_started(&self, _stream: StreamId) -> Result<()> {
        Ok(())
    }

    async fn method_enter(&self, stream: StreamId, signature: &str, object_count: u32)
        -> Result<()>;

    async fn entity_witnessed(
        &self,
        stream: StreamId,
        signature: &str,
        kind: EntityKind,
        id: u32,
    ) -> Result<()>;

    async fn sequence_marker(&self, _stream: StreamId, _marker: SequenceMarker) -> Result<()> {
        Ok(())
    }

    /// The stream reached EOF; persist results. Called exactly once per
    /// stream.
    async fn commit(&self, stream: StreamId) -> Result<()>;
}

/// The registered listeners plus the optional delivery gate.
pub struct ListenerSet {
    listeners: Vec<Arc<dyn EventListener>>,
    /// Present in synchronized mode: serializes delivery across the two
    /// receive tasks of a subject-that-is-a-dispatcher.
    gate: Option<tokio::sync::Mutex<()>>,
}

impl ListenerSet {
    pub fn new(synchronized: bool) -> Self {
        ListenerSet {
            listeners: Vec::new(),
            gate: synchronized.then(|| tokio::sync::Mutex::new(())),
        }
    }

    pub fn register<L: EventListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Arc::new(listener));
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Handshake validation: every registered listener must want the stream.
    pub fn validate(&self, object_type: ObjectType, mode: InstMode) -> (bool, bool) {
        let object_ok = !self.is_empty()
            && self.listeners.iter().all(|l| l.accepts_object(object_type));
        let mode_ok = !self.is_empty() && self.listeners.iter().all(|l| l.accepts_mode(mode));
        (object_ok, mode_ok)
    }

    async fn locked(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        }
    }

    pub async fn stream_started(&self, stream: StreamId) -> Result<()> {
        let _gate = self.locked().await;
        let mut first_err = None;
        for listener in &self.listeners {
            if let Err(err) = listener.stream_started(stream).await {
                first_err.get_or_insert(err);
            }
        }
        opt_err(first_err)
    }

    pub async fn method_enter(
        &self,
        stream: StreamId,
        signature: &str,
        object_count: u32,
    ) -> Result<()> {
        let _gate = self.locked().await;
        let mut first_err = None;
        for listener in &self.listeners {
            if let Err(err) = listener.method_enter(stream, signature, object_count).await {
                first_err.get_or_insert(err);
            }
        }
        opt_err(first_err)
    }

    pub async fn entity_witnessed(
        &self,
        stream: StreamId,
        signature: &str,
        kind: EntityKind,
        id: u32,
    ) -> Result<()> {
        let _gate = self.locked().await;
        let mut first_err = None;
        for listener in &self.listeners {
            if let Err(err) = listener.entity_witnessed(stream, signature, kind, id).await {
                first_err.get_or_insert(err);
            }
        }
        opt_err(first_err)
    }

    pub async fn sequence_marker(&self, stream: StreamId, marker: SequenceMarker) -> Result<()> {
        let _gate = self.locked().await;
        let mut first_err = None;
        for listener in &self.listeners {
            if let Err(err) = listener.sequence_marker(stream, marker).await {
                first_err.get_or_insert(err);
            }
        }
        opt_err(first_err)
    }

    pub async fn commit(&self, stream: StreamId) -> Result<()> {
        let _gate = self.locked().await;
        let mut first_err = None;
        for listener in &self.listeners {
            if let Err(err) = listener.commit(stream).await {
                first_err.get_or_insert(err);
            }
        }
        opt_err(first_err)
    }
}

fn opt_err(first: Option<anyhow::Error>) -> Result<()> {
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every delivered event as a line of text.
    #[derive(Default)]
    pub struct RecordingListener {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.events.lock().unwrap())
        }

        fn push(&self, line: String) {
            self.events.lock().unwrap().push(line);
        }
    }

    #[async_trait]
    impl EventListener for RecordingListener {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn accepts_object(&self, _object_type: ObjectType) -> bool {
            true
        }

        fn accepts_mode(&self, _mode: InstMode) -> bool {
            true
        }

        async fn method_enter(
            &self,
            stream: StreamId,
            signature: &str,
            object_count: u32,
        ) -> Result<()> {
            self.push(format!("{} enter {signature} {object_count}", stream.0));
            Ok(())
        }

        async fn entity_witnessed(
            &self,
            stream: StreamId,
            _signature: &str,
            kind: EntityKind,
            id: u32,
        ) -> Result<()> {
            self.push(format!("{} {}{id}", stream.0, kind.letter()));
            Ok(())
        }

        async fn sequence_marker(&self, stream: StreamId, marker: SequenceMarker) -> Result<()> {
            let text = match marker {
                SequenceMarker::MethodExit => ")r",
                SequenceMarker::TestBoundary => ")x",
            };
            self.push(format!("{} {text}", stream.0));
            Ok(())
        }

        async fn commit(&self, stream: StreamId) -> Result<()> {
            self.push(format!("{} commit", stream.0));
            Ok(())
        }
    }
}
