//! Connection acceptance, handshake, and the per-stream receive loop.
//!
//! One dispatcher run serves a single subject connection (plus an optional
//! second stream when the subject is itself a dispatcher). Each stream gets
//! its own receive task; a processing strategy matched to the handshake
//! turns decoded payloads into listener events. Graceful EOF commits the
//! stream exactly once; a truncated final frame after a forced stop is
//! tolerated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracery_wire::{
    marker, DecodeContext, HandshakeReply, HandshakeRequest, InstMode, ObjectId, ObjectType,
    Payload,
};

use crate::listener::{EntityKind, ListenerSet, SequenceMarker, StreamId};
use crate::metrics::Metrics;

/// Upper bound on one frame's payload; anything larger is a protocol error.
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Shared state for the up-to-two receive tasks of one dispatcher run.
pub struct StreamControl {
    connected: [AtomicBool; 2],
    force_stop: [AtomicBool; 2],
    last_error: Mutex<[Option<String>; 2]>,
}

impl Default for StreamControl {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamControl {
    pub fn new() -> Self {
        StreamControl {
            connected: [AtomicBool::new(false), AtomicBool::new(false)],
            force_stop: [AtomicBool::new(false), AtomicBool::new(false)],
            last_error: Mutex::new([None, None]),
        }
    }

    pub fn set_connected(&self, stream: usize, connected: bool) {
        self.connected[stream].store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self, stream: usize) -> bool {
        self.connected[stream].load(Ordering::SeqCst)
    }

    /// Ask the stream's receive task to wind down at the next frame edge.
    pub fn request_stop(&self, stream: usize) {
        self.force_stop[stream].store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self, stream: usize) -> bool {
        self.force_stop[stream].load(Ordering::SeqCst)
    }

    pub fn record_error(&self, stream: usize, error: String) {
        if let Ok(mut slots) = self.last_error.lock() {
            slots[stream] = Some(error);
        }
    }

    pub fn last_error(&self, stream: usize) -> Option<String> {
        self.last_error.lock().ok().and_then(|s| s[stream].clone())
    }
}

/// The host-side event dispatcher.
pub struct Dispatcher {
    listeners: Arc<ListenerSet>,
    metrics: Arc<Metrics>,
    control: Arc<StreamControl>,
    /// Port advertised for the signal side channel; 0 picks one.
    signal_port: u16,
}

impl Dispatcher {
    pub fn new(listeners: Arc<ListenerSet>, metrics: Arc<Metrics>, signal_port: u16) -> Self {
        Dispatcher {
            listeners,
            metrics,
            control: Arc::new(StreamControl::new()),
            signal_port,
        }
    }

    pub fn control(&self) -> Arc<StreamControl> {
        self.control.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Accept one connection from `listener` and run it to completion.
    pub async fn serve_one(&self, listener: &TcpListener, stream: StreamId) -> Result<()> {
        let (socket, peer) = listener
            .accept()
            .await
            .context("accepting subject connection")?;
        info!("subject connected from {peer}");
        self.handle_connection(socket, stream).await
    }

    /// Handshake, strategy selection, receive loop, commit.
    pub async fn handle_connection(&self, mut socket: TcpStream, stream: StreamId) -> Result<()> {
        socket.set_nodelay(true).ok();

        let mut hello = [0u8; HandshakeRequest::ENCODED_LEN];
        socket
            .read_exact(&mut hello)
            .await
            .context("reading handshake")?;
        let request = {
            let mut buf: &[u8] = &hello;
            HandshakeRequest::decode(&mut buf).context("decoding handshake")?
        };
        let (object_ok, mode_ok) = self.listeners.validate(request.object_type, request.inst_mode);

        let mut verdict = BytesMut::new();
        HandshakeReply { object_ok, mode_ok }.encode(&mut verdict);
        socket
            .write_all(&verdict)
            .await
            .context("writing handshake reply")?;
        if !(object_ok && mode_ok) {
            self.metrics.inc_handshake_rejected();
            bail!(
                "handshake rejected: object_type={:?} ok={object_ok}, mode={:?} ok={mode_ok}",
                request.object_type,
                request.inst_mode
            );
        }

        // The signal side channel, when the subject asked for one.
        let _signal = if request.wants_signal {
            let signal_listener = TcpListener::bind(("127.0.0.1", self.signal_port))
                .await
                .context("binding signal port")?;
            let port = signal_listener.local_addr()?.port();
            socket
                .write_all(&(port as i32).to_be_bytes())
                .await
                .context("advertising signal port")?;
            let (signal, _) = signal_listener
                .accept()
                .await
                .context("accepting signal connection")?;
            Some(signal)
        } else {
            None
        };

        let mut capacity_raw = [0u8; 4];
        socket
            .read_exact(&mut capacity_raw)
            .await
            .context("reading send capacity")?;
        let capacity = i32::from_be_bytes(capacity_raw).max(0) as usize;
        debug!(
            "stream {} negotiated: {:?}/{:?}, sender capacity {capacity}",
            stream.0, request.object_type, request.inst_mode
        );

        let ctx = DecodeContext {
            mode: request.inst_mode,
            timestamps: request.wants_signal,
        };
        let mut strategy = Strategy::select(request.object_type, request.inst_mode);

        self.control.set_connected(stream.0, true);
        self.metrics.inc_stream_opened();
        if let Err(err) = self.listeners.stream_started(stream).await {
            self.control.record_error(stream.0, err.to_string());
        }

        let outcome = self
            .receive_loop(&mut socket, stream, &ctx, &mut strategy)
            .await;
        self.control.set_connected(stream.0, false);

        // EOF, graceful or tolerated-truncated: commit exactly once.
        match outcome {
            Ok(()) => {
                self.listeners
                    .commit(stream)
                    .await
                    .context("committing event stream")?;
                self.metrics.inc_stream_committed();
                Ok(())
            }
            Err(err) => {
                self.control.record_error(stream.0, err.to_string());
                Err(err)
            }
        }
    }

    async fn receive_loop(
        &self,
        socket: &mut TcpStream,
        stream: StreamId,
        ctx: &DecodeContext,
        strategy: &mut Strategy,
    ) -> Result<()> {
        let mut header = [0u8; 8];
        loop {
            if self.control.stop_requested(stream.0) {
                debug!("stream {} stopped on request", stream.0);
                return Ok(());
            }
            match socket.read_exact(&mut header).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err).context("reading frame header"),
            }
            let len = u64::from_be_bytes(header) as usize;
            if len == 0 {
                continue;
            }
            if len > MAX_PAYLOAD {
                bail!("frame of {len} bytes exceeds the payload bound");
            }
            let mut payload = vec![0u8; len];
            match socket.read_exact(&mut payload).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // A force-closed sender may truncate its last frame.
                    warn!("stream {} ended mid-frame; discarding tail", stream.0);
                    return Ok(());
                }
                Err(err) => return Err(err).context("reading frame payload"),
            }
            self.metrics.record_frame(len);

            let mut buf = Bytes::from(payload);
            match Payload::decode(ctx, &mut buf) {
                Ok(payload) => {
                    match strategy.deliver(&payload, &self.listeners, stream).await {
                        Ok(events) => self.metrics.record_events(events),
                        Err(err) => {
                            self.metrics.inc_listener_error();
                            self.control.record_error(stream.0, err.to_string());
                        }
                    }
                }
                Err(err) => {
                    self.metrics.inc_decode_error();
                    self.control.record_error(stream.0, err.to_string());
                }
            }
        }
    }
}

/// Per-stream packet translation, matched to `(object_type, inst_mode)` at
/// handshake time.
pub enum Strategy {
    Compatible { object_type: ObjectType },
    Coverage { object_type: ObjectType },
    Sequence(SequenceDecoder),
    Fingerprint,
}

impl Strategy {
    pub fn select(object_type: ObjectType, mode: InstMode) -> Strategy {
        match mode {
            InstMode::Compatible => Strategy::Compatible { object_type },
            InstMode::OptNormal => Strategy::Coverage { object_type },
            InstMode::OptSequence => Strategy::Sequence(SequenceDecoder::new(object_type)),
            InstMode::TraceHashing => Strategy::Fingerprint,
        }
    }

    /// Translate one payload into listener events; returns how many events
    /// were delivered.
    pub async fn deliver(
        &mut self,
        payload: &Payload,
        listeners: &ListenerSet,
        stream: StreamId,
    ) -> Result<u64> {
        match (self, payload) {
            (Strategy::Compatible { .. }, Payload::ObjectCount(msg)) => {
                listeners
                    .method_enter(stream, &msg.signature, msg.count.max(0) as u32)
                    .await?;
                Ok(1)
            }
            (Strategy::Compatible { object_type }, Payload::Trace(msg)) => {
                let kind = EntityKind::from_tag(*object_type, msg.id.type_tag())
                    .ok_or_else(|| anyhow::anyhow!("unknown type tag {}", msg.id.type_tag()))?;
                listeners
                    .entity_witnessed(stream, &msg.signature, kind, msg.id.entity_id())
                    .await?;
                Ok(1)
            }
            (Strategy::Coverage { object_type }, Payload::Coverage(batch)) => {
                let mut events = 0u64;
                for method in &batch.methods {
                    listeners
                        .method_enter(stream, &method.signature, method.data.len() as u32)
                        .await?;
                    events += 1;
                    for (index, &witness) in method.data.iter().enumerate() {
                        if witness == 0 {
                            continue;
                        }
                        let kind = EntityKind::from_tag(*object_type, witness as u32)
                            .ok_or_else(|| {
                                anyhow::anyhow!("unknown witness code {witness} in coverage data")
                            })?;
                        listeners
                            .entity_witnessed(
                                stream,
                                &method.signature,
                                kind,
                                index as u32 + 1,
                            )
                            .await?;
                        events += 1;
                    }
                }
                Ok(events)
            }
            (Strategy::Sequence(decoder), Payload::Sequence(batch)) => {
                decoder.deliver(batch, listeners, stream).await
            }
            (Strategy::Fingerprint, _) => bail!("fingerprint subjects send no data frames"),
            (_, payload) => bail!("payload {payload:?} does not match the stream's strategy"),
        }
    }
}

/// Reconstructs per-method events from the flat sequence stream.
pub struct SequenceDecoder {
    object_type: ObjectType,
    bindings: HashMap<i32, Binding>,
    current: Option<String>,
}

struct Binding {
    signature: String,
    object_count: u16,
}

impl SequenceDecoder {
    fn new(object_type: ObjectType) -> Self {
        SequenceDecoder {
            object_type,
            bindings: HashMap::new(),
            current: None,
        }
    }

    async fn deliver(
        &mut self,
        batch: &tracery_wire::SequenceBatch,
        listeners: &ListenerSet,
        stream: StreamId,
    ) -> Result<u64> {
        for binding in &batch.bindings {
            self.bindings.insert(
                binding.index,
                Binding {
                    signature: binding.signature.clone(),
                    object_count: binding.object_count,
                },
            );
        }

        let mut events = 0u64;
        let mut entries = batch.entries.iter().copied();
        while let Some(entry) = entries.next() {
            match entry {
                marker::NEW_METHOD => {
                    let index = entries
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("dangling NEW_METHOD marker"))?
                        as i32;
                    let binding = self
                        .bindings
                        .get(&index)
                        .ok_or_else(|| anyhow::anyhow!("unbound signature index {index}"))?;
                    self.current = Some(binding.signature.clone());
                    listeners
                        .method_enter(stream, &binding.signature, binding.object_count as u32)
                        .await?;
                    events += 1;
                }
                marker::BRANCH_EXIT => {
                    listeners
                        .sequence_marker(stream, SequenceMarker::MethodExit)
                        .await?;
                    events += 1;
                }
                marker::NEW_TEST => {
                    listeners
                        .sequence_marker(stream, SequenceMarker::TestBoundary)
                        .await?;
                    events += 1;
                }
                raw => {
                    let id = ObjectId::from_raw(raw);
                    let signature = self
                        .current
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("entity entry before any method"))?;
                    let kind = EntityKind::from_tag(self.object_type, id.type_tag())
                        .ok_or_else(|| anyhow::anyhow!("unknown type tag {}", id.type_tag()))?;
                    listeners
                        .entity_witnessed(stream, &signature, kind, id.entity_id())
                        .await?;
                    events += 1;
                }
            }
        }
        Ok(events)
    }
}
