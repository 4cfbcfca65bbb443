//! The probe itself.
//!
//! One probe per process. `start` connects and performs the handshake once;
//! every instrumented call after that funnels through the mode-specific
//! state here. Steady-state failures log and drop data: the probe never
//! propagates an error into instrumented code.

use std::collections::HashSet;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use once_cell::sync::OnceCell;
use tracery_wire::{InstMode, ObjectCount, ObjectId, Payload, TraceMessage};

use crate::config::ProbeConfig;
use crate::connection::{signal_echo_loop, Connection};
use crate::coverage::{BacktraceScanner, CoverageArray, CoverageRuntime, StackScanner};
use crate::error::ProbeError;
use crate::hashing::HashState;
use crate::sequence::SequenceState;
use crate::sink::{PayloadSink, SocketSink};

static PROBE: OnceCell<Probe> = OnceCell::new();

pub struct Probe {
    config: ProbeConfig,
    sink: Arc<dyn PayloadSink>,
    socket: Option<Arc<SocketSink>>,
    signal: Mutex<Option<TcpStream>>,
    compat_seen: Mutex<HashSet<String>>,
    sequence: Mutex<SequenceState>,
    hash: Mutex<HashState>,
    coverage: CoverageRuntime,
    tracked: Mutex<Vec<JoinHandle<()>>>,
    shutdown_done: AtomicBool,
}

impl Probe {
    /// Connect to the dispatcher and build a live probe. Rejection and
    /// connection failures surface as errors; the free-function entry point
    /// turns them into a process exit.
    pub fn connect(config: ProbeConfig) -> Result<Probe, ProbeError> {
        let (connection, signal) = Connection::establish(&config)?;
        let socket = Arc::new(SocketSink::new(connection));
        let echo_signal = match &signal {
            Some(s) => Some(s.try_clone().map_err(ProbeError::Handshake)?),
            None => None,
        };
        if let Some(echo) = echo_signal {
            std::thread::Builder::new()
                .name("tracery-signal-echo".into())
                .spawn(move || signal_echo_loop(echo))
                .map_err(ProbeError::Handshake)?;
        }
        let sink: Arc<dyn PayloadSink> = socket.clone();
        Ok(Probe::assemble(
            config,
            sink,
            Some(socket),
            signal,
            Box::new(BacktraceScanner),
        ))
    }

    /// Build a probe over an arbitrary sink; no socket involved. Test entry.
    pub fn with_sink(
        config: ProbeConfig,
        sink: Arc<dyn PayloadSink>,
        scanner: Box<dyn StackScanner>,
    ) -> Probe {
        Probe::assemble(config, sink, None, None, scanner)
    }

    fn assemble(
        config: ProbeConfig,
        sink: Arc<dyn PayloadSink>,
        socket: Option<Arc<SocketSink>>,
        signal: Option<TcpStream>,
        scanner: Box<dyn StackScanner>,
    ) -> Probe {
        let coverage = CoverageRuntime::new(scanner, sink.clone());
        Probe {
            config,
            sink,
            socket,
            signal: Mutex::new(signal),
            compat_seen: Mutex::new(HashSet::new()),
            sequence: Mutex::new(SequenceState::new()),
            hash: Mutex::new(HashState::new()),
            coverage,
            tracked: Mutex::new(Vec::new()),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// Install `probe` as the process-wide instance. The first install wins;
    /// a later install is refused and the existing instance stays in place,
    /// which is what makes the startup probe idempotent.
    pub fn install(probe: Probe) -> Result<&'static Probe, ProbeError> {
        PROBE
            .try_insert(probe)
            .map_err(|_| ProbeError::AlreadyStarted)
    }

    pub fn get() -> Option<&'static Probe> {
        PROBE.get()
    }

    pub fn mode(&self) -> InstMode {
        self.config.mode
    }

    /// Register an application thread the shutdown drain should wait for.
    pub fn track_thread(&self, handle: JoinHandle<()>) {
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.push(handle);
        }
    }

    // ----- compatible mode ---------------------------------------------------

    pub fn trace_event(&self, packed: i32, signature: &str) {
        let timestamp = self.config.wants_signal.then(now_millis);
        self.sink.ship(&Payload::Trace(TraceMessage {
            timestamp,
            id: ObjectId::from_raw(packed as u32),
            signature: signature.to_owned(),
        }));
    }

    /// Announce a method's entity count, once per first entry.
    pub fn object_count(&self, signature: &str, count: i32) {
        let fresh = match self.compat_seen.lock() {
            Ok(mut seen) => seen.insert(signature.to_owned()),
            Err(_) => false,
        };
        if fresh {
            self.sink.ship(&Payload::ObjectCount(ObjectCount {
                signature: signature.to_owned(),
                count,
            }));
        }
    }

    // ----- coverage mode -----------------------------------------------------

    pub fn object_array(&self, signature: &str, count: i32) -> Arc<CoverageArray> {
        self.coverage
            .object_array(signature, count.max(0) as usize, self.sink.as_ref())
    }

    // ----- sequence mode -----------------------------------------------------

    pub fn sequence_enter(&self, signature: &str, count: i32) {
        if let Ok(mut seq) = self.sequence.lock() {
            seq.enter_method(signature, count.clamp(0, u16::MAX as i32) as u16, self.sink.as_ref());
        }
    }

    pub fn sequence_append(&self, packed: i32) {
        if let Ok(mut seq) = self.sequence.lock() {
            seq.append(packed as u32, self.sink.as_ref());
        }
    }

    pub fn sequence_exit(&self) {
        if let Ok(mut seq) = self.sequence.lock() {
            seq.append_exit(self.sink.as_ref());
        }
    }

    pub fn end_test(&self) {
        if let Ok(mut seq) = self.sequence.lock() {
            seq.end_test(self.sink.as_ref());
        }
    }

    // ----- hashing mode ------------------------------------------------------

    pub fn hash_event(&self, global_index: i32) {
        if let Ok(mut hash) = self.hash.lock() {
            hash.record(global_index as u32);
        }
    }

    pub fn final_hash(&self) -> u32 {
        self.hash.lock().map(|h| h.value()).unwrap_or(0)
    }

    // ----- shutdown ----------------------------------------------------------

    /// The drain routine. Joins tracked application threads (the send lock
    /// is not held here), stops the exit handler, drains the mode-specific
    /// state, and releases sockets: signal first, then the send socket.
    /// Runs at most once; later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = match self.tracked.lock() {
            Ok(mut tracked) => tracked.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("tracked thread panicked before the final drain");
            }
        }

        match self.config.mode {
            InstMode::OptNormal => self.coverage.drain(self.sink.as_ref()),
            InstMode::OptSequence => {
                if let Ok(mut seq) = self.sequence.lock() {
                    seq.flush(self.sink.as_ref());
                }
            }
            InstMode::Compatible => {}
            InstMode::TraceHashing => {
                let hash = self.final_hash();
                info!("final trace fingerprint: {hash:08x}");
                println!("{hash:08x}");
            }
        }
        self.sink.flush();

        if let Ok(mut signal) = self.signal.lock() {
            if let Some(signal) = signal.take() {
                if let Err(err) = signal.shutdown(Shutdown::Both) {
                    log::debug!("signal socket close: {err}");
                }
            }
        }
        if let Some(socket) = &self.socket {
            socket.close();
        }
    }
}

/// RAII drain: hold one in `main` and the probe drains on the way out.
pub struct ShutdownGuard;

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if let Some(probe) = Probe::get() {
            probe.shutdown();
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
