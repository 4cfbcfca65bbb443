//! The tracery runtime probe.
//!
//! This library lives inside the instrumented subject. The rewriter splices
//! calls to the free functions at the bottom of this file; everything else is
//! the machinery behind them: the handshake and framed sender, the per-thread
//! coverage caches, the sequence buffer, and the fingerprint state.
//!
//! The probe is deliberately quiet about failure. After startup, an I/O
//! problem costs data, never the subject: errors are logged through `log`
//! and the current packet is dropped.

pub mod config;
pub mod connection;
pub mod coverage;
pub mod error;
pub mod hashing;
pub mod probe;
pub mod sequence;
pub mod sink;

pub use config::ProbeConfig;
pub use coverage::{
    BacktraceScanner, CoverageArray, StackScanner, THREAD_LRU_MAX, THREAD_LRU_OVERMAX_THRESHOLD,
    THREAD_LRU_SCAN_SIZE,
};
pub use error::ProbeError;
pub use probe::{Probe, ShutdownGuard};
pub use sequence::SEQUENCE_CAPACITY;
pub use sink::{MemorySink, PayloadSink, SocketSink};

use std::sync::Arc;

use log::{debug, error, warn};

/// The installed probe, or nothing plus a logged [`ProbeError::NotStarted`].
/// Instrumentation puts the startup call ahead of every other probe, so a
/// miss here means a rewrite defect; the event is dropped, never thrown.
fn active() -> Option<&'static Probe> {
    let probe = Probe::get();
    if probe.is_none() {
        debug!("dropping probe event: {}", ProbeError::NotStarted);
    }
    probe
}

/// One-time startup. Idempotent: only the first call connects. A rejected
/// handshake or unreachable dispatcher ends the subject with exit code 1,
/// because running uninstrumented would silently produce an empty trace.
pub fn tracery_probe_start(target_junit: i32) {
    if Probe::get().is_some() {
        return;
    }
    let mut config = ProbeConfig::from_env();
    config.target_junit = target_junit != 0;
    match Probe::connect(config) {
        Ok(probe) => {
            if let Err(err) = Probe::install(probe) {
                // Lost a startup race; the winner's connection serves.
                warn!("{err}");
            }
        }
        Err(err) => {
            error!("probe startup failed: {err}");
            std::process::exit(1);
        }
    }
}

pub fn tracery_probe_trace_event(packed_id: i32, signature: &str) {
    if let Some(probe) = active() {
        probe.trace_event(packed_id, signature);
    }
}

pub fn tracery_probe_object_count(signature: &str, object_count: i32) {
    if let Some(probe) = active() {
        probe.object_count(signature, object_count);
    }
}

pub fn tracery_probe_object_array(signature: &str, object_count: i32) -> Option<Arc<CoverageArray>> {
    active().map(|probe| probe.object_array(signature, object_count))
}

pub fn tracery_probe_sequence_enter(signature: &str, object_count: i32) {
    if let Some(probe) = active() {
        probe.sequence_enter(signature, object_count);
    }
}

pub fn tracery_probe_sequence_append(packed_id: i32) {
    if let Some(probe) = active() {
        probe.sequence_append(packed_id);
    }
}

pub fn tracery_probe_sequence_exit() {
    if let Some(probe) = active() {
        probe.sequence_exit();
    }
}

pub fn tracery_probe_hash_event(global_index: i32) {
    if let Some(probe) = active() {
        probe.hash_event(global_index);
    }
}

/// Close out one test under a test harness: writes the boundary marker and
/// ships the sequence buffer.
pub fn tracery_probe_end_test() {
    if let Some(probe) = active() {
        probe.end_test();
    }
}

/// Drain and release everything; safe to call more than once.
pub fn tracery_probe_shutdown() {
    if let Some(probe) = Probe::get() {
        probe.shutdown();
    }
}

// Twin entry points. When the probe library is itself the subject being
// traced, the rewriter redirects every probe call to these names so an
// instrumented probe cannot recurse into its own instrumentation.

#[allow(non_snake_case)]
pub fn tracery_probe_start__twin(target_junit: i32) {
    tracery_probe_start(target_junit);
}

#[allow(non_snake_case)]
pub fn tracery_probe_trace_event__twin(packed_id: i32, signature: &str) {
    tracery_probe_trace_event(packed_id, signature);
}

#[allow(non_snake_case)]
pub fn tracery_probe_object_count__twin(signature: &str, object_count: i32) {
    tracery_probe_object_count(signature, object_count);
}

#[allow(non_snake_case)]
pub fn tracery_probe_object_array__twin(
    signature: &str,
    object_count: i32,
) -> Option<Arc<CoverageArray>> {
    tracery_probe_object_array(signature, object_count)
}

#[allow(non_snake_case)]
pub fn tracery_probe_sequence_enter__twin(signature: &str, object_count: i32) {
    tracery_probe_sequence_enter(signature, object_count);
}

#[allow(non_snake_case)]
pub fn tracery_probe_sequence_append__twin(packed_id: i32) {
    tracery_probe_sequence_append(packed_id);
}

#[allow(non_snake_case)]
pub fn tracery_probe_sequence_exit__twin() {
    tracery_probe_sequence_exit();
}

#[allow(non_snake_case)]
pub fn tracery_probe_hash_event__twin(global_index: i32) {
    tracery_probe_hash_event(global_index);
}

#[allow(non_snake_case)]
pub fn tracery_probe_end_test__twin() {
    tracery_probe_end_test();
}
