use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global counters for the dispatcher.
///
/// Updated from the receive loops, so everything is atomic.
pub struct Metrics {
    pub start_time: SystemTime,
    frames_total: AtomicU64,
    bytes_total: AtomicU64,
    events_total: AtomicU64,
    decode_errors: AtomicU64,
    listener_errors: AtomicU64,
    streams_opened: AtomicUsize,
    streams_committed: AtomicUsize,
    handshakes_rejected: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            frames_total: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            events_total: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            listener_errors: AtomicU64::new(0),
            streams_opened: AtomicUsize::new(0),
            streams_committed: AtomicUsize::new(0),
            handshakes_rejected: AtomicU64::new(0),
        }
    }

    pub fn record_frame(&self, payload_len: usize) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total
            .fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    pub fn record_events(&self, count: u64) {
        self.events_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_listener_error(&self) {
        self.listener_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_committed(&self) {
        self.streams_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshake_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn listener_errors(&self) -> u64 {
        self.listener_errors.load(Ordering::Relaxed)
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::Relaxed)
    }

    pub fn streams_committed(&self) -> usize {
        self.streams_committed.load(Ordering::Relaxed)
    }

    pub fn handshakes_rejected(&self) -> u64 {
        self.handshakes_rejected.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.record_frame(100);
        m.record_frame(24);
        m.record_events(3);
        m.inc_stream_opened();
        m.inc_stream_committed();
        assert_eq!(m.frames_total(), 2);
        assert_eq!(m.bytes_total(), 124);
        assert_eq!(m.events_total(), 3);
        assert_eq!(m.streams_opened(), 1);
        assert_eq!(m.streams_committed(), 1);
        assert_eq!(m.decode_errors(), 0);
    }
}
