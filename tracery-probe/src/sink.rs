//! Where shipped payloads go.
//!
//! The cache and buffer machinery only needs "somewhere to put a payload";
//! giving it a trait keeps the eviction and drain logic testable without a
//! live socket.

use std::sync::Mutex;

use tracery_wire::Payload;

use crate::connection::Connection;

pub trait PayloadSink: Send + Sync {
    fn ship(&self, payload: &Payload);

    /// Push buffered data to the transport, if the sink buffers.
    fn flush(&self) {}
}

/// Socket-backed sink. The mutex is the probe's single send lock: one
/// logical sender, never held across thread joins.
pub struct SocketSink {
    connection: Mutex<Connection>,
}

impl SocketSink {
    pub fn new(connection: Connection) -> Self {
        SocketSink {
            connection: Mutex::new(connection),
        }
    }

    pub fn close(&self) {
        if let Ok(mut conn) = self.connection.lock() {
            conn.close();
        }
    }
}

impl PayloadSink for SocketSink {
    fn ship(&self, payload: &Payload) {
        if let Ok(mut conn) = self.connection.lock() {
            conn.send(payload);
        }
    }

    fn flush(&self) {
        if let Ok(mut conn) = self.connection.lock() {
            conn.flush();
        }
    }
}

/// Collects payloads in memory; test double.
#[derive(Default)]
pub struct MemorySink {
    pub payloads: Mutex<Vec<Payload>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn take(&self) -> Vec<Payload> {
        std::mem::take(&mut self.payloads.lock().unwrap())
    }
}

impl PayloadSink for MemorySink {
    fn ship(&self, payload: &Payload) {
        self.payloads.lock().unwrap().push(payload.clone());
    }
}
