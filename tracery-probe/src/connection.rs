//! The probe's side of the wire: handshake, staging buffer, framed sends.
//!
//! One logical sender per probe. The caller serializes access through the
//! probe's send lock; this module only worries about bytes.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use tracery_wire::{HandshakeReply, HandshakeRequest, Payload};

use crate::config::ProbeConfig;
use crate::error::ProbeError;

/// An accepted connection plus the optional signal side channel.
pub struct Connection {
    stream: TcpStream,
    staging: BytesMut,
    capacity: usize,
}

impl Connection {
    /// Run the full handshake against the dispatcher. Returns the data
    /// connection and, when requested, the signal socket.
    pub fn establish(config: &ProbeConfig) -> Result<(Connection, Option<TcpStream>), ProbeError> {
        let addr = format!("127.0.0.1:{}", config.port);
        let mut stream = TcpStream::connect(&addr).map_err(|source| ProbeError::Connect {
            addr: addr.clone(),
            source,
        })?;
        stream.set_nodelay(true).ok();

        let mut hello = BytesMut::new();
        HandshakeRequest {
            object_type: config.object_type,
            inst_mode: config.mode,
            wants_signal: config.wants_signal,
        }
        .encode(&mut hello);
        stream.write_all(&hello).map_err(ProbeError::Handshake)?;

        let mut verdict = [0u8; HandshakeReply::ENCODED_LEN];
        stream
            .read_exact(&mut verdict)
            .map_err(ProbeError::Handshake)?;
        let mut verdict = Bytes::copy_from_slice(&verdict);
        let reply = HandshakeReply::decode(&mut verdict)
            .map_err(|_| ProbeError::Handshake(std::io::Error::other("short reply")))?;
        if !reply.accepted() {
            return Err(ProbeError::Rejected {
                object_ok: reply.object_ok,
                mode_ok: reply.mode_ok,
            });
        }

        let signal = if config.wants_signal {
            let mut raw = [0u8; 4];
            stream.read_exact(&mut raw).map_err(ProbeError::Handshake)?;
            let port = i32::from_be_bytes(raw);
            let signal_addr = format!("127.0.0.1:{port}");
            let signal =
                TcpStream::connect(&signal_addr).map_err(|source| ProbeError::Connect {
                    addr: signal_addr,
                    source,
                })?;
            debug!("signal socket connected on port {port}");
            Some(signal)
        } else {
            None
        };

        let mut capacity_word = BytesMut::new();
        capacity_word.put_i32(config.send_capacity as i32);
        stream
            .write_all(&capacity_word)
            .map_err(ProbeError::Handshake)?;

        Ok((
            Connection {
                stream,
                staging: BytesMut::with_capacity(config.send_capacity),
                capacity: config.send_capacity,
            },
            signal,
        ))
    }

    /// Stage one payload as a complete frame, flushing first when the
    /// staging buffer cannot hold it. Errors are logged and the payload is
    /// dropped: the probe must never throw out of instrumented code.
    pub fn send(&mut self, payload: &Payload) {
        let frame = match payload.encode_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping unencodable payload: {err}");
                return;
            }
        };
        if self.staging.len() + frame.len() > self.capacity {
            self.flush();
        }
        self.staging.extend_from_slice(&frame);
        if self.staging.len() >= self.capacity {
            self.flush();
        }
    }

    /// Push everything staged onto the socket.
    pub fn flush(&mut self) {
        if self.staging.is_empty() {
            return;
        }
        let out = self.staging.split();
        if let Err(err) = self.stream.write_all(&out) {
            warn!("dropping {} staged byte(s): {err}", out.len());
        }
        let _ = self.stream.flush();
    }

    /// Final close. Failures here are expected during teardown and only
    /// logged.
    pub fn close(&mut self) {
        self.flush();
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!("send socket close: {err}");
        }
    }
}

/// Blocking echo loop for the signal socket: every byte the host sends comes
/// straight back. Runs on its own daemon thread and ends at EOF.
pub fn signal_echo_loop(mut signal: TcpStream) {
    let mut byte = [0u8; 1];
    loop {
        match signal.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if signal.write_all(&byte).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!("signal socket closed: {err}");
                break;
            }
        }
    }
}
