//! Length-framed data messages, probe to host.
//!
//! Every frame is a `u64` payload length followed by the payload itself; the
//! payload opens with a tag byte. Tag `0x01` carries the mode-specific data
//! message, so decoding needs the instrumentation mode negotiated in the
//! handshake. Tag `0x02` carries a per-method object count.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::ids::ObjectId;
use crate::types::InstMode;

/// Bytes of the outer frame header (the `u64` payload length).
pub const FRAME_HEADER_LEN: usize = 8;

/// Tag of the mode-specific data message.
pub const DATA_TAG: u8 = 0x01;

/// Tag of the object-count message (Compatible mode only).
pub const OBJECT_COUNT_TAG: u8 = 0x02;

/// Everything the receiver needs to decode a payload: the negotiated mode
/// and whether Compatible-mode messages carry timestamps.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    pub mode: InstMode,
    pub timestamps: bool,
}

/// One Compatible-mode probe event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceMessage {
    /// Present only when the subject is itself a dispatcher and event
    /// streams must be synchronized.
    pub timestamp: Option<i64>,
    pub id: ObjectId,
    pub signature: String,
}

/// Per-method coverage array as shipped in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCoverage {
    pub signature: String,
    pub data: Vec<u8>,
}

/// A batch of per-method coverage arrays (OptNormal mode).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoverageBatch {
    pub methods: Vec<MethodCoverage>,
}

/// A signature interning record new to this flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBinding {
    /// Number of structural entities in the method.
    pub object_count: u16,
    pub index: i32,
    pub signature: String,
}

/// A flush of the sequence buffer (OptSequence mode): freshly interned
/// bindings followed by the ordered entry words.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequenceBatch {
    pub bindings: Vec<SignatureBinding>,
    pub entries: Vec<u32>,
}

/// First-entry object count for a method (Compatible mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCount {
    pub signature: String,
    pub count: i32,
}

/// A decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Trace(TraceMessage),
    Coverage(CoverageBatch),
    Sequence(SequenceBatch),
    ObjectCount(ObjectCount),
}

impl Payload {
    /// Encode the payload (tag byte included) into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Payload::Trace(msg) => {
                buf.put_u8(DATA_TAG);
                if let Some(ts) = msg.timestamp {
                    buf.put_i64(ts);
                }
                buf.put_u32(msg.id.raw());
                put_string(buf, &msg.signature)?;
            }
            Payload::Coverage(batch) => {
                buf.put_u8(DATA_TAG);
                buf.put_i32(checked_count("method_count", batch.methods.len())?);
                for method in &batch.methods {
                    let arr_len = u16::try_from(method.data.len()).map_err(|_| {
                        WireError::FieldOverflow {
                            field: "arr_len",
                            len: method.data.len(),
                        }
                    })?;
                    buf.put_u16(arr_len);
                    put_string(buf, &method.signature)?;
                    buf.put_slice(&method.data);
                }
            }
            Payload::Sequence(batch) => {
                buf.put_u8(DATA_TAG);
                buf.put_i32(checked_count("new_binding_count", batch.bindings.len())?);
                for binding in &batch.bindings {
                    buf.put_u16(binding.object_count);
                    buf.put_i32(binding.index);
                    put_string(buf, &binding.signature)?;
                }
                buf.put_i32(checked_count("entry_count", batch.entries.len())?);
                for entry in &batch.entries {
                    buf.put_u32(*entry);
                }
            }
            Payload::ObjectCount(msg) => {
                buf.put_u8(OBJECT_COUNT_TAG);
                put_string(buf, &msg.signature)?;
                buf.put_i32(msg.count);
            }
        }
        Ok(())
    }

    /// Encode a complete frame: `u64` payload length followed by the payload.
    pub fn encode_frame(&self) -> Result<Bytes, WireError> {
        let mut body = BytesMut::new();
        self.encode(&mut body)?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.put_u64(body.len() as u64);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode one payload (tag byte first) from `buf`.
    pub fn decode<B: Buf>(ctx: &DecodeContext, buf: &mut B) -> Result<Payload, WireError> {
        need(buf, 1)?;
        let tag = buf.get_u8();
        match tag {
            DATA_TAG => Self::decode_data(ctx, buf),
            OBJECT_COUNT_TAG => {
                let signature = read_string(buf)?;
                need(buf, 4)?;
                let count = buf.get_i32();
                Ok(Payload::ObjectCount(ObjectCount { signature, count }))
            }
            other => Err(WireError::BadTag(other)),
        }
    }

    fn decode_data<B: Buf>(ctx: &DecodeContext, buf: &mut B) -> Result<Payload, WireError> {
        match ctx.mode {
            InstMode::Compatible => {
                let timestamp = if ctx.timestamps {
                    need(buf, 8)?;
                    Some(buf.get_i64())
                } else {
                    None
                };
                need(buf, 4)?;
                let id = ObjectId::from_raw(buf.get_u32());
                let signature = read_string(buf)?;
                Ok(Payload::Trace(TraceMessage {
                    timestamp,
                    id,
                    signature,
                }))
            }
            InstMode::OptNormal => {
                need(buf, 4)?;
                let method_count = read_count(buf.get_i32(), "method_count")?;
                let mut methods = Vec::with_capacity(method_count.min(1024));
                for _ in 0..method_count {
                    need(buf, 2)?;
                    let arr_len = buf.get_u16() as usize;
                    let signature = read_string(buf)?;
                    need(buf, arr_len)?;
                    let mut data = vec![0u8; arr_len];
                    buf.copy_to_slice(&mut data);
                    methods.push(MethodCoverage { signature, data });
                }
                Ok(Payload::Coverage(CoverageBatch { methods }))
            }
            InstMode::OptSequence => {
                need(buf, 4)?;
                let binding_count = read_count(buf.get_i32(), "new_binding_count")?;
                let mut bindings = Vec::with_capacity(binding_count.min(1024));
                for _ in 0..binding_count {
                    need(buf, 6)?;
                    let object_count = buf.get_u16();
                    let index = buf.get_i32();
                    let signature = read_string(buf)?;
                    bindings.push(SignatureBinding {
                        object_count,
                        index,
                        signature,
                    });
                }
                need(buf, 4)?;
                let entry_count = read_count(buf.get_i32(), "entry_count")?;
                need(buf, entry_count.saturating_mul(4))?;
                let mut entries = Vec::with_capacity(entry_count);
                for _ in 0..entry_count {
                    entries.push(buf.get_u32());
                }
                Ok(Payload::Sequence(SequenceBatch { bindings, entries }))
            }
            // Fingerprint subjects never send data frames.
            InstMode::TraceHashing => Err(WireError::BadTag(DATA_TAG)),
        }
    }
}

fn need<B: Buf>(buf: &B, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn read_count(raw: i32, field: &'static str) -> Result<usize, WireError> {
    usize::try_from(raw).map_err(|_| WireError::FieldOverflow {
        field,
        len: raw as usize,
    })
}

fn checked_count(field: &'static str, len: usize) -> Result<i32, WireError> {
    i32::try_from(len).map_err(|_| WireError::FieldOverflow { field, len })
}

fn read_string<B: Buf>(buf: &mut B) -> Result<String, WireError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    let s = std::str::from_utf8(&raw)?;
    Ok(s.to_owned())
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), WireError> {
    let len = u16::try_from(s.len()).map_err(|_| WireError::FieldOverflow {
        field: "sig_len",
        len: s.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}
