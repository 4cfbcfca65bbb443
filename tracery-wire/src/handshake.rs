//! Connection handshake.
//!
//! All integers are big-endian. The exchange is:
//!
//! ```text
//! probe -> host:  i32 object_type ; i32 inst_mode
//! host -> probe:  u8 object_ok (0 = ok) ; u8 mode_ok (0 = ok)
//!                 ; i32 signal_port, only when the signal flag was set
//! probe -> host:  i32 send_buffer_capacity
//! ```

use bytes::{Buf, BufMut};

use crate::error::WireError;
use crate::types::{InstMode, ObjectType};

/// Bit of the `object_type` word that asks the host to open a signal socket.
/// The low bits carry the [`ObjectType`] code.
pub const SIGNAL_REQUEST_FLAG: i32 = 0x4000_0000;

/// Opening message of the handshake, probe to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub object_type: ObjectType,
    pub inst_mode: InstMode,
    /// Set when the subject is itself a dispatcher and needs the
    /// signal-socket side channel.
    pub wants_signal: bool,
}

impl HandshakeRequest {
    pub const ENCODED_LEN: usize = 8;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut word = self.object_type.code();
        if self.wants_signal {
            word |= SIGNAL_REQUEST_FLAG;
        }
        buf.put_i32(word);
        buf.put_i32(self.inst_mode.code());
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(WireError::Truncated {
                needed: Self::ENCODED_LEN - buf.remaining(),
            });
        }
        let word = buf.get_i32();
        let wants_signal = word & SIGNAL_REQUEST_FLAG != 0;
        let object_type = ObjectType::from_code(word & !SIGNAL_REQUEST_FLAG)?;
        let inst_mode = InstMode::from_code(buf.get_i32())?;
        Ok(HandshakeRequest {
            object_type,
            inst_mode,
            wants_signal,
        })
    }
}

/// Accept/reject verdict, host to probe. A zero byte means accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReply {
    pub object_ok: bool,
    pub mode_ok: bool,
}

impl HandshakeReply {
    pub const ENCODED_LEN: usize = 2;

    pub fn accepted(self) -> bool {
        self.object_ok && self.mode_ok
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(if self.object_ok { 0 } else { 1 });
        buf.put_u8(if self.mode_ok { 0 } else { 1 });
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(WireError::Truncated {
                needed: Self::ENCODED_LEN - buf.remaining(),
            });
        }
        Ok(HandshakeReply {
            object_ok: buf.get_u8() == 0,
            mode_ok: buf.get_u8() == 0,
        })
    }
}
