//! Wire-level definitions shared by the tracery probe and the dispatcher.
//!
//! Everything two processes must agree on byte-for-byte lives here: packed
//! probe identifiers, the structural type codes, the connection handshake,
//! and the length-framed data messages. Both endpoints depend on this crate
//! so the encode and decode paths can never drift apart.

pub mod error;
pub mod frame;
pub mod handshake;
pub mod ids;
pub mod types;

pub use error::WireError;
pub use frame::{
    CoverageBatch, DecodeContext, MethodCoverage, ObjectCount, Payload, SequenceBatch,
    SignatureBinding, TraceMessage, FRAME_HEADER_LEN,
};
pub use handshake::{HandshakeReply, HandshakeRequest, SIGNAL_REQUEST_FLAG};
pub use ids::{marker, ObjectId, MAX_ENTITY_ID, MAX_TYPE_TAG};
pub use types::{BlockMask, BlockSubType, BlockType, BranchMask, BranchType, InstMode, ObjectType};
