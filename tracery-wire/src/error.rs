use thiserror::Error;

/// Decode and validation failures for wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer ended before the structure it was supposed to hold.
    #[error("truncated message: needed {needed} more byte(s)")]
    Truncated { needed: usize },

    #[error("unknown payload tag {0:#04x}")]
    BadTag(u8),

    #[error("type tag {type_tag} or entity id {id} outside the packed-id range")]
    IdOutOfRange { type_tag: u32, id: u32 },

    #[error("unknown {kind} code {code}")]
    BadCode { kind: &'static str, code: i32 },

    #[error("signature is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    /// A length field exceeds what its width can carry on the wire.
    #[error("{field} of {len} does not fit its wire field")]
    FieldOverflow { field: &'static str, len: usize },
}
