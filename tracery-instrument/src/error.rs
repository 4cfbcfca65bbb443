use thiserror::Error;
use tracery_wire::WireError;

/// Instrumentation-time failures. A per-method failure aborts the current
/// unit; the job driver logs it and moves on to the next unit.
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// The unit is malformed or is an interface.
    #[error("bad unit format for {unit}: {reason}")]
    BadFileFormat { unit: String, reason: String },

    /// No CFG was available for a method that has a body.
    #[error("no control-flow graph for method {signature}")]
    MissingCfg { signature: String },

    /// A block/branch id or type tag exceeds what the wire encoding carries.
    #[error("id out of range in {signature}: {source}")]
    IdOutOfRange {
        signature: String,
        source: WireError,
    },

    /// An internal invariant was violated; always a bug.
    #[error("instrumentor invariant violated: {0}")]
    Invariant(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}
