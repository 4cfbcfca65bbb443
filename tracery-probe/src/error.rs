use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("host rejected the handshake (object_ok={object_ok}, mode_ok={mode_ok})")]
    Rejected { object_ok: bool, mode_ok: bool },

    #[error("handshake I/O failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("could not connect to the dispatcher at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("probe already started; keeping the existing instance")]
    AlreadyStarted,

    #[error("probe used before start()")]
    NotStarted,
}
