use std::io;

/// All error types for the weft-proto crate.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("message exceeds size limit: {0} bytes")]
    MessageTooLarge(usize),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("server error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProtoError {
    /// Error code string used in structured logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProtoError::InvalidFormat(_) => "invalid_format",
            ProtoError::MessageTooLarge(_) => "message_too_large",
            ProtoError::PeerClosed => "peer_closed",
            ProtoError::Remote(_) => "remote_error",
            ProtoError::Io(_) => "io_error",
        }
    }
}
