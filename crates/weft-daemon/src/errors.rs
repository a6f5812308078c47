use std::io;

/// All error types for the weft-daemon crate.
///
/// The `Display` strings of the user-facing variants are the exact error
/// strings clients see in RPC responses.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("address in use: {0}")]
    AddressInUse(String),

    #[error("PTY limit reached")]
    PtyLimitReached,

    #[error("client limit reached")]
    ClientLimitReached,

    #[error("PTY not found")]
    PtyNotFound(u64),

    #[error("send queue full")]
    SendQueueFull,

    #[error("unknown method")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("PTY error: {0}")]
    PtyError(String),

    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("wire error: {0}")]
    Proto(#[from] weft_proto::ProtoError),
}

impl DaemonError {
    /// Error code string for structured logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::AddressInUse(_) => "address_in_use",
            DaemonError::PtyLimitReached => "pty_limit_reached",
            DaemonError::ClientLimitReached => "client_limit_reached",
            DaemonError::PtyNotFound(_) => "pty_not_found",
            DaemonError::SendQueueFull => "send_queue_full",
            DaemonError::UnknownMethod(_) => "unknown_method",
            DaemonError::InvalidParams(_) => "invalid_params",
            DaemonError::ProtocolError(_) => "protocol_error",
            DaemonError::PtyError(_) => "pty_error",
            DaemonError::ConfigInvalid(_) => "config_invalid",
            DaemonError::Io(_) => "io_error",
            DaemonError::Proto(_) => "wire_error",
        }
    }

    /// Whether this error is caused by the caller rather than the daemon.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DaemonError::PtyLimitReached
                | DaemonError::ClientLimitReached
                | DaemonError::PtyNotFound(_)
                | DaemonError::UnknownMethod(_)
                | DaemonError::InvalidParams(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_strings_are_exact() {
        assert_eq!(DaemonError::PtyNotFound(3).to_string(), "PTY not found");
        assert_eq!(
            DaemonError::PtyLimitReached.to_string(),
            "PTY limit reached"
        );
        assert_eq!(
            DaemonError::UnknownMethod("bogus".to_string()).to_string(),
            "unknown method"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DaemonError::SendQueueFull.error_code(), "send_queue_full");
        assert_eq!(
            DaemonError::AddressInUse("/tmp/weft.sock".to_string()).error_code(),
            "address_in_use"
        );
        let io_err: DaemonError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(io_err.error_code(), "io_error");
    }

    #[test]
    fn test_user_error_classification() {
        assert!(DaemonError::PtyNotFound(0).is_user_error());
        assert!(DaemonError::UnknownMethod("x".to_string()).is_user_error());
        assert!(!DaemonError::SendQueueFull.is_user_error());
        assert!(!DaemonError::PtyError("boom".to_string()).is_user_error());
    }
}
