//! Error types for hytun.

use thiserror::Error;

use crate::acl::AclError;
use crate::protocol::ProtocolError;

/// Exit codes for the client subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Generic failure
    Failure = 1,
    /// Local listener could not be bound
    ListenFailed = 10,
    /// QUIC connection or handshake failed
    ConnectionFailed = 11,
    /// TLS verification failed
    TlsVerificationFailed = 12,
    /// Server rejected our credentials
    AuthRejected = 13,
    /// ACL document could not be parsed
    AclInvalid = 14,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for hytun.
#[derive(Debug, Error)]
pub enum Error {
    /// The server rejected the auth token.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The control-stream exchange did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Transport-level failure (QUIC connect, connection lost).
    #[error("network error: {0}")]
    Network(String),

    /// The server could not reach a requested destination. Scoped to one stream.
    #[error("connect to {addr} failed: {message}")]
    ConnectFailed { addr: String, message: String },

    /// The session (or the stream/datagram session) is closed.
    #[error("session closed")]
    Closed,

    /// A caller-supplied deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Payload does not fit in a single QUIC datagram.
    #[error("datagram too large: {size} bytes exceeds {max}")]
    DatagramTooLarge { size: usize, max: usize },

    /// The peer is not able to carry datagrams on this connection.
    #[error("datagrams unsupported: {0}")]
    DatagramUnsupported(String),

    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("TLS verification failed: {0}")]
    TlsVerificationFailed(String),

    #[error(transparent)]
    Acl(#[from] AclError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Auth(_) => ExitCode::AuthRejected,
            Error::Handshake(_) | Error::Network(_) | Error::Closed => ExitCode::ConnectionFailed,
            Error::TlsVerificationFailed(_) => ExitCode::TlsVerificationFailed,
            Error::ListenFailed(_) => ExitCode::ListenFailed,
            Error::Acl(_) => ExitCode::AclInvalid,
            _ => ExitCode::Failure,
        }
    }

    /// Whether this error ends the whole session rather than a single stream or flow.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::Handshake(_) | Error::Network(_) | Error::Closed
        )
    }
}

/// Result type alias for hytun operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_maps_to_auth_exit_code() {
        let err = Error::Auth("bad token".to_string());
        assert_eq!(err.exit_code(), ExitCode::AuthRejected);
        assert_eq!(i32::from(err.exit_code()), 13);
    }

    #[test]
    fn connect_failure_is_scoped_to_one_stream() {
        let err = Error::ConnectFailed {
            addr: "10.0.0.1:80".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(!err.is_session_fatal());
        assert!(err.to_string().contains("10.0.0.1:80"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn closed_is_session_fatal() {
        assert!(Error::Closed.is_session_fatal());
        assert!(Error::Network("reset".to_string()).is_session_fatal());
    }

    #[test]
    fn acl_error_maps_to_acl_exit_code() {
        let err = Error::from(AclError::Parse {
            line: 3,
            message: "unknown action 'allow'".to_string(),
        });
        assert_eq!(err.exit_code(), ExitCode::AclInvalid);
        assert!(err.to_string().contains("line 3"));
    }
}
