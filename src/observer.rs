//! Per-request instrumentation hooks for the front-ends.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::acl::Decision;
use crate::error::Error;

/// Transport protocol of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// A front-end accepted a request and the ACL decided what to do with it.
#[derive(Debug, Clone, Copy)]
pub struct RequestEvent<'a> {
    pub network: Network,
    pub source: SocketAddr,
    pub destination: &'a str,
    pub decision: Decision<'a>,
}

/// A request ended with an error.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent<'a> {
    pub network: Network,
    pub source: SocketAddr,
    pub destination: &'a str,
    pub error: &'a Error,
}

impl ErrorEvent<'_> {
    /// Whether the error is the ordinary end of a flow (EOF, idle timeout).
    pub fn is_benign(&self) -> bool {
        match self.error {
            Error::DeadlineExceeded | Error::Closed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Receives request and error events from a front-end.
pub trait RequestObserver: Send + Sync {
    fn on_request(&self, event: &RequestEvent<'_>);
    fn on_error(&self, event: &ErrorEvent<'_>);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RequestObserver for TracingObserver {
    fn on_request(&self, event: &RequestEvent<'_>) {
        tracing::debug!(
            network = %event.network,
            src = %event.source,
            dst = event.destination,
            action = %event.decision.describe(),
            "request"
        );
    }

    fn on_error(&self, event: &ErrorEvent<'_>) {
        if event.is_benign() {
            tracing::debug!(
                network = %event.network,
                src = %event.source,
                dst = event.destination,
                reason = %event.error,
                "flow closed"
            );
        } else {
            tracing::info!(
                network = %event.network,
                src = %event.source,
                dst = event.destination,
                error = %event.error,
                "request error"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(error: &Error) -> ErrorEvent<'_> {
        ErrorEvent {
            network: Network::Tcp,
            source: "127.0.0.1:40000".parse().unwrap(),
            destination: "example.com:443",
            error,
        }
    }

    #[test]
    fn test_timeouts_and_eof_are_benign() {
        assert!(event(&Error::DeadlineExceeded).is_benign());
        assert!(event(&Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof))).is_benign());
    }

    #[test]
    fn test_connect_failure_is_not_benign() {
        let err = Error::ConnectFailed {
            addr: "example.com:443".to_string(),
            message: "refused".to_string(),
        };
        assert!(!event(&err).is_benign());
    }

    #[test]
    fn test_network_display() {
        assert_eq!(Network::Tcp.to_string(), "tcp");
        assert_eq!(Network::Udp.to_string(), "udp");
    }
}
