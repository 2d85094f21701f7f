//! Error types for the data plane.

use std::io;
use thiserror::Error;

/// Errors that can occur while intercepting and forwarding traffic.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    AcceptConnection(#[source] io::Error),

    /// Failed to recover a connection's original destination.
    #[error("failed to recover original destination: {0}")]
    OriginalDst(#[source] io::Error),

    /// No service is registered for the recovered destination.
    #[error("no service registered for {addr}:{port}")]
    ServiceNotFound { addr: String, port: u16 },

    /// The service's port table names a protocol the proxy cannot forward.
    #[error("protocol {0} is not supported")]
    UnsupportedProtocol(String),

    /// Failed to connect to a backend instance.
    #[error("failed to connect to backend {addr}: {source}")]
    BackendConnect { addr: String, source: io::Error },

    /// Backend did not accept the connection within the dial timeout.
    #[error("backend {addr} did not accept within {duration_ms}ms")]
    DialTimeout { addr: String, duration_ms: u64 },

    /// No backend instance is available for the service.
    #[error("no instance available for service {service}")]
    NoInstance { service: String },

    /// The routing policy names a hash-key source the proxy cannot serve.
    #[error("unsupported hash key source: {0}")]
    UnsupportedHashKey(String),

    /// A request could not be parsed off the wire.
    #[error("malformed http request: {0}")]
    MalformedRequest(String),

    /// No virtual-service rule matched the request URI.
    #[error("no route matched uri {uri}")]
    RouteNotFound { uri: String },

    /// HTTP protocol error (admin surface).
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Request or relay exceeded its deadline.
    #[error("timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

impl ProxyError {
    /// Whether this error is an expected end-of-conversation rather than a
    /// failure worth logging at error severity: remote resets, normal closes
    /// and idle timeouts all end a relay without anything going wrong. A
    /// dial timeout is not benign; the backend never answered.
    pub fn is_benign(&self) -> bool {
        match self {
            ProxyError::Timeout { .. } => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
