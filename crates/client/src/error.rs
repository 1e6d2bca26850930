//! Error types for the client.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::ProtocolError;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Main error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error status.
    #[error("{0}")]
    Service(String),

    /// Could not establish a connection.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// Address dialed.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wire protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The call did not complete in time.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The connection dropped before a response arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The client was closed by the caller.
    #[error("Client is shut down")]
    Shutdown,

    /// Service discovery has no server for the service.
    #[error("No server available for service {0}")]
    NoServer(String),

    /// The circuit breaker refused the call.
    #[error("Circuit breaker is open")]
    BreakerOpen,

    /// An address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The TLS handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Outcome of a call shared between deduplicated callers.
    #[error(transparent)]
    Shared(Arc<ClientError>),
}

impl ClientError {
    /// True if the server processed the call and reported an error.
    ///
    /// Such failures are returned to the caller as is; fail modes never
    /// retry them.
    #[must_use]
    pub fn is_service_error(&self) -> bool {
        match self {
            Self::Service(_) => true,
            Self::Shared(inner) => inner.is_service_error(),
            _ => false,
        }
    }

    /// The server's error message, if this is a service error.
    #[must_use]
    pub fn service_message(&self) -> Option<&str> {
        match self {
            Self::Service(message) => Some(message),
            Self::Shared(inner) => inner.service_message(),
            _ => None,
        }
    }
}
