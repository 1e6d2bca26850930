//! Error types for the server.

use std::io;
use std::time::Duration;
use tether_protocol::ProtocolError;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Main error type for server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wire protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Service registration failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Accept kept failing past the longest backoff.
    #[error("Accept failed after backing off {delay:?}: {source}")]
    AcceptFailed {
        /// Last backoff tried.
        delay: Duration,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The server was shut down or closed.
    #[error("Server closed")]
    Closed,

    /// In-flight calls did not finish before the shutdown deadline.
    #[error("Shutdown deadline of {deadline:?} passed with {in_flight} calls in flight")]
    DrainTimeout {
        /// Deadline given by the caller.
        deadline: Duration,
        /// Calls still running when it passed.
        in_flight: usize,
    },

    /// A plugin hook refused the operation.
    #[error("Plugin error: {0}")]
    Plugin(String),
}

/// Errors raised while registering services.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Service or method name is empty.
    #[error("Service and method names must not be empty")]
    EmptyName,

    /// The service has no methods.
    #[error("Service {0} has no methods")]
    NoMethods(String),

    /// A method name was used twice in one service.
    #[error("Method {method} registered twice on service {service}")]
    DuplicateMethod {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
    },
}

/// Per-request failures. Each becomes an error-status response.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No service under the requested path.
    #[error("can not find service {0}")]
    ServiceNotFound(String),

    /// The service has no method or function with that name.
    #[error("can not find method {method} of service {service}")]
    MethodNotFound {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
    },

    /// The serializer tag cannot be used with this method.
    #[error("unsupported serialize type {0}")]
    UnsupportedSerializer(u8),

    /// The request payload did not decode.
    #[error("failed to decode request: {0}")]
    Decode(String),

    /// The reply did not encode.
    #[error("failed to encode reply: {0}")]
    Encode(String),

    /// The handler returned an error.
    #[error("{0}")]
    Handler(String),

    /// A plugin hook rejected the request.
    #[error("{0}")]
    Hook(String),

    /// The authentication hook rejected the token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

/// Error returned by service handlers.
///
/// Travels back to the caller as the error message of the response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ServiceError(String);

impl ServiceError {
    /// Create a service error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for ServiceError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ServiceError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}
