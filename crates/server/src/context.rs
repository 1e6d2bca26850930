//! Per-request context handed to handlers and hooks.

use crate::plugin::PluginContainer;

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_protocol::{AUTH_KEY, Message, Metadata};

struct ContextInner {
    peer: SocketAddr,
    conn_id: u64,
    seq: u64,
    oneway: bool,
    service_path: String,
    service_method: String,
    received_at: Instant,
    metadata: Metadata,
    response_metadata: Mutex<Metadata>,
    plugins: PluginContainer,
}

/// Request-scoped data: who called, what they sent, and what to send back.
///
/// Cloning is cheap; clones share the response metadata.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Build a context for `request`, copying its metadata.
    pub(crate) fn from_request(
        peer: SocketAddr,
        conn_id: u64,
        request: &Message,
        plugins: PluginContainer,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                peer,
                conn_id,
                seq: request.header.seq(),
                oneway: request.header.is_oneway(),
                service_path: request.service_path.clone(),
                service_method: request.service_method.clone(),
                received_at: Instant::now(),
                metadata: request.metadata.clone(),
                response_metadata: Mutex::new(Metadata::new()),
                plugins,
            }),
        }
    }

    /// Address of the remote end.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Server-assigned connection id.
    #[must_use]
    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    /// Sequence number of the request.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    /// Whether the caller expects no reply.
    #[must_use]
    pub fn is_oneway(&self) -> bool {
        self.inner.oneway
    }

    /// Service the request was routed to.
    #[must_use]
    pub fn service_path(&self) -> &str {
        &self.inner.service_path
    }

    /// Method the request was routed to.
    #[must_use]
    pub fn service_method(&self) -> &str {
        &self.inner.service_method
    }

    /// Time since the request was read.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.received_at.elapsed()
    }

    /// Request metadata.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    /// Look up one request metadata value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.metadata.get(key).map(String::as_str)
    }

    /// Authentication token sent by the caller, empty if none.
    #[must_use]
    pub fn auth_token(&self) -> &str {
        self.get(AUTH_KEY).unwrap_or_default()
    }

    /// Add a metadata pair to the response.
    pub fn set_response_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .response_metadata
            .lock()
            .insert(key.into(), value.into());
    }

    /// Snapshot of the response metadata set so far.
    #[must_use]
    pub fn response_metadata(&self) -> Metadata {
        self.inner.response_metadata.lock().clone()
    }

    pub(crate) fn take_response_metadata(&self) -> Metadata {
        std::mem::take(&mut *self.inner.response_metadata.lock())
    }

    pub(crate) fn plugins(&self) -> &PluginContainer {
        &self.inner.plugins
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("peer", &self.inner.peer)
            .field("seq", &self.inner.seq)
            .field("service_path", &self.inner.service_path)
            .field("service_method", &self.inner.service_method)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_context(service_path: &str, service_method: &str, metadata: Metadata) -> Context {
    let mut request = Message::request(service_path, service_method);
    request.metadata = metadata;
    Context::from_request(
        SocketAddr::from(([127, 0, 0, 1], 4000)),
        0,
        &mut request,
        PluginContainer::default(),
    )
}
