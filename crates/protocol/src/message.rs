//! The unit of wire exchange.

use crate::header::{Header, MessageStatus, MessageType};

use bytes::Bytes;
use indexmap::IndexMap;

/// Ordered string key/value pairs carried end-to-end.
pub type Metadata = IndexMap<String, String>;

/// Metadata key holding the authentication token.
pub const AUTH_KEY: &str = "__AUTH";

/// Metadata key holding the error message of a failed call.
pub const SERVICE_ERROR: &str = "__tether_error__";

/// A request or response frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Fixed header.
    pub header: Header,
    /// Service the call is routed to.
    pub service_path: String,
    /// Method within the service.
    pub service_method: String,
    /// End-to-end metadata.
    pub metadata: Metadata,
    /// Serialized (and, on the wire, possibly compressed) body.
    pub payload: Bytes,
}

impl Message {
    /// A blank request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A request addressed to `service_path.service_method`.
    #[must_use]
    pub fn request(service_path: impl Into<String>, service_method: impl Into<String>) -> Self {
        Self {
            service_path: service_path.into(),
            service_method: service_method.into(),
            ..Self::default()
        }
    }

    /// Start a response to this request.
    ///
    /// The header is copied (sequence, serializer, flags) with the kind
    /// flipped to response; metadata and payload start empty.
    #[must_use]
    pub fn response(&self) -> Self {
        let mut header = self.header;
        header.set_message_type(MessageType::Response);
        header.set_status(MessageStatus::Normal);
        Self {
            header,
            service_path: self.service_path.clone(),
            service_method: self.service_method.clone(),
            metadata: Metadata::new(),
            payload: Bytes::new(),
        }
    }

    /// Mark this frame as failed with `reason`.
    pub fn set_error(&mut self, reason: impl Into<String>) {
        self.header.set_status(MessageStatus::Error);
        self.metadata.insert(SERVICE_ERROR.to_string(), reason.into());
    }

    /// The failure reason if the status is [`MessageStatus::Error`].
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self.header.status() {
            MessageStatus::Normal => None,
            MessageStatus::Error => Some(
                self.metadata
                    .get(SERVICE_ERROR)
                    .map_or("unknown error", String::as_str),
            ),
        }
    }

    /// Clear every field for reuse, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.header.clear();
        self.service_path.clear();
        self.service_method.clear();
        self.metadata.clear();
        self.payload = Bytes::new();
    }

    /// Size of the metadata block on the wire.
    #[must_use]
    pub fn metadata_len(&self) -> usize {
        self.metadata
            .iter()
            .map(|(key, value)| 8 + key.len() + value.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_keeps_correlation() {
        let mut request = Message::request("Arith", "Mul");
        request.header.set_seq(42);
        request.header.set_oneway(true);
        request.metadata.insert("trace".into(), "abc".into());

        let response = request.response();
        assert_eq!(response.header.message_type(), MessageType::Response);
        assert_eq!(response.header.seq(), 42);
        assert!(response.header.is_oneway());
        assert_eq!(response.service_method, "Mul");
        assert!(response.metadata.is_empty());
    }

    #[test]
    fn test_error_status() {
        let mut response = Message::request("Arith", "Mul").response();
        assert_eq!(response.error(), None);

        response.set_error("division by zero");
        assert_eq!(response.header.status(), MessageStatus::Error);
        assert_eq!(response.error(), Some("division by zero"));
    }
}
