//! Payload serializers selected by the header's serializer tag.

use crate::error::{ProtocolError, Result};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Serializer named by byte 3 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SerializeType {
    /// Payload bytes are passed through untouched. Only raw handlers accept it.
    Raw = 0,
    /// JSON via `serde_json`.
    #[default]
    Json = 1,
    /// Protocol Buffers. Recognised on the wire, not built in.
    Protobuf = 2,
    /// MessagePack. Recognised on the wire, not built in.
    MsgPack = 3,
    /// CBOR via `ciborium`.
    Cbor = 4,
}

impl TryFrom<u8> for SerializeType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Json),
            2 => Ok(Self::Protobuf),
            3 => Ok(Self::MsgPack),
            4 => Ok(Self::Cbor),
            other => Err(ProtocolError::UnsupportedSerializer(other)),
        }
    }
}

impl SerializeType {
    /// Whether typed values can be encoded and decoded with this tag.
    #[must_use]
    pub const fn is_typed(self) -> bool {
        matches!(self, Self::Json | Self::Cbor)
    }

    /// Encode a value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedSerializer`] for tags without a
    /// typed codec, or a serialization error.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        match self {
            Self::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| ProtocolError::SerializationFailed(e.to_string())),
            Self::Cbor => {
                let mut vec = Vec::new();
                ciborium::ser::into_writer(value, &mut vec)?;
                Ok(Bytes::from(vec))
            }
            Self::Raw | Self::Protobuf | Self::MsgPack => {
                Err(ProtocolError::UnsupportedSerializer(self as u8))
            }
        }
    }

    /// Decode a value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedSerializer`] for tags without a
    /// typed codec, or a deserialization error.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            Self::Json => serde_json::from_slice(data)
                .map_err(|e| ProtocolError::DeserializationFailed(e.to_string())),
            Self::Cbor => Ok(ciborium::de::from_reader(data)?),
            Self::Raw | Self::Protobuf | Self::MsgPack => {
                Err(ProtocolError::UnsupportedSerializer(self as u8))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_typed_codecs() {
        for serialize in [SerializeType::Json, SerializeType::Cbor] {
            let encoded = serialize.encode(&Args { a: 7, b: 8 }).unwrap();
            let decoded: Args = serialize.decode(&encoded).unwrap();
            assert_eq!(decoded, Args { a: 7, b: 8 });
        }
    }

    #[test]
    fn test_untyped_tags_are_unsupported() {
        let err = SerializeType::MsgPack.encode(&1u8).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedSerializer(3)));
        assert!(matches!(
            SerializeType::try_from(9),
            Err(ProtocolError::UnsupportedSerializer(9))
        ));
    }

    #[test]
    fn test_decode_error() {
        let result: Result<Args> = SerializeType::Json.decode(b"{not json");
        assert!(matches!(result, Err(ProtocolError::DeserializationFailed(_))));
    }
}
