//! Wire protocol for the tether RPC framework.
//!
//! Every frame is a 12-byte bit-packed [`Header`], a big-endian body length,
//! and a body of length-prefixed fields followed by the payload.
//!
//! # Features
//!
//! - **Compact header**: Kind, heartbeat, one-way, compression and status
//!   flags share a single byte
//! - **Ordered metadata**: Arbitrary string pairs carried end-to-end
//! - **Transparent compression**: Gzip above a size threshold
//! - **Pooling**: Scratch buffers and messages are recycled
//!
//! # Example
//!
//! ```
//! use tether_protocol::{FrameCodec, Message, SerializeType};
//!
//! let codec = FrameCodec::default();
//! let mut request = Message::request("Arith", "Mul");
//! request.header.set_seq(1);
//! request.payload = SerializeType::Json.encode(&(7, 8)).unwrap();
//!
//! let frame = codec.encode_to_bytes(&request).unwrap();
//! let decoded = codec.decode_from_slice(&frame).unwrap();
//! assert_eq!(decoded.service_method, "Mul");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod compress;
pub mod error;
pub mod header;
pub mod message;
pub mod pool;
pub mod serialize;

pub use codec::{CodecConfig, FrameCodec, MAX_BODY_LEN, TolerantCodec};
pub use compress::{CompressType, DEFAULT_COMPRESS_THRESHOLD};
pub use error::{ProtocolError, Result};
pub use header::{HEADER_LEN, Header, MAGIC, MessageStatus, MessageType};
pub use message::{AUTH_KEY, Message, Metadata, SERVICE_ERROR};
pub use pool::{BufferPool, MessagePool, PoolConfig};
pub use serialize::SerializeType;

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
