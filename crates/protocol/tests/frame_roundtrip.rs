use bytes::{BufMut, Bytes, BytesMut};
use proptest::prelude::*;
use tether_protocol::{
    BufferPool, CodecConfig, CompressType, FrameCodec, Header, Message, MessagePool,
    MessageStatus, MessageType, ProtocolError, SerializeType,
};
use tokio_util::codec::Decoder;

fn message_strategy() -> impl Strategy<Value = Message> {
    (
        any::<u64>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        "[a-zA-Z]{0,16}",
        "[a-zA-Z]{0,16}",
        prop::collection::vec(("[a-z_]{1,8}", ".{0,12}"), 0..4),
        prop::collection::vec(any::<u8>(), 0..2048),
    )
        .prop_map(
            |(seq, response, heartbeat, oneway, failed, path, method, pairs, payload)| {
                let mut message = Message::request(path, method);
                message.header.set_seq(seq);
                message.header.set_heartbeat(heartbeat);
                message.header.set_oneway(oneway);
                message.header.set_serialize_type(SerializeType::Cbor);
                if response {
                    message.header.set_message_type(MessageType::Response);
                }
                if failed {
                    message.header.set_status(MessageStatus::Error);
                }
                for (key, value) in pairs {
                    message.metadata.insert(key, value);
                }
                message.payload = Bytes::from(payload);
                message
            },
        )
}

proptest! {
    #[test]
    fn frames_survive_the_wire(message in message_strategy()) {
        let codec = FrameCodec::default();
        let encoded = codec.encode_to_bytes(&message).unwrap();
        let decoded = codec.decode_from_slice(&encoded).unwrap();
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn compressed_frames_survive_the_wire(message in message_strategy()) {
        let codec = FrameCodec::new(
            CodecConfig::default().with_compress_threshold(16),
            BufferPool::default(),
            MessagePool::default(),
        );
        let mut message = message;
        message.header.set_compress_type(CompressType::Gzip);

        let encoded = codec.encode_to_bytes(&message).unwrap();
        let decoded = codec.decode_from_slice(&encoded).unwrap();
        prop_assert_eq!(decoded.payload, message.payload);
        prop_assert_eq!(decoded.metadata, message.metadata);
        prop_assert_eq!(decoded.header.seq(), message.header.seq());
    }
}

#[test]
fn test_stream_of_frames_in_chunks() {
    let mut codec = FrameCodec::default();
    let mut wire = BytesMut::new();
    for seq in 0..5u64 {
        let mut message = Message::request("Echo", "Say");
        message.header.set_seq(seq);
        message.payload = Bytes::from(format!("hello {seq}"));
        codec.encode_message(&message, &mut wire).unwrap();
    }

    let mut src = BytesMut::new();
    let mut seen = Vec::new();
    for chunk in wire.chunks(7) {
        src.put_slice(chunk);
        while let Some(message) = codec.decode(&mut src).unwrap() {
            seen.push(message.header.seq());
        }
    }

    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_corrupt_gzip_is_answerable() {
    let codec = FrameCodec::default();
    let mut header = Header::new();
    header.set_seq(9);
    header.set_compress_type(CompressType::Gzip);

    let mut src = BytesMut::new();
    src.put_slice(header.as_bytes());
    src.put_u32(12 + 4);
    src.put_u32(0);
    src.put_u32(0);
    src.put_u32(0);
    src.put_slice(b"junk");

    let err = codec.decode_message(&mut src).unwrap_err();
    assert!(matches!(err, ProtocolError::Decompression { .. }));
    assert!(!err.is_fatal());
    assert_eq!(err.frame_header().map(Header::seq), Some(9));
    assert!(src.is_empty());
}

#[test]
fn test_unlimited_body_length() {
    let codec = FrameCodec::new(
        CodecConfig::default().with_max_body_len(0),
        BufferPool::default(),
        MessagePool::default(),
    );
    let mut message = Message::request("Blob", "Put");
    message.payload = Bytes::from(vec![7u8; 64 * 1024]);

    let encoded = codec.encode_to_bytes(&message).unwrap();
    assert_eq!(codec.decode_from_slice(&encoded).unwrap().payload.len(), 64 * 1024);
}

#[test]
fn test_encoder_rejects_oversize_body() {
    let codec = FrameCodec::new(
        CodecConfig::default().with_max_body_len(32),
        BufferPool::default(),
        MessagePool::default(),
    );
    let mut message = Message::request("Blob", "Put");
    message.payload = Bytes::from(vec![0u8; 64]);

    assert!(matches!(
        codec.encode_to_bytes(&message),
        Err(ProtocolError::MessageTooLarge { max: 32, .. })
    ));
}
