//! Integration tests driving the server over raw framed TCP connections

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_protocol::{
    AUTH_KEY, CompressType, FrameCodec, Message, MessageStatus, MessageType, SerializeType,
};
use tether_server::{
    Context, Plugin, Server, ServerConfig, ServerError, ServiceBuilder, ServiceError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;
use tokio_util::codec::Framed;

#[derive(Debug, Serialize, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

type Client = Framed<TcpStream, FrameCodec>;

fn test_server(config: ServerConfig, hits: Arc<AtomicUsize>) -> Server {
    let server = Server::new(config);
    server
        .register(
            ServiceBuilder::new("Arith")
                .method("Mul", |ctx: Context, args: Args| async move {
                    ctx.set_response_metadata("handled-by", "arith");
                    Ok::<_, ServiceError>(args.a * args.b)
                })
                .method("Slow", |_ctx: Context, millis: u64| async move {
                    sleep(Duration::from_millis(millis)).await;
                    Ok::<_, ServiceError>(millis)
                })
                .method("Count", move |_ctx: Context, (): ()| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ServiceError>(())
                    }
                })
                .method("Panic", |_ctx: Context, (): ()| async move {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok::<_, ServiceError>(())
                })
                .raw_method("Echo", |_ctx: Context, payload: Bytes| async move {
                    Ok(payload)
                }),
        )
        .expect("Failed to register service");
    server
}

async fn start(server: &Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address");
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.expect("Failed to connect");
    Framed::new(stream, FrameCodec::default())
}

fn request<T: Serialize>(seq: u64, method: &str, args: &T) -> Message {
    let mut message = Message::request("Arith", method);
    message.header.set_seq(seq);
    message.header.set_serialize_type(SerializeType::Json);
    message.payload = SerializeType::Json.encode(args).expect("Failed to encode");
    message
}

async fn recv(client: &mut Client) -> Message {
    timeout(Duration::from_secs(2), client.next())
        .await
        .expect("Timeout")
        .expect("Connection closed")
        .expect("Bad frame")
}

async fn wait_for_in_flight(server: &Server, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while server.in_flight() != expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("In-flight count never reached");
}

#[tokio::test]
async fn test_typed_call() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = test_server(ServerConfig::default(), Arc::default());
    let mut client = connect(start(&server).await).await;

    client
        .send(request(1, "Mul", &Args { a: 7, b: 8 }))
        .await
        .expect("Failed to send");
    let response = recv(&mut client).await;

    assert_eq!(response.header.message_type(), MessageType::Response);
    assert_eq!(response.header.status(), MessageStatus::Normal);
    assert_eq!(response.header.seq(), 1);
    assert_eq!(
        response.metadata.get("handled-by").map(String::as_str),
        Some("arith")
    );
    let product: i64 = SerializeType::Json.decode(&response.payload).unwrap();
    assert_eq!(product, 56);
}

#[tokio::test]
async fn test_dispatch_errors_keep_connection() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = test_server(ServerConfig::default(), Arc::default());
    let mut client = connect(start(&server).await).await;

    let mut unknown_service = request(1, "Mul", &Args { a: 1, b: 1 });
    unknown_service.service_path = "Nope".into();
    client.send(unknown_service).await.unwrap();
    let response = recv(&mut client).await;
    assert_eq!(response.header.status(), MessageStatus::Error);
    assert_eq!(response.error(), Some("can not find service Nope"));

    client.send(request(2, "Add", &())).await.unwrap();
    let response = recv(&mut client).await;
    assert_eq!(response.header.seq(), 2);
    assert!(response.error().unwrap().contains("can not find method Add"));

    let mut msgpack = request(3, "Mul", &Args { a: 1, b: 1 });
    msgpack.header.set_serialize_type(SerializeType::MsgPack);
    client.send(msgpack).await.unwrap();
    let response = recv(&mut client).await;
    assert_eq!(response.error(), Some("unsupported serialize type 3"));

    client.send(request(4, "Mul", &Args { a: 2, b: 3 })).await.unwrap();
    let response = recv(&mut client).await;
    assert_eq!(response.header.seq(), 4);
    assert_eq!(response.error(), None);
}

#[tokio::test]
async fn test_heartbeat_is_answered_in_place() {
    let server = test_server(ServerConfig::default(), Arc::default());
    let mut client = connect(start(&server).await).await;

    let mut ping = Message::new();
    ping.header.set_heartbeat(true);
    ping.header.set_seq(99);
    client.send(ping).await.unwrap();

    let pong = recv(&mut client).await;
    assert!(pong.header.is_heartbeat());
    assert_eq!(pong.header.message_type(), MessageType::Response);
    assert_eq!(pong.header.seq(), 99);
    assert!(pong.payload.is_empty());
}

#[tokio::test]
async fn test_oneway_gets_no_reply() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = test_server(ServerConfig::default(), Arc::clone(&hits));
    let mut client = connect(start(&server).await).await;

    let mut oneway = request(1, "Count", &());
    oneway.header.set_oneway(true);
    client.send(oneway).await.unwrap();
    client.send(request(2, "Count", &())).await.unwrap();

    let response = recv(&mut client).await;
    assert_eq!(response.header.seq(), 2);
    wait_for_in_flight(&server, 0).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auth_failure_closes_connection() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = test_server(ServerConfig::default(), Arc::default());
    server.set_auth(|_request, token| {
        if token == "secret" {
            Ok(())
        } else {
            Err("bad token".to_string())
        }
    });
    let addr = start(&server).await;

    let mut client = connect(addr).await;
    let mut authed = request(1, "Mul", &Args { a: 3, b: 3 });
    authed.metadata.insert(AUTH_KEY.into(), "secret".into());
    client.send(authed).await.unwrap();
    assert_eq!(recv(&mut client).await.error(), None);

    let mut intruder = connect(addr).await;
    intruder
        .send(request(1, "Mul", &Args { a: 3, b: 3 }))
        .await
        .unwrap();
    let response = recv(&mut intruder).await;
    assert_eq!(response.error(), Some("unauthorized: bad token"));

    let next = timeout(Duration::from_secs(2), intruder.next())
        .await
        .expect("Timeout");
    assert!(next.is_none() || next.is_some_and(|frame| frame.is_err()));
}

#[tokio::test]
async fn test_unsupported_compression_is_answered() {
    let server = test_server(ServerConfig::default(), Arc::default());
    let addr = start(&server).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let codec = FrameCodec::default();
    let mut frame = codec
        .encode_to_bytes(&request(5, "Mul", &Args { a: 1, b: 2 }))
        .unwrap()
        .to_vec();
    frame[2] = (frame[2] & !0x1C) | (5 << 2);
    stream.write_all(&frame).await.unwrap();

    let mut client = Framed::new(stream, FrameCodec::default());
    let response = recv(&mut client).await;
    assert_eq!(response.header.seq(), 5);
    assert_eq!(response.header.status(), MessageStatus::Error);
    assert_eq!(response.header.compress_type(), Some(CompressType::None));

    client.send(request(6, "Mul", &Args { a: 2, b: 2 })).await.unwrap();
    assert_eq!(recv(&mut client).await.header.seq(), 6);
}

#[tokio::test]
async fn test_bad_magic_closes_connection() {
    let server = test_server(ServerConfig::default(), Arc::default());
    let addr = start(&server).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut client = Framed::new(stream, FrameCodec::default());
    let next = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("Timeout");
    assert!(next.is_none() || next.is_some_and(|frame| frame.is_err()));
}

#[tokio::test]
async fn test_compressed_response() {
    let server = test_server(ServerConfig::default(), Arc::default());
    let mut client = connect(start(&server).await).await;

    let mut echo = Message::request("Arith", "Echo");
    echo.header.set_seq(1);
    echo.header.set_serialize_type(SerializeType::Raw);
    echo.header.set_compress_type(CompressType::Gzip);
    echo.payload = Bytes::from("tether ".repeat(1000));
    client.send(echo.clone()).await.unwrap();

    let response = recv(&mut client).await;
    assert_eq!(response.header.compress_type(), Some(CompressType::Gzip));
    assert_eq!(response.payload, echo.payload);
}

#[tokio::test]
async fn test_panic_only_kills_its_connection() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = test_server(ServerConfig::default(), Arc::default());
    let addr = start(&server).await;
    let mut victim = connect(addr).await;
    let mut bystander = connect(addr).await;

    victim.send(request(1, "Panic", &())).await.unwrap();
    let next = timeout(Duration::from_secs(2), victim.next())
        .await
        .expect("Timeout");
    assert!(next.is_none() || next.is_some_and(|frame| frame.is_err()));

    bystander
        .send(request(2, "Mul", &Args { a: 4, b: 5 }))
        .await
        .unwrap();
    let product: i64 = SerializeType::Json
        .decode(&recv(&mut bystander).await.payload)
        .unwrap();
    assert_eq!(product, 20);
    assert_eq!(server.in_flight(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_calls() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ServerConfig::default().with_drain_poll_interval(Duration::from_millis(10));
    let server = test_server(config, Arc::default());
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&shutdowns);
    server.on_shutdown(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut client = connect(start(&server).await).await;
    client.send(request(1, "Slow", &200u64)).await.unwrap();
    wait_for_in_flight(&server, 1).await;

    let first = tokio::spawn({
        let server = server.clone();
        async move { server.shutdown(Duration::from_secs(5)).await }
    });
    let second = tokio::spawn({
        let server = server.clone();
        async move { server.shutdown(Duration::from_secs(5)).await }
    });

    let response = recv(&mut client).await;
    assert_eq!(response.header.seq(), 1);
    assert_eq!(response.error(), None);

    assert_ok!(first.await.unwrap());
    assert_ok!(second.await.unwrap());
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(server.in_flight(), 0);
    assert_eq!(server.active_connections(), 0);

    let next = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("Timeout");
    assert!(next.is_none() || next.is_some_and(|frame| frame.is_err()));
}

#[tokio::test]
async fn test_shutdown_deadline() {
    let config = ServerConfig::default().with_drain_poll_interval(Duration::from_millis(10));
    let server = test_server(config, Arc::default());
    let mut client = connect(start(&server).await).await;

    client.send(request(1, "Slow", &5_000u64)).await.unwrap();
    wait_for_in_flight(&server, 1).await;

    let result = server.shutdown(Duration::from_millis(100)).await;
    assert!(matches!(
        result,
        Err(ServerError::DrainTimeout { in_flight: 1, .. })
    ));
    assert!(server.is_shutting_down());
}

#[tokio::test]
async fn test_close_is_immediate() {
    let server = test_server(ServerConfig::default(), Arc::default());
    let mut client = connect(start(&server).await).await;

    client.send(request(1, "Slow", &5_000u64)).await.unwrap();
    wait_for_in_flight(&server, 1).await;

    timeout(Duration::from_secs(1), server.close())
        .await
        .expect("Close blocked");
    timeout(Duration::from_secs(1), server.closed())
        .await
        .expect("Done signal not fired");

    let next = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("Timeout");
    assert!(next.is_none() || next.is_some_and(|frame| frame.is_err()));
}

struct Gatekeeper {
    accepted: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Plugin for Gatekeeper {
    fn post_conn_accept(&self, _peer: SocketAddr) -> bool {
        self.accepted.fetch_add(1, Ordering::SeqCst) == 0
    }

    fn post_conn_close(&self, _peer: SocketAddr) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_plugin_rejects_connections() {
    let server = test_server(ServerConfig::default(), Arc::default());
    let closed = Arc::new(AtomicUsize::new(0));
    server.add_plugin(Arc::new(Gatekeeper {
        accepted: AtomicUsize::new(0),
        closed: Arc::clone(&closed),
    }));
    let addr = start(&server).await;

    let mut first = connect(addr).await;
    first
        .send(request(1, "Mul", &Args { a: 1, b: 1 }))
        .await
        .unwrap();
    assert_eq!(recv(&mut first).await.error(), None);

    let mut second = connect(addr).await;
    let next = timeout(Duration::from_secs(2), second.next())
        .await
        .expect("Timeout");
    assert!(next.is_none() || next.is_some_and(|frame| frame.is_err()));

    drop(first);
    timeout(Duration::from_secs(2), async {
        while closed.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("post_conn_close never ran");
}

/// Copies the request's `trace` metadata onto every response.
struct TraceEcho;

#[async_trait::async_trait]
impl Plugin for TraceEcho {
    async fn pre_write_response(
        &self,
        request: &Message,
        response: &mut Message,
    ) -> Result<(), String> {
        if let Some(trace) = request.metadata.get("trace") {
            response.metadata.insert("trace".into(), trace.clone());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_response_hook_sees_request_metadata() {
    let server = test_server(ServerConfig::default(), Arc::default());
    server.add_plugin(Arc::new(TraceEcho));
    let mut client = connect(start(&server).await).await;

    let mut call = request(1, "Mul", &Args { a: 2, b: 3 });
    call.metadata.insert("trace".into(), "t-42".into());
    assert_ok!(client.send(call).await);

    let response = recv(&mut client).await;
    assert_eq!(response.error(), None);
    assert_eq!(response.metadata.get("trace").map(String::as_str), Some("t-42"));
    assert_eq!(
        response.metadata.get("handled-by").map(String::as_str),
        Some("arith")
    );
}
