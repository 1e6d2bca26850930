//! Multiplexed connection to a single server endpoint.
//!
//! Every call gets a sequence number and a pending slot; a background reader
//! task routes responses back to their slot, so any number of calls can be
//! in flight on one connection.

use crate::breaker::Breaker;
use crate::error::{ClientError, Result};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tether_protocol::{
    BufferPool, CodecConfig, CompressType, DEFAULT_COMPRESS_THRESHOLD, FrameCodec, MAX_BODY_LEN,
    Message, MessagePool, MessageType, Metadata, PoolConfig, ProtocolError, SerializeType,
    TolerantCodec,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::oneshot;
use tokio::time::{interval, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = DashMap<u64, oneshot::Sender<Result<Message>>>;

/// Builds one breaker per endpoint.
pub type BreakerFactory = Arc<dyn Fn() -> Arc<dyn Breaker> + Send + Sync>;

/// Configuration for clients.
#[derive(Clone)]
pub struct ClientConfig {
    /// Longest time to establish a connection (TLS handshake included).
    pub connect_timeout: Duration,
    /// Longest wait for a response. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Serializer for typed calls.
    pub serialize_type: SerializeType,
    /// Compression requested for request and response payloads.
    pub compress_type: CompressType,
    /// Payloads at or below this size are sent uncompressed.
    pub compress_threshold: usize,
    /// Send heartbeats on idle connections.
    pub heartbeat: bool,
    /// Period between heartbeats.
    pub heartbeat_interval: Duration,
    /// Dial TLS with this configuration instead of plain TCP.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Name to verify the server certificate against. Defaults to the host
    /// part of the address.
    pub tls_server_name: Option<String>,
    /// Maximum accepted frame body.
    pub max_body_len: usize,
    /// Extra attempts for the retrying fail modes.
    pub retries: usize,
    /// Only use servers whose metadata carries this `group`.
    pub group: Option<String>,
    /// How long Failbackup waits before racing a second server.
    pub backup_latency: Duration,
    /// Per-endpoint circuit breakers.
    pub breaker: Option<BreakerFactory>,
    /// Buffer and message pooling.
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: None,
            serialize_type: SerializeType::Json,
            compress_type: CompressType::None,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            heartbeat: false,
            heartbeat_interval: Duration::from_secs(30),
            tls: None,
            tls_server_name: None,
            max_body_len: MAX_BODY_LEN,
            retries: 3,
            group: None,
            backup_latency: Duration::from_millis(10),
            breaker: None,
            pool: PoolConfig::default(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("serialize_type", &self.serialize_type)
            .field("compress_type", &self.compress_type)
            .field("heartbeat", &self.heartbeat)
            .field("tls", &self.tls.is_some())
            .field("retries", &self.retries)
            .field("group", &self.group)
            .field("backup_latency", &self.backup_latency)
            .field("breaker", &self.breaker.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = Some(call_timeout);
        self
    }

    /// Set the serializer.
    #[must_use]
    pub const fn with_serialize_type(mut self, serialize_type: SerializeType) -> Self {
        self.serialize_type = serialize_type;
        self
    }

    /// Request compressed payloads.
    #[must_use]
    pub const fn with_compress_type(mut self, compress_type: CompressType) -> Self {
        self.compress_type = compress_type;
        self
    }

    /// Send a heartbeat every `interval`.
    #[must_use]
    pub const fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = true;
        self.heartbeat_interval = interval;
        self
    }

    /// Dial TLS.
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the retry count.
    #[must_use]
    pub const fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Restrict to servers in `group`.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the Failbackup latency.
    #[must_use]
    pub const fn with_backup_latency(mut self, backup_latency: Duration) -> Self {
        self.backup_latency = backup_latency;
        self
    }

    /// Wrap every attempt in a breaker built by `factory`.
    #[must_use]
    pub fn with_breaker<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Breaker> + Send + Sync + 'static,
    {
        self.breaker = Some(Arc::new(factory));
        self
    }

    /// Set pooling options.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new(
            CodecConfig::default()
                .with_max_body_len(self.max_body_len)
                .with_compress_threshold(self.compress_threshold),
            BufferPool::new(&self.pool),
            MessagePool::new(&self.pool),
        )
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Metadata set by the server.
    pub metadata: Metadata,
    /// Encoded reply body.
    pub payload: Bytes,
    /// Serializer the body was encoded with.
    pub serialize_type: SerializeType,
}

impl Reply {
    /// Decode the body.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the body does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(self.serialize_type.decode(&self.payload)?)
    }
}

/// A call whose request has been written.
///
/// Dropping it abandons the call; a late response is discarded.
#[must_use = "a pending call does nothing unless waited on"]
pub struct PendingCall {
    seq: u64,
    rx: oneshot::Receiver<Result<Message>>,
    pending: Arc<PendingMap>,
    messages: MessagePool,
    timeout: Option<Duration>,
}

impl PendingCall {
    /// Sequence number of the request.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Service`] if the server reported an error,
    /// [`ClientError::Timeout`] past the call timeout, or
    /// [`ClientError::ConnectionClosed`] if the connection dropped first.
    pub async fn wait(mut self) -> Result<Reply> {
        let received = match self.timeout {
            Some(deadline) => match timeout(deadline, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => return Err(ClientError::Timeout(deadline)),
            },
            None => (&mut self.rx).await,
        };
        let message = received.map_err(|_| ClientError::ConnectionClosed)??;
        into_reply(message, &self.messages)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.pending.remove(&self.seq);
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

fn into_reply(mut message: Message, messages: &MessagePool) -> Result<Reply> {
    if let Some(reason) = message.error() {
        let error = ClientError::Service(reason.to_owned());
        messages.put(message);
        return Err(error);
    }
    let serialize_type = message.header.serialize_type()?;
    let reply = Reply {
        metadata: std::mem::take(&mut message.metadata),
        payload: std::mem::take(&mut message.payload),
        serialize_type,
    };
    messages.put(message);
    Ok(reply)
}

struct ClientInner {
    addr: String,
    config: ClientConfig,
    codec: FrameCodec,
    writer: AsyncMutex<FramedWrite<BoxedWriter, FrameCodec>>,
    pending: Arc<PendingMap>,
    next_seq: AtomicU64,
    closing: AtomicBool,
    shutdown: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Client for one server endpoint.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Connect to `addr` (`host:port`, optionally prefixed `tcp@`).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if dialing fails or times out, and
    /// [`ClientError::Tls`] if the handshake fails.
    #[instrument(skip(config))]
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self> {
        let target = strip_network(addr);
        let connect_error = |source: io::Error| ClientError::Connect {
            addr: addr.to_string(),
            source,
        };

        let stream = match timeout(config.connect_timeout, TcpStream::connect(target)).await {
            Ok(stream) => stream.map_err(connect_error)?,
            Err(_) => {
                return Err(connect_error(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )));
            }
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = split_stream(stream, target, &config).await?;
        let codec = config.codec();

        let inner = Arc::new(ClientInner {
            addr: addr.to_string(),
            writer: AsyncMutex::new(FramedWrite::new(writer, codec.clone())),
            codec,
            config,
            pending: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            stop: CancellationToken::new(),
        });

        tokio::spawn(read_loop(
            addr.to_string(),
            reader,
            TolerantCodec::new(inner.codec.clone()),
            Arc::clone(&inner.pending),
            Arc::clone(&inner.shutdown),
            inner.stop.clone(),
        ));
        if inner.config.heartbeat {
            tokio::spawn(heartbeat_loop(Arc::downgrade(&inner)));
        }

        debug!("Connected to {addr}");
        Ok(Self { inner })
    }

    /// The address this client dialed.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Call `service_path.service_method` with a typed argument and decode
    /// the typed reply.
    ///
    /// # Errors
    ///
    /// Returns encoding, transport, timeout or service errors.
    pub async fn call<Req, Resp>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = self.inner.config.serialize_type.encode(args)?;
        self.invoke(service_path, service_method, Metadata::new(), payload)
            .await?
            .decode()
    }

    /// Call with an already encoded payload and explicit metadata.
    ///
    /// # Errors
    ///
    /// Returns transport, timeout or service errors.
    pub async fn invoke(
        &self,
        service_path: &str,
        service_method: &str,
        metadata: Metadata,
        payload: Bytes,
    ) -> Result<Reply> {
        self.go(service_path, service_method, metadata, payload)
            .await?
            .wait()
            .await
    }

    /// Write a request and return without waiting for the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is shut down or the write fails.
    pub async fn go(
        &self,
        service_path: &str,
        service_method: &str,
        metadata: Metadata,
        payload: Bytes,
    ) -> Result<PendingCall> {
        let request = self.request(service_path, service_method, metadata, payload);
        self.send_raw(request).await
    }

    /// Send a one-way request; no response is sent or awaited.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is shut down or the write fails.
    pub async fn send(
        &self,
        service_path: &str,
        service_method: &str,
        metadata: Metadata,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut request = self.request(service_path, service_method, metadata, payload);
        request.header.set_oneway(true);
        request.header.set_seq(self.next_seq());
        self.write(request).await
    }

    /// Send a prepared request frame and register for its response.
    ///
    /// The sequence number is assigned here; any set by the caller is
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is shut down or the write fails.
    pub async fn send_raw(&self, mut request: Message) -> Result<PendingCall> {
        self.ensure_open()?;
        let seq = self.next_seq();
        request.header.set_seq(seq);
        request.header.set_message_type(MessageType::Request);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(seq, tx);
        let call = PendingCall {
            seq,
            rx,
            pending: Arc::clone(&self.inner.pending),
            messages: self.inner.codec.messages().clone(),
            timeout: self.inner.config.call_timeout,
        };
        // The reader may have failed every pending call before the insert.
        if self.is_shutdown() {
            return Err(ClientError::ConnectionClosed);
        }

        self.write(request).await?;
        Ok(call)
    }

    /// Send a heartbeat and wait for the echo.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is down or the echo times out.
    pub async fn heartbeat(&self) -> Result<Duration> {
        let mut ping = self.inner.codec.messages().get();
        ping.header.set_heartbeat(true);
        ping.header.set_serialize_type(self.inner.config.serialize_type);

        let started = Instant::now();
        let call = self.send_raw(ping).await?;
        call.wait().await?;
        Ok(started.elapsed())
    }

    /// Close the connection. Pending calls fail with
    /// [`ClientError::ConnectionClosed`].
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing client for {}", self.inner.addr);
        self.inner.stop.cancel();

        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = SinkExt::<Message>::close(&mut *writer).await {
            debug!("Error closing connection to {}: {e}", self.inner.addr);
        }
    }

    /// True once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// True once the connection is gone, for whatever reason.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Calls still waiting for a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closing() {
            return Err(ClientError::Shutdown);
        }
        if self.is_shutdown() {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn request(
        &self,
        service_path: &str,
        service_method: &str,
        metadata: Metadata,
        payload: Bytes,
    ) -> Message {
        let mut request = self.inner.codec.messages().get();
        request.header.set_serialize_type(self.inner.config.serialize_type);
        request.header.set_compress_type(self.inner.config.compress_type);
        request.service_path.push_str(service_path);
        request.service_method.push_str(service_method);
        request.metadata = metadata;
        request.payload = payload;
        request
    }

    async fn write(&self, message: Message) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        match writer.send(message).await {
            Ok(()) => Ok(()),
            Err(e @ ProtocolError::MessageTooLarge { .. }) => Err(e.into()),
            Err(e) => {
                warn!("Write to {} failed: {e}", self.inner.addr);
                self.mark_shutdown();
                Err(e.into())
            }
        }
    }

    fn mark_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.stop.cancel();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("addr", &self.inner.addr)
            .field("pending", &self.pending())
            .field("closing", &self.is_closing())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Routes responses to pending calls until the connection ends, then fails
/// whatever is left.
async fn read_loop(
    addr: String,
    reader: BoxedReader,
    codec: TolerantCodec,
    pending: Arc<PendingMap>,
    shutdown: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let mut frames = FramedRead::new(reader, codec);

    loop {
        let next = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            None => {
                debug!("Connection to {addr} closed by server");
                break;
            }
            Some(Err(e)) => {
                warn!("Dropping connection to {addr}: {e}");
                break;
            }
            Some(Ok(Err(e))) => {
                let Some(seq) = e.frame_header().map(|header| header.seq()) else {
                    warn!("Unreadable frame from {addr}: {e}");
                    continue;
                };
                if let Some((_, tx)) = pending.remove(&seq) {
                    let _ = tx.send(Err(e.into()));
                }
            }
            Some(Ok(Ok(message))) => {
                if message.header.message_type() != MessageType::Response {
                    debug!("Ignoring request frame pushed by {addr}");
                    continue;
                }
                let seq = message.header.seq();
                match pending.remove(&seq) {
                    Some((_, tx)) => {
                        let _ = tx.send(Ok(message));
                    }
                    None => debug!("No pending call for response {seq} from {addr}"),
                }
            }
        }
    }

    shutdown.store(true, Ordering::Release);
    stop.cancel();

    let seqs: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for seq in seqs {
        if let Some((_, tx)) = pending.remove(&seq) {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
    }
}

async fn heartbeat_loop(inner: Weak<ClientInner>) {
    let Some(period) = inner.upgrade().map(|inner| inner.config.heartbeat_interval) else {
        return;
    };
    let mut ticker = interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let client = RpcClient { inner };
        if client.is_closing() || client.is_shutdown() {
            return;
        }

        match timeout(period, client.heartbeat()).await {
            Ok(Ok(rtt)) => debug!("Heartbeat to {} took {rtt:?}", client.addr()),
            Ok(Err(e)) => {
                warn!("Heartbeat to {} failed: {e}", client.addr());
                client.mark_shutdown();
                return;
            }
            Err(_) => {
                warn!("Heartbeat to {} timed out", client.addr());
                client.mark_shutdown();
                return;
            }
        }
    }
}

async fn split_stream(
    stream: TcpStream,
    target: &str,
    config: &ClientConfig,
) -> Result<(BoxedReader, BoxedWriter)> {
    let Some(tls) = config.tls.clone() else {
        let (reader, writer) = stream.into_split();
        return Ok((Box::new(reader), Box::new(writer)));
    };

    let host = config
        .tls_server_name
        .clone()
        .unwrap_or_else(|| host_of(target).to_string());
    let server_name =
        ServerName::try_from(host).map_err(|e| ClientError::InvalidAddress(e.to_string()))?;

    let connector = TlsConnector::from(tls);
    match timeout(config.connect_timeout, connector.connect(server_name, stream)).await {
        Ok(Ok(stream)) => {
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader), Box::new(writer)))
        }
        Ok(Err(e)) => Err(ClientError::Tls(e.to_string())),
        Err(_) => Err(ClientError::Tls("handshake timed out".to_string())),
    }
}

/// Strip a `network@` prefix from a discovery key.
fn strip_network(addr: &str) -> &str {
    addr.split_once('@').map_or(addr, |(_, rest)| rest)
}

fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}
