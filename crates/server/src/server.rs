//! Connection management and request dispatch.

use crate::context::Context;
use crate::error::{DispatchError, RegistryError, Result, ServerError, ServiceError};
use crate::plugin::{Plugin, PluginContainer};
use crate::registry::{MethodDescriptor, Registry, ServiceBuilder};

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tether_protocol::{
    AUTH_KEY, BufferPool, CodecConfig, CompressType, DEFAULT_COMPRESS_THRESHOLD, FrameCodec,
    MAX_BODY_LEN, Message, MessagePool, MessageStatus, MessageType, PoolConfig, ProtocolError,
    TolerantCodec,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const INITIAL_ACCEPT_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

/// Authentication hook: `(request, token)`. The token is the `__AUTH`
/// metadata value, empty if absent.
pub type AuthFn = Arc<dyn Fn(&Message, &str) -> std::result::Result<(), String> + Send + Sync>;

type ShutdownHook = Box<dyn FnOnce(&Server) + Send>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<AsyncMutex<FramedWrite<BoxedWriter, FrameCodec>>>;

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Longest wait for the next frame on a connection. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Longest time one response write may take.
    pub write_timeout: Option<Duration>,
    /// Maximum accepted frame body.
    pub max_body_len: usize,
    /// Responses are compressed (when the request asked for it) above this size.
    pub compress_threshold: usize,
    /// How often shutdown checks the in-flight counter.
    pub drain_poll_interval: Duration,
    /// Serve TLS with this configuration instead of plain TCP.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Buffer and message pooling.
    pub pool: PoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(10)),
            max_body_len: MAX_BODY_LEN,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            drain_poll_interval: Duration::from_secs(1),
            tls: None,
            pool: PoolConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the read timeout.
    #[must_use]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub const fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = Some(write_timeout);
        self
    }

    /// Set the maximum frame body.
    #[must_use]
    pub const fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    /// Set the shutdown poll interval.
    #[must_use]
    pub const fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Serve TLS.
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set pooling options.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    fn handshake_timeout(&self) -> Option<Duration> {
        match (self.read_timeout, self.write_timeout) {
            (Some(read), Some(write)) => Some(read.max(write)),
            (read, write) => read.or(write),
        }
    }
}

struct Connection {
    peer: SocketAddr,
    read_stop: CancellationToken,
    closed: CancellationToken,
    writer: SharedWriter,
}

enum ReadEnd {
    /// Reading stopped for shutdown; writes continue until shutdown closes it.
    Drained,
    Closed,
}

struct ServerInner {
    config: ServerConfig,
    codec: FrameCodec,
    registry: Registry,
    plugins: PluginContainer,
    auth: RwLock<Option<AuthFn>>,
    connections: RwLock<HashMap<u64, Connection>>,
    next_conn_id: AtomicU64,
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    listener_stop: CancellationToken,
    done: CancellationToken,
    on_shutdown: Mutex<Vec<ShutdownHook>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Counts a dispatch as in flight for as long as it lives.
struct InFlight(Arc<ServerInner>);

impl InFlight {
    fn enter(inner: &Arc<ServerInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RPC server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server. Nothing listens until [`Server::serve`] is called.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let codec = FrameCodec::new(
            CodecConfig {
                max_body_len: config.max_body_len,
                compress_threshold: config.compress_threshold,
            },
            BufferPool::new(&config.pool),
            MessagePool::new(&config.pool),
        );

        Self {
            inner: Arc::new(ServerInner {
                config,
                codec,
                registry: Registry::new(),
                plugins: PluginContainer::default(),
                auth: RwLock::new(None),
                connections: RwLock::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                listener_stop: CancellationToken::new(),
                done: CancellationToken::new(),
                on_shutdown: Mutex::new(Vec::new()),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Registered services.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Installed plugins.
    #[must_use]
    pub fn plugins(&self) -> &PluginContainer {
        &self.inner.plugins
    }

    /// Install a plugin.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.inner.plugins.add(plugin);
    }

    /// Require every request to pass `auth`.
    pub fn set_auth<F>(&self, auth: F)
    where
        F: Fn(&Message, &str) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        *self.inner.auth.write() = Some(Arc::new(auth));
    }

    /// Register a service.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Registry`] for invalid services and
    /// [`ServerError::Plugin`] if a `register` hook refuses it (the service
    /// stays registered).
    pub fn register(&self, service: ServiceBuilder) -> Result<Vec<MethodDescriptor>> {
        let name = service.name().to_string();
        let descriptors = self.inner.registry.register(service)?;
        self.inner
            .plugins
            .register(&name, &descriptors)
            .map_err(ServerError::Plugin)?;
        info!("Registered service {name} with {} methods", descriptors.len());
        Ok(descriptors)
    }

    /// Attach one function to a service path.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::EmptyName`] if a name is empty.
    pub fn register_function<Req, Resp, F, Fut>(
        &self,
        service: impl Into<String>,
        name: impl Into<String>,
        function: F,
    ) -> std::result::Result<MethodDescriptor, RegistryError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, ServiceError>> + Send + 'static,
    {
        self.inner.registry.register_function(service, name, function)
    }

    /// Run `hook` once when shutdown or close completes.
    pub fn on_shutdown<F>(&self, hook: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        self.inner.on_shutdown.lock().push(Box::new(hook));
    }

    /// Address the server is listening on, once serving.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Requests currently being dispatched.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Connections currently tracked.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Whether shutdown or close has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait until shutdown or close has finished.
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }

    /// Bind `addr` and serve until shutdown.
    ///
    /// # Errors
    ///
    /// See [`Server::serve`]; binding errors are returned as I/O errors.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until shutdown.
    ///
    /// Accept errors are retried after a pause starting at 5ms and doubling;
    /// once the pause would exceed one second the error is returned. The
    /// listener is dropped (closed) when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Closed`] if the server is already shutting down
    /// and [`ServerError::AcceptFailed`] when accepting keeps failing.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.is_shutting_down() {
            return Err(ServerError::Closed);
        }

        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);
        info!("RPC server listening on {addr}");

        let mut delay = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.inner.listener_stop.cancelled() => {
                    info!("Listener on {addr} closed");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    delay = Duration::ZERO;
                    self.accept(stream, peer);
                }
                Err(e) => {
                    delay = if delay.is_zero() {
                        INITIAL_ACCEPT_DELAY
                    } else {
                        delay * 2
                    };
                    if delay > MAX_ACCEPT_DELAY {
                        error!("Accept failed, giving up: {e}");
                        return Err(ServerError::AcceptFailed { delay, source: e });
                    }

                    warn!("Accept error: {e}; retrying in {delay:?}");
                    tokio::select! {
                        () = self.inner.listener_stop.cancelled() => return Ok(()),
                        () = sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if !self.inner.plugins.post_conn_accept(peer) {
            debug!("Connection from {peer} rejected by plugin");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {peer}: {e}");
        }

        let server = self.clone();
        tokio::spawn(async move { server.handle_connection(stream, peer).await });
    }

    #[instrument(skip(self, stream))]
    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr) {
        let Some((reader, writer)) = self.split_stream(stream, peer).await else {
            self.inner.plugins.post_conn_close(peer);
            return;
        };

        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let read_stop = CancellationToken::new();
        let closed = CancellationToken::new();
        let writer: SharedWriter = Arc::new(AsyncMutex::new(FramedWrite::new(
            writer,
            self.inner.codec.clone(),
        )));

        self.inner.connections.write().insert(
            conn_id,
            Connection {
                peer,
                read_stop: read_stop.clone(),
                closed: closed.clone(),
                writer: Arc::clone(&writer),
            },
        );
        // Shutdown may have swept the table before the insert.
        if self.is_shutting_down() {
            let connection = self.inner.connections.write().remove(&conn_id);
            if let Some(connection) = connection {
                debug!("Closing connection {conn_id} from {peer}, server is shutting down");
                self.close_connection(connection).await;
            }
            return;
        }
        debug!("Serving connection {conn_id} from {peer}");

        let end = self
            .read_loop(conn_id, peer, reader, &writer, &read_stop, &closed)
            .await;

        if matches!(end, ReadEnd::Closed) {
            let connection = self.inner.connections.write().remove(&conn_id);
            if let Some(connection) = connection {
                self.close_connection(connection).await;
            }
        }
    }

    async fn split_stream(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Option<(BoxedReader, BoxedWriter)> {
        let Some(tls) = self.inner.config.tls.clone() else {
            let (reader, writer) = stream.into_split();
            return Some((Box::new(reader), Box::new(writer)));
        };

        let acceptor = TlsAcceptor::from(tls);
        match with_deadline(
            self.inner.config.handshake_timeout(),
            acceptor.accept(stream),
        )
        .await
        {
            Some(Ok(stream)) => {
                let (reader, writer) = tokio::io::split(stream);
                Some((Box::new(reader), Box::new(writer)))
            }
            Some(Err(e)) => {
                warn!("TLS handshake with {peer} failed: {e}");
                None
            }
            None => {
                warn!("TLS handshake with {peer} timed out");
                None
            }
        }
    }

    async fn read_loop(
        &self,
        conn_id: u64,
        peer: SocketAddr,
        reader: BoxedReader,
        writer: &SharedWriter,
        read_stop: &CancellationToken,
        closed: &CancellationToken,
    ) -> ReadEnd {
        let mut frames = FramedRead::new(reader, TolerantCodec::new(self.inner.codec.clone()));
        let read_timeout = self.inner.config.read_timeout;

        loop {
            let next = tokio::select! {
                biased;
                () = closed.cancelled() => return ReadEnd::Closed,
                () = read_stop.cancelled() => {
                    debug!("Connection {conn_id} stopped reading");
                    return ReadEnd::Drained;
                }
                next = with_deadline(read_timeout, frames.next()) => next,
            };

            let request = match next {
                None => {
                    debug!("Connection {conn_id} idle past read timeout");
                    return ReadEnd::Closed;
                }
                Some(None) => {
                    debug!("Connection {conn_id} closed by client");
                    return ReadEnd::Closed;
                }
                Some(Some(Err(e))) => {
                    warn!("Closing connection {conn_id} from {peer}: {e}");
                    return ReadEnd::Closed;
                }
                Some(Some(Ok(Err(e)))) => {
                    self.reject_frame(writer, &e).await;
                    continue;
                }
                Some(Some(Ok(Ok(request)))) => request,
            };

            if self
                .handle_request(conn_id, peer, request, writer, closed)
                .await
                .is_break()
            {
                return ReadEnd::Closed;
            }
        }
    }

    /// Answer a frame whose payload could not be decoded.
    async fn reject_frame(&self, writer: &SharedWriter, error: &ProtocolError) {
        let Some(header) = error.frame_header() else {
            warn!("Dropping undecodable frame: {error}");
            return;
        };
        warn!("Rejecting frame {}: {error}", header.seq());
        if header.is_oneway() {
            return;
        }

        let mut response = self.inner.codec.messages().get();
        response.header = *header;
        response.header.set_message_type(MessageType::Response);
        response.header.set_compress_type(CompressType::None);
        response.set_error(error.to_string());
        self.write_response(writer, response).await;
    }

    async fn handle_request(
        &self,
        conn_id: u64,
        peer: SocketAddr,
        mut request: Message,
        writer: &SharedWriter,
        closed: &CancellationToken,
    ) -> ControlFlow<()> {
        let messages = self.inner.codec.messages();

        if request.header.is_heartbeat() {
            let mut pong = messages.get();
            pong.header = request.header;
            pong.header.set_message_type(MessageType::Response);
            messages.put(request);
            return if self.write_response(writer, pong).await {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            };
        }

        if let Err(reason) = self.inner.plugins.post_read_request(&request).await {
            self.reply_error(writer, request, DispatchError::Hook(reason))
                .await;
            return ControlFlow::Continue(());
        }

        if let Err(reason) = self.authenticate(&request) {
            warn!("Authentication failed for {peer}: {reason}");
            self.reply_error(writer, request, DispatchError::Unauthorized(reason))
                .await;
            return ControlFlow::Break(());
        }

        let ctx = Context::from_request(peer, conn_id, &request, self.inner.plugins.clone());
        let in_flight = InFlight::enter(&self.inner);
        let server = self.clone();
        let writer = Arc::clone(writer);
        let closed = closed.clone();

        tokio::spawn(async move {
            let _in_flight = in_flight;
            let dispatch = AssertUnwindSafe(server.dispatch(ctx, request, &writer)).catch_unwind();
            if let Err(panic) = dispatch.await {
                error!(
                    "Handler panicked on connection {conn_id}: {}",
                    panic_message(panic.as_ref())
                );
                closed.cancel();
            }
        });

        ControlFlow::Continue(())
    }

    fn authenticate(&self, request: &Message) -> std::result::Result<(), String> {
        let auth = self.inner.auth.read().clone();
        let Some(auth) = auth else {
            return Ok(());
        };
        let token = request.metadata.get(AUTH_KEY).map_or("", String::as_str);
        auth(request, token)
    }

    async fn dispatch(&self, ctx: Context, mut request: Message, writer: &SharedWriter) {
        let payload = std::mem::take(&mut request.payload);
        let result = self.invoke(&ctx, &request, payload).await;

        if request.header.is_oneway() {
            if let Err(e) = result {
                debug!(
                    "One-way call {}.{} failed: {e}",
                    request.service_path, request.service_method
                );
            }
            self.inner.codec.messages().put(request);
            return;
        }

        let mut response = self.response_to(&request);
        response.metadata = ctx.take_response_metadata();
        match result {
            Ok(reply) => response.payload = reply,
            Err(e) => {
                debug!(
                    "Call {}.{} failed: {e}",
                    request.service_path, request.service_method
                );
                response.set_error(e.to_string());
            }
        }

        if let Err(reason) = self
            .inner
            .plugins
            .pre_write_response(&request, &mut response)
            .await
        {
            response.payload = Bytes::new();
            response.set_error(reason);
        }

        self.inner.codec.messages().put(request);
        self.write_response(writer, response).await;
    }

    async fn invoke(
        &self,
        ctx: &Context,
        request: &Message,
        payload: Bytes,
    ) -> std::result::Result<Bytes, DispatchError> {
        self.inner
            .plugins
            .pre_handle_request(ctx)
            .await
            .map_err(DispatchError::Hook)?;

        let handler = self
            .inner
            .registry
            .lookup(&request.service_path, &request.service_method)?;
        let tag = request.header.serialize_tag();
        let serialize = request
            .header
            .serialize_type()
            .map_err(|_| DispatchError::UnsupportedSerializer(tag))?;

        handler(ctx.clone(), serialize, payload).await
    }

    async fn reply_error(&self, writer: &SharedWriter, request: Message, error: DispatchError) {
        if request.header.is_oneway() {
            self.inner.codec.messages().put(request);
            return;
        }
        let mut response = self.response_to(&request);
        self.inner.codec.messages().put(request);
        response.set_error(error.to_string());
        self.write_response(writer, response).await;
    }

    fn response_to(&self, request: &Message) -> Message {
        let mut response = self.inner.codec.messages().get();
        response.header = request.header;
        response.header.set_message_type(MessageType::Response);
        response.header.set_status(MessageStatus::Normal);
        response.service_path.push_str(&request.service_path);
        response.service_method.push_str(&request.service_method);
        response
    }

    /// Write one response. Returns whether it reached the socket.
    async fn write_response(&self, writer: &SharedWriter, response: Message) -> bool {
        let header = response.header;
        let write_timeout = self.inner.config.write_timeout;
        let hooked = (!self.inner.plugins.is_empty()).then(|| response.clone());

        let mut sink = writer.lock().await;
        let outcome = match send_frame(&mut sink, response, write_timeout).await {
            Err(e @ ProtocolError::MessageTooLarge { .. }) => {
                warn!("Response {} too large: {e}", header.seq());
                let mut fallback = self.inner.codec.messages().get();
                fallback.header = header;
                fallback.header.set_compress_type(CompressType::None);
                fallback.set_error(e.to_string());
                send_frame(&mut sink, fallback, write_timeout).await
            }
            other => other,
        };
        drop(sink);

        let written = match outcome {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to write response {}: {e}", header.seq());
                false
            }
        };
        if let Some(response) = hooked {
            self.inner
                .plugins
                .post_write_response(&response, written)
                .await;
        }
        written
    }

    /// Stop accepting, let in-flight calls finish, then close everything.
    ///
    /// Connections stop reading at once but keep writing, so replies to
    /// requests already read are still delivered. The in-flight counter is
    /// polled every [`ServerConfig::drain_poll_interval`] until it reaches
    /// zero or `deadline` passes; then every connection is closed and the
    /// shutdown hooks run. Later or concurrent callers wait for that to
    /// finish and return `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::DrainTimeout`] if calls were still running at
    /// the deadline. The server is closed either way.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        if self
            .inner
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.inner.done.cancelled().await;
            return Ok(());
        }

        info!("Shutting down, waiting up to {deadline:?} for in-flight calls");
        self.inner.listener_stop.cancel();
        for connection in self.inner.connections.read().values() {
            connection.read_stop.cancel();
        }

        let drained = timeout(deadline, self.drain()).await.is_ok();
        let in_flight = self.in_flight();

        self.close_connections().await;
        self.finish();

        if drained {
            info!("Shutdown complete");
            Ok(())
        } else {
            warn!("Shutdown deadline passed with {in_flight} calls in flight");
            Err(ServerError::DrainTimeout {
                deadline,
                in_flight,
            })
        }
    }

    /// Close the listener and every connection without waiting for calls.
    pub async fn close(&self) {
        let first = self
            .inner
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        info!("Closing server");
        self.inner.listener_stop.cancel();
        self.close_connections().await;
        if first {
            self.finish();
        }
    }

    /// Shut down with `deadline` on SIGTERM or ctrl-c.
    pub fn shutdown_on_signal(&self, deadline: Duration) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = wait_for_signal() => {}
                () = server.closed() => return,
            }
            info!("Shutting down on signal");
            if let Err(e) = server.shutdown(deadline).await {
                warn!("Shutdown after signal: {e}");
            }
        })
    }

    async fn drain(&self) {
        let mut ticker = interval(
            self.inner
                .config
                .drain_poll_interval
                .max(Duration::from_millis(1)),
        );
        while self.in_flight() > 0 {
            ticker.tick().await;
        }
    }

    async fn close_connections(&self) {
        let connections: Vec<_> = self
            .inner
            .connections
            .write()
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in connections {
            self.close_connection(connection).await;
        }
    }

    async fn close_connection(&self, connection: Connection) {
        connection.read_stop.cancel();
        connection.closed.cancel();

        let mut writer = connection.writer.lock().await;
        let closing = SinkExt::<Message>::close(&mut *writer);
        match with_deadline(self.inner.config.write_timeout, closing).await {
            Some(Ok(())) => {}
            Some(Err(e)) => debug!("Error closing connection to {}: {e}", connection.peer),
            None => debug!("Timed out closing connection to {}", connection.peer),
        }
        drop(writer);

        self.inner.plugins.post_conn_close(connection.peer);
    }

    fn finish(&self) {
        let hooks = std::mem::take(&mut *self.inner.on_shutdown.lock());
        for hook in hooks {
            hook(self);
        }
        self.inner.done.cancel();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.active_connections())
            .field("in_flight", &self.in_flight())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

async fn send_frame(
    sink: &mut FramedWrite<BoxedWriter, FrameCodec>,
    message: Message,
    write_timeout: Option<Duration>,
) -> std::result::Result<(), ProtocolError> {
    match with_deadline(write_timeout, sink.send(message)).await {
        Some(result) => result,
        None => Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}

async fn with_deadline<F: Future>(deadline: Option<Duration>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => timeout(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received interrupt signal"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {e}"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt signal"),
        Err(e) => {
            warn!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}
