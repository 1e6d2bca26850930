//! Service-level client: discovery, selection, fail modes and fan-out.

use crate::breaker::{self, Breaker};
use crate::client::{ClientConfig, Reply, RpcClient};
use crate::discovery::{KvPair, ServiceDiscovery};
use crate::error::{ClientError, Result};
use crate::selector::{SelectMode, Selector, new_selector};
use crate::singleflight::SingleFlight;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tether_protocol::{AUTH_KEY, Metadata};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What to do when an attempt fails with a transport error.
///
/// Errors reported by the service itself are returned as they are in every
/// mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Try another server, never one already tried in this call while an
    /// untried one is left.
    #[default]
    Failover,
    /// Return the first error.
    Failfast,
    /// Retry the same server.
    Failtry,
    /// Race a second server if the first is slow to answer.
    Failbackup,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    addr: String,
    service_method: String,
    metadata: Vec<(String, String)>,
    payload: Bytes,
}

impl FlightKey {
    fn new(addr: &str, service_method: &str, metadata: &Metadata, payload: &Bytes) -> Self {
        let mut metadata: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        metadata.sort();
        Self {
            addr: addr.to_string(),
            service_method: service_method.to_string(),
            metadata,
            payload: payload.clone(),
        }
    }
}

type FlightResult = std::result::Result<Reply, Arc<ClientError>>;

struct XClientInner {
    service_path: String,
    fail_mode: FailMode,
    config: ClientConfig,
    discovery: Arc<dyn ServiceDiscovery>,
    servers: ArcSwap<HashMap<String, String>>,
    selector: RwLock<Arc<dyn Selector>>,
    clients: DashMap<String, RpcClient>,
    dialing: DashMap<String, Arc<AsyncMutex<()>>>,
    breakers: DashMap<String, Arc<dyn Breaker>>,
    auth: RwLock<Option<String>>,
    flights: SingleFlight<FlightKey, FlightResult>,
    watch_id: Mutex<Option<u64>>,
    stop: CancellationToken,
    closed: AtomicBool,
}

impl XClientInner {
    fn apply(&self, pairs: &[KvPair]) {
        let servers = filter_servers(pairs, self.config.group.as_deref());
        debug!(
            "Service {} now has {} servers",
            self.service_path,
            servers.len()
        );
        self.selector.read().update_servers(&servers);
        self.servers.store(Arc::new(servers));
    }
}

impl Drop for XClientInner {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(id) = self.watch_id.get_mut().take() {
            self.discovery.remove_watch(id);
        }
    }
}

/// Client for one service path across all of its servers.
///
/// Cheap to clone; clones share connections, breakers and state.
#[derive(Clone)]
pub struct XClient {
    inner: Arc<XClientInner>,
}

impl XClient {
    /// Create a client for `service_path`.
    ///
    /// Takes the initial server set from `discovery` and follows its watch
    /// feed, if it has one. Must be called inside a Tokio runtime.
    pub fn new(
        service_path: impl Into<String>,
        fail_mode: FailMode,
        select_mode: SelectMode,
        discovery: Arc<dyn ServiceDiscovery>,
        config: ClientConfig,
    ) -> Self {
        let servers = filter_servers(&discovery.get_services(), config.group.as_deref());
        let selector = new_selector(select_mode, &servers);

        let inner = Arc::new(XClientInner {
            service_path: service_path.into(),
            fail_mode,
            config,
            discovery,
            servers: ArcSwap::from_pointee(servers),
            selector: RwLock::new(selector),
            clients: DashMap::new(),
            dialing: DashMap::new(),
            breakers: DashMap::new(),
            auth: RwLock::new(None),
            flights: SingleFlight::new(),
            watch_id: Mutex::new(None),
            stop: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        if let Some(watch) = inner.discovery.watch() {
            *inner.watch_id.lock() = Some(watch.id);
            tokio::spawn(follow_discovery(
                Arc::downgrade(&inner),
                watch.updates,
                inner.stop.clone(),
            ));
        }

        Self { inner }
    }

    /// The service this client calls.
    #[must_use]
    pub fn service_path(&self) -> &str {
        &self.inner.service_path
    }

    /// Current server set, `address -> metadata`.
    #[must_use]
    pub fn servers(&self) -> Arc<HashMap<String, String>> {
        self.inner.servers.load_full()
    }

    /// Send `token` as `__AUTH` metadata on every call.
    pub fn auth(&self, token: impl Into<String>) {
        *self.inner.auth.write() = Some(token.into());
    }

    /// Replace the selector with a user-defined one.
    pub fn set_selector(&self, selector: Arc<dyn Selector>) {
        selector.update_servers(&self.inner.servers.load());
        *self.inner.selector.write() = selector;
    }

    /// Call `method` with a typed argument and decode the reply.
    ///
    /// # Errors
    ///
    /// Returns the error left after the fail mode gave up.
    pub async fn call<Req, Resp>(&self, method: &str, args: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_with_metadata(method, Metadata::new(), args)
            .await?
            .decode()
    }

    /// Call `method` with a typed argument and explicit metadata.
    ///
    /// # Errors
    ///
    /// Returns the error left after the fail mode gave up.
    pub async fn call_with_metadata<Req>(
        &self,
        method: &str,
        metadata: Metadata,
        args: &Req,
    ) -> Result<Reply>
    where
        Req: Serialize + ?Sized,
    {
        let payload = self.inner.config.serialize_type.encode(args)?;
        self.invoke(method, metadata, payload).await
    }

    /// Start a call in the background.
    pub fn go(&self, method: &str, metadata: Metadata, payload: Bytes) -> JoinHandle<Result<Reply>> {
        let client = self.clone();
        let method = method.to_string();
        tokio::spawn(async move { client.invoke(&method, metadata, payload).await })
    }

    /// Call `method` with an encoded payload under the fail mode.
    ///
    /// # Errors
    ///
    /// Returns the error left after the fail mode gave up.
    #[instrument(skip(self, metadata, payload), fields(service = %self.inner.service_path))]
    pub async fn invoke(&self, method: &str, metadata: Metadata, payload: Bytes) -> Result<Reply> {
        self.ensure_open()?;
        let metadata = self.with_auth(metadata);

        match self.inner.fail_mode {
            FailMode::Failfast => {
                let addr = self.select(method, &payload)?;
                self.attempt(&addr, method, &metadata, &payload).await
            }
            FailMode::Failtry => {
                let addr = self.select(method, &payload)?;
                let mut last = None;
                for _ in 0..=self.inner.config.retries {
                    match self.attempt(&addr, method, &metadata, &payload).await {
                        Err(e) if !e.is_service_error() => {
                            debug!("Attempt on {addr} failed, retrying: {e}");
                            last = Some(e);
                        }
                        result => return result,
                    }
                }
                Err(last.unwrap_or_else(|| self.no_server()))
            }
            FailMode::Failover => {
                let mut tried = HashSet::new();
                let mut last = None;
                for _ in 0..=self.inner.config.retries {
                    let addr = if tried.is_empty() {
                        self.select(method, &payload)?
                    } else {
                        self.select_untried(method, &payload, &tried)?
                    };
                    match self.attempt(&addr, method, &metadata, &payload).await {
                        Err(e) if !e.is_service_error() => {
                            debug!("Attempt on {addr} failed, failing over: {e}");
                            tried.insert(addr);
                            last = Some(e);
                        }
                        result => return result,
                    }
                }
                Err(last.unwrap_or_else(|| self.no_server()))
            }
            FailMode::Failbackup => self.race(method, &metadata, &payload).await,
        }
    }

    /// Send to every server. Succeeds only if all of them do.
    ///
    /// The first error is returned as soon as it arrives; the other sends keep
    /// running to completion in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoServer`] if there are no servers, or the first
    /// error any server produced.
    pub async fn broadcast(&self, method: &str, metadata: Metadata, payload: Bytes) -> Result<Reply> {
        let mut sends = self.fan_out(method, metadata, payload)?;

        let mut first = None;
        while let Some(joined) = sends.next().await {
            let reply = flatten(joined)?;
            first.get_or_insert(reply);
        }
        first.ok_or_else(|| self.no_server())
    }

    /// Send to every server and return the first success.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoServer`] if there are no servers, or the last
    /// error if every server failed.
    pub async fn fork(&self, method: &str, metadata: Metadata, payload: Bytes) -> Result<Reply> {
        let mut sends = self.fan_out(method, metadata, payload)?;

        let mut last = None;
        while let Some(joined) = sends.next().await {
            match flatten(joined) {
                Ok(reply) => return Ok(reply),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| self.no_server()))
    }

    /// Close every connection and stop following discovery.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing client for service {}", self.inner.service_path);
        self.inner.stop.cancel();
        if let Some(id) = self.inner.watch_id.lock().take() {
            self.inner.discovery.remove_watch(id);
        }

        let clients: Vec<RpcClient> = self
            .inner
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.clients.clear();
        self.inner.dialing.clear();
        for client in clients {
            client.close().await;
        }
    }

    /// True once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        Ok(())
    }

    fn no_server(&self) -> ClientError {
        ClientError::NoServer(self.inner.service_path.clone())
    }

    fn with_auth(&self, mut metadata: Metadata) -> Metadata {
        if let Some(token) = self.inner.auth.read().as_ref() {
            metadata.insert(AUTH_KEY.to_string(), token.clone());
        }
        metadata
    }

    fn selector(&self) -> Arc<dyn Selector> {
        Arc::clone(&self.inner.selector.read())
    }

    fn select(&self, method: &str, payload: &[u8]) -> Result<String> {
        self.selector()
            .select(&self.inner.service_path, method, payload)
            .ok_or_else(|| self.no_server())
    }

    /// Ask the selector for an address not in `tried`, then fall back to the
    /// first untried address in sorted order, then to anything.
    fn select_untried(&self, method: &str, payload: &[u8], tried: &HashSet<String>) -> Result<String> {
        let selector = self.selector();
        let servers = self.inner.servers.load();

        for _ in 0..servers.len() {
            match selector.select(&self.inner.service_path, method, payload) {
                Some(addr) if !tried.contains(&addr) => return Ok(addr),
                Some(_) => {}
                None => return Err(self.no_server()),
            }
        }

        let mut untried: Vec<&String> = servers.keys().filter(|addr| !tried.contains(*addr)).collect();
        untried.sort();
        match untried.first() {
            Some(addr) => Ok((*addr).clone()),
            None => self.select(method, payload),
        }
    }

    async fn race(&self, method: &str, metadata: &Metadata, payload: &Bytes) -> Result<Reply> {
        let primary_addr = self.select(method, payload)?;
        let primary = self.attempt(&primary_addr, method, metadata, payload);
        tokio::pin!(primary);

        tokio::select! {
            result = &mut primary => return result,
            () = sleep(self.inner.config.backup_latency) => {}
        }

        let tried = HashSet::from([primary_addr.clone()]);
        let Ok(backup_addr) = self.select_untried(method, payload, &tried) else {
            return primary.await;
        };
        debug!("No answer within backup latency, racing {backup_addr}");
        let backup = self.attempt(&backup_addr, method, metadata, payload);

        tokio::select! {
            result = &mut primary => result,
            result = backup => result,
        }
    }

    /// One attempt on `addr`, through its breaker if one is configured.
    async fn attempt(
        &self,
        addr: &str,
        method: &str,
        metadata: &Metadata,
        payload: &Bytes,
    ) -> Result<Reply> {
        let call = async {
            let client = self.client_for(addr).await?;
            client
                .invoke(&self.inner.service_path, method, metadata.clone(), payload.clone())
                .await
        };

        match self.breaker_for(addr) {
            Some(breaker) => {
                breaker::attempt(breaker.as_ref(), self.inner.config.call_timeout, call).await
            }
            None => call.await,
        }
    }

    fn breaker_for(&self, addr: &str) -> Option<Arc<dyn Breaker>> {
        let factory = self.inner.config.breaker.as_ref()?;
        let breaker = self
            .inner
            .breakers
            .entry(addr.to_string())
            .or_insert_with(|| factory())
            .clone();
        Some(breaker)
    }

    /// The pooled connection to `addr`, dialing a new one if there is none
    /// or the old one went down.
    async fn client_for(&self, addr: &str) -> Result<RpcClient> {
        if let Some(client) = self.live_client(addr) {
            return Ok(client);
        }

        let dial_lock = self
            .inner
            .dialing
            .entry(addr.to_string())
            .or_default()
            .clone();
        let _dialing = dial_lock.lock().await;
        if let Some(client) = self.live_client(addr) {
            return Ok(client);
        }
        self.ensure_open()?;

        let client = RpcClient::connect(addr, self.inner.config.clone()).await?;
        self.inner.clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    fn live_client(&self, addr: &str) -> Option<RpcClient> {
        let client = self.inner.clients.get(addr)?.clone();
        if client.is_closing() || client.is_shutdown() {
            self.inner.clients.remove(addr);
            return None;
        }
        Some(client)
    }

    /// Spawn one deduplicated send per server.
    fn fan_out(
        &self,
        method: &str,
        metadata: Metadata,
        payload: Bytes,
    ) -> Result<FuturesUnordered<JoinHandle<FlightResult>>> {
        self.ensure_open()?;
        let metadata = self.with_auth(metadata);

        let mut addrs: Vec<String> = self.inner.servers.load().keys().cloned().collect();
        if addrs.is_empty() {
            return Err(self.no_server());
        }
        addrs.sort();

        Ok(addrs
            .into_iter()
            .map(|addr| {
                let client = self.clone();
                let method = method.to_string();
                let metadata = metadata.clone();
                let payload = payload.clone();
                tokio::spawn(async move { client.shared_attempt(addr, method, metadata, payload).await })
            })
            .collect())
    }

    async fn shared_attempt(
        self,
        addr: String,
        method: String,
        metadata: Metadata,
        payload: Bytes,
    ) -> FlightResult {
        let key = FlightKey::new(&addr, &method, &metadata, &payload);
        let client = self.clone();
        self.inner
            .flights
            .run(key, async move {
                client
                    .attempt(&addr, &method, &metadata, &payload)
                    .await
                    .map_err(Arc::new)
            })
            .await
    }
}

impl std::fmt::Debug for XClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XClient")
            .field("service_path", &self.inner.service_path)
            .field("fail_mode", &self.inner.fail_mode)
            .field("servers", &self.inner.servers.load().len())
            .field("connections", &self.inner.clients.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn flatten(joined: std::result::Result<FlightResult, tokio::task::JoinError>) -> Result<Reply> {
    match joined {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(ClientError::Shared(e)),
        Err(e) => {
            warn!("Fan-out send failed to complete: {e}");
            Err(ClientError::ConnectionClosed)
        }
    }
}

async fn follow_discovery(
    inner: Weak<XClientInner>,
    mut updates: tokio::sync::watch::Receiver<Vec<KvPair>>,
    stop: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            () = stop.cancelled() => return,
            changed = updates.changed() => changed,
        };
        if changed.is_err() {
            debug!("Discovery watch ended");
            return;
        }
        let pairs = updates.borrow_and_update().clone();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.apply(&pairs);
    }
}

/// Turn discovery pairs into the server set, dropping inactive servers and
/// servers outside `group`.
fn filter_servers(pairs: &[KvPair], group: Option<&str>) -> HashMap<String, String> {
    pairs
        .iter()
        .filter(|pair| {
            let params: HashMap<_, _> = url::form_urlencoded::parse(pair.value.as_bytes()).collect();
            if params.get("state").is_some_and(|state| state == "inactive") {
                return false;
            }
            group.is_none_or(|group| params.get("group").is_some_and(|g| g == group))
        })
        .map(|pair| (pair.key.clone(), pair.value.clone()))
        .collect()
}
