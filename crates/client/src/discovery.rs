//! Where the client learns which servers exist.
//!
//! A discovery source reports `(address, metadata)` pairs. Metadata is a URL
//! query string (`weight=5&group=blue&state=inactive`). Sources that can
//! change push whole new snapshots to their watchers.

use crate::error::Result;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// One server as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// Server address, `host:port` or `tcp@host:port`.
    pub key: String,
    /// URL-encoded server metadata.
    pub value: String,
}

impl KvPair {
    /// Create a pair.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Keeps only the pairs it returns true for.
pub type ServiceFilter = Arc<dyn Fn(&KvPair) -> bool + Send + Sync>;

/// Subscription to server set changes.
#[derive(Debug)]
pub struct DiscoveryWatch {
    /// Handle for [`ServiceDiscovery::remove_watch`].
    pub id: u64,
    /// The latest full snapshot. Snapshots a slow watcher never looked at
    /// are overwritten by newer ones.
    pub updates: watch::Receiver<Vec<KvPair>>,
}

/// Source of the server set for one service.
pub trait ServiceDiscovery: Send + Sync {
    /// The current server set.
    fn get_services(&self) -> Vec<KvPair>;

    /// Subscribe to changes. `None` if the set never changes.
    fn watch(&self) -> Option<DiscoveryWatch>;

    /// Drop a subscription.
    fn remove_watch(&self, id: u64);

    /// A discovery for another service path on the same backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot serve that path.
    fn clone_for(&self, service_path: &str) -> Result<Arc<dyn ServiceDiscovery>>;

    /// Apply `filter` to every future result.
    fn set_filter(&self, filter: ServiceFilter);

    /// Release resources and end every watch.
    fn close(&self);
}

/// A single fixed server.
#[derive(Debug, Clone)]
pub struct PeerToPeerDiscovery {
    server: String,
    metadata: String,
}

impl PeerToPeerDiscovery {
    /// Discovery that always reports `server`.
    pub fn new(server: impl Into<String>, metadata: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            metadata: metadata.into(),
        }
    }
}

impl ServiceDiscovery for PeerToPeerDiscovery {
    fn get_services(&self) -> Vec<KvPair> {
        vec![KvPair::new(self.server.clone(), self.metadata.clone())]
    }

    fn watch(&self) -> Option<DiscoveryWatch> {
        None
    }

    fn remove_watch(&self, _id: u64) {}

    fn clone_for(&self, _service_path: &str) -> Result<Arc<dyn ServiceDiscovery>> {
        Ok(Arc::new(self.clone()))
    }

    fn set_filter(&self, _filter: ServiceFilter) {}

    fn close(&self) {}
}

/// A static list of servers that can be replaced at runtime.
///
/// [`update`](Self::update) pushes the new list to every watcher.
#[derive(Default)]
pub struct MultipleServersDiscovery {
    pairs: RwLock<Vec<KvPair>>,
    filter: RwLock<Option<ServiceFilter>>,
    watchers: Mutex<HashMap<u64, watch::Sender<Vec<KvPair>>>>,
    next_watch: AtomicU64,
}

impl MultipleServersDiscovery {
    /// Discovery over `pairs`.
    #[must_use]
    pub fn new(pairs: Vec<KvPair>) -> Self {
        Self {
            pairs: RwLock::new(pairs),
            ..Self::default()
        }
    }

    /// Replace the server list and notify watchers.
    ///
    /// A watcher that has not read the previous snapshot yet only sees this
    /// one; one that went away is dropped.
    pub fn update(&self, pairs: Vec<KvPair>) {
        *self.pairs.write() = pairs;
        let snapshot = self.get_services();

        self.watchers.lock().retain(|id, tx| {
            if tx.send(snapshot.clone()).is_err() {
                debug!("Watcher {id} went away");
                return false;
            }
            true
        });
    }

    /// Number of live watchers.
    #[must_use]
    pub fn watchers(&self) -> usize {
        self.watchers.lock().len()
    }
}

impl ServiceDiscovery for MultipleServersDiscovery {
    fn get_services(&self) -> Vec<KvPair> {
        let pairs = self.pairs.read();
        match self.filter.read().as_ref() {
            Some(filter) => pairs.iter().filter(|pair| filter(pair)).cloned().collect(),
            None => pairs.clone(),
        }
    }

    fn watch(&self) -> Option<DiscoveryWatch> {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        let (tx, updates) = watch::channel(self.get_services());
        self.watchers.lock().insert(id, tx);
        Some(DiscoveryWatch { id, updates })
    }

    fn remove_watch(&self, id: u64) {
        self.watchers.lock().remove(&id);
    }

    fn clone_for(&self, _service_path: &str) -> Result<Arc<dyn ServiceDiscovery>> {
        let clone = Self::new(self.pairs.read().clone());
        *clone.filter.write() = self.filter.read().clone();
        Ok(Arc::new(clone))
    }

    fn set_filter(&self, filter: ServiceFilter) {
        *self.filter.write() = Some(filter);
    }

    fn close(&self) {
        self.watchers.lock().clear();
    }
}

impl std::fmt::Debug for MultipleServersDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipleServersDiscovery")
            .field("pairs", &*self.pairs.read())
            .field("watchers", &self.watchers())
            .finish_non_exhaustive()
    }
}
