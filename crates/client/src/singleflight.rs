//! Collapse concurrent identical operations into one.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::hash::Hash;

/// Runs at most one operation per key at a time.
///
/// Callers arriving while an operation for their key is running wait for
/// that operation and receive a clone of its output. The key is released as
/// soon as the operation finishes, so later callers start a fresh one.
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    flights: DashMap<K, Shared<BoxFuture<'static, V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    /// Run `operation` for `key`, or join the one already running.
    pub async fn run<F>(&self, key: K, operation: F) -> V
    where
        F: Future<Output = V> + Send + 'static,
    {
        let flight = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let flight = operation.boxed().shared();
                entry.insert(flight.clone());
                flight
            }
        };

        let output = flight.clone().await;
        self.flights
            .remove_if(&key, |_, current| Shared::ptr_eq(current, &flight));
        output
    }

    /// Keys with an operation running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flights = Arc::new(SingleFlight::<&'static str, usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flights
                    .run("key", async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        runs.fetch_add(1, Ordering::SeqCst) + 1
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_key_released_after_completion() {
        let flights = SingleFlight::<u8, u8>::new();
        assert_eq!(flights.run(1, async { 10 }).await, 10);
        assert_eq!(flights.run(1, async { 20 }).await, 20);
        assert_eq!(flights.run(2, async { 30 }).await, 30);
    }
}
