//! Strategies for picking a server address per call.
//!
//! Every selector is fed the full server snapshot (`address -> metadata`)
//! through [`Selector::update_servers`] and picks from it in
//! [`Selector::select`]. Both may run concurrently; a select never observes a
//! half-applied update.

mod consistent_hash;
mod random;
mod round_robin;
mod weighted;

pub use consistent_hash::ConsistentHashSelector;
pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;
pub use weighted::WeightedRoundRobinSelector;

use std::collections::HashMap;
use std::sync::Arc;

/// Picks a server for a call.
pub trait Selector: Send + Sync {
    /// Pick an address for `service_path.service_method` with the encoded
    /// arguments. `None` if there are no servers.
    fn select(&self, service_path: &str, service_method: &str, args: &[u8]) -> Option<String>;

    /// Replace the server set.
    fn update_servers(&self, servers: &HashMap<String, String>);
}

/// Built-in selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    /// Uniform random pick.
    #[default]
    Random,
    /// Rotate through the sorted address list.
    RoundRobin,
    /// Smooth weighted round-robin on the `weight` metadata parameter.
    WeightedRoundRobin,
    /// Same service, method and arguments go to the same server.
    ConsistentHash,
}

/// Build the selector for `mode` over `servers`.
#[must_use]
pub fn new_selector(mode: SelectMode, servers: &HashMap<String, String>) -> Arc<dyn Selector> {
    let selector: Arc<dyn Selector> = match mode {
        SelectMode::Random => Arc::new(RandomSelector::default()),
        SelectMode::RoundRobin => Arc::new(RoundRobinSelector::default()),
        SelectMode::WeightedRoundRobin => Arc::new(WeightedRoundRobinSelector::default()),
        SelectMode::ConsistentHash => Arc::new(ConsistentHashSelector::default()),
    };
    selector.update_servers(servers);
    selector
}

fn sorted_addresses(servers: &HashMap<String, String>) -> Vec<String> {
    let mut addresses: Vec<String> = servers.keys().cloned().collect();
    addresses.sort();
    addresses
}

#[cfg(test)]
fn servers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(addr, meta)| ((*addr).to_string(), (*meta).to_string()))
        .collect()
}
