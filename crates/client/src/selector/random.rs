use super::{Selector, sorted_addresses};

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;

/// Uniform random pick.
#[derive(Debug, Default)]
pub struct RandomSelector {
    servers: RwLock<Vec<String>>,
}

impl Selector for RandomSelector {
    fn select(&self, _service_path: &str, _service_method: &str, _args: &[u8]) -> Option<String> {
        let servers = self.servers.read();
        if servers.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..servers.len());
        Some(servers[index].clone())
    }

    fn update_servers(&self, servers: &HashMap<String, String>) {
        *self.servers.write() = sorted_addresses(servers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::servers;

    #[test]
    fn test_picks_every_server() {
        let selector = RandomSelector::default();
        selector.update_servers(&servers(&[("a:1", ""), ("b:1", ""), ("c:1", "")]));

        let mut seen = std::collections::HashSet::new();
        for _ in 0..300 {
            seen.insert(selector.select("S", "M", b"").unwrap());
        }
        assert_eq!(seen.len(), 3);
    }
}
