use super::{Selector, sorted_addresses};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates through the sorted address list.
///
/// The cursor survives updates and is taken modulo the new length.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    servers: RwLock<Vec<String>>,
    cursor: AtomicUsize,
}

impl Selector for RoundRobinSelector {
    fn select(&self, _service_path: &str, _service_method: &str, _args: &[u8]) -> Option<String> {
        let servers = self.servers.read();
        if servers.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % servers.len();
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
    fn test_rotation() {
        let selector = RoundRobinSelector::default();
        selector.update_servers(&servers(&[("c:1", ""), ("a:1", ""), ("b:1", "")]));

        let picks: Vec<String> = (0..4)
            .filter_map(|_| selector.select("S", "M", b""))
            .collect();
        assert_eq!(picks, ["a:1", "b:1", "c:1", "a:1"]);
    }

    #[test]
    fn test_cursor_survives_update() {
        let selector = RoundRobinSelector::default();
        selector.update_servers(&servers(&[("a:1", ""), ("b:1", ""), ("c:1", "")]));
        for _ in 0..4 {
            selector.select("S", "M", b"");
        }

        selector.update_servers(&servers(&[("a:1", ""), ("b:1", "")]));
        // Cursor is at 4, 4 % 2 == 0.
        assert_eq!(selector.select("S", "M", b"").as_deref(), Some("a:1"));
        assert_eq!(selector.select("S", "M", b"").as_deref(), Some("b:1"));
    }
}
