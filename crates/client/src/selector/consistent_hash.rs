use super::Selector;

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

const VIRTUAL_NODES: usize = 64;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Default)]
struct Ring {
    points: BTreeMap<u64, String>,
    addresses: BTreeSet<String>,
}

impl Ring {
    fn add(&mut self, address: &str) {
        for replica in 0..VIRTUAL_NODES {
            self.points
                .insert(point(address, replica), address.to_string());
        }
        self.addresses.insert(address.to_string());
    }

    fn remove(&mut self, address: &str) {
        for replica in 0..VIRTUAL_NODES {
            let key = point(address, replica);
            if self.points.get(&key).is_some_and(|owner| owner == address) {
                self.points.remove(&key);
            }
        }
        self.addresses.remove(address);
    }

    fn lookup(&self, hash: u64) -> Option<&String> {
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, address)| address)
    }
}

/// Maps `service_path/service_method/args` onto a hash ring of servers.
///
/// Each server owns a fixed set of virtual points, so adding or removing one
/// server only moves the keys that land on its points.
#[derive(Debug, Default)]
pub struct ConsistentHashSelector {
    ring: RwLock<Ring>,
}

impl Selector for ConsistentHashSelector {
    fn select(&self, service_path: &str, service_method: &str, args: &[u8]) -> Option<String> {
        let hash = key_hash(service_path, service_method, args);
        self.ring.read().lookup(hash).cloned()
    }

    fn update_servers(&self, servers: &HashMap<String, String>) {
        let mut ring = self.ring.write();

        let stale: Vec<String> = ring
            .addresses
            .iter()
            .filter(|address| !servers.contains_key(*address))
            .cloned()
            .collect();
        for address in &stale {
            ring.remove(address);
        }

        let mut fresh: Vec<&String> = servers
            .keys()
            .filter(|address| !ring.addresses.contains(*address))
            .collect();
        fresh.sort();
        for address in fresh {
            ring.add(address);
        }
    }
}

fn key_hash(service_path: &str, service_method: &str, args: &[u8]) -> u64 {
    let hash = fnv1a(FNV_OFFSET, service_path.as_bytes());
    let hash = fnv1a(hash, b"/");
    let hash = fnv1a(hash, service_method.as_bytes());
    let hash = fnv1a(hash, b"/");
    mix(fnv1a(hash, args))
}

fn point(address: &str, replica: usize) -> u64 {
    let hash = fnv1a(FNV_OFFSET, address.as_bytes());
    let hash = fnv1a(hash, b"#");
    mix(fnv1a(hash, &replica.to_be_bytes()))
}

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME))
}

/// Final avalanche so that similar inputs spread over the whole ring.
const fn mix(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^ (hash >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::servers;

    fn assignments(selector: &ConsistentHashSelector, keys: usize) -> Vec<String> {
        (0..keys)
            .filter_map(|i| selector.select("Arith", "Mul", format!("{{\"a\":{i}}}").as_bytes()))
            .collect()
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(FNV_OFFSET, b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(FNV_OFFSET, b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_stable_for_fixed_input() {
        let selector = ConsistentHashSelector::default();
        selector.update_servers(&servers(&[("a:1", ""), ("b:1", ""), ("c:1", "")]));

        let first = selector.select("Arith", "Mul", b"{\"a\":1}");
        for _ in 0..10 {
            assert_eq!(selector.select("Arith", "Mul", b"{\"a\":1}"), first);
        }
        assert_eq!(assignments(&selector, 200), assignments(&selector, 200));
    }

    #[test]
    fn test_spreads_keys() {
        let selector = ConsistentHashSelector::default();
        selector.update_servers(&servers(&[("a:1", ""), ("b:1", ""), ("c:1", "")]));

        let picks = assignments(&selector, 3000);
        for address in ["a:1", "b:1", "c:1"] {
            let share = picks.iter().filter(|p| *p == address).count();
            assert!(share > 300, "{address} got {share}");
        }
    }

    #[test]
    fn test_removal_only_moves_removed_keys() {
        let selector = ConsistentHashSelector::default();
        selector.update_servers(&servers(&[("a:1", ""), ("b:1", ""), ("c:1", "")]));
        let before = assignments(&selector, 1000);

        selector.update_servers(&servers(&[("a:1", ""), ("b:1", "")]));
        let after = assignments(&selector, 1000);

        for (old, new) in before.iter().zip(&after) {
            assert_ne!(new, "c:1");
            if old != "c:1" {
                assert_eq!(old, new);
            }
        }
    }

    #[test]
    fn test_addition_only_takes_keys_for_new_server() {
        let selector = ConsistentHashSelector::default();
        selector.update_servers(&servers(&[("a:1", ""), ("b:1", "")]));
        let before = assignments(&selector, 1000);

        selector.update_servers(&servers(&[("a:1", ""), ("b:1", ""), ("c:1", "")]));
        let after = assignments(&selector, 1000);

        for (old, new) in before.iter().zip(&after) {
            assert!(old == new || new == "c:1");
        }
    }
}
