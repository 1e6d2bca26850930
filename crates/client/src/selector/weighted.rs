use super::Selector;

use parking_lot::Mutex;
use std::collections::HashMap;

/// Weights above this are clamped, so weight sums cannot overflow.
const MAX_WEIGHT: i64 = u32::MAX as i64;

#[derive(Debug, Clone)]
struct Weighted {
    address: String,
    weight: i64,
    current_weight: i64,
    effective_weight: i64,
}

/// Smooth weighted round-robin, as nginx schedules upstreams.
///
/// Every pick adds each server's effective weight to its current weight and
/// takes the largest, which then gives back the total. Picks come out in
/// proportion to weight without long runs of the same server.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinSelector {
    servers: Mutex<Vec<Weighted>>,
}

impl Selector for WeightedRoundRobinSelector {
    fn select(&self, _service_path: &str, _service_method: &str, _args: &[u8]) -> Option<String> {
        let mut servers = self.servers.lock();

        let mut total = 0;
        let mut best: Option<(usize, i64)> = None;
        for (index, server) in servers.iter_mut().enumerate() {
            server.current_weight += server.effective_weight;
            total += server.effective_weight;
            if best.is_none_or(|(_, weight)| server.current_weight > weight) {
                best = Some((index, server.current_weight));
            }
        }

        let (index, _) = best?;
        let winner = &mut servers[index];
        winner.current_weight -= total;
        Some(winner.address.clone())
    }

    fn update_servers(&self, servers: &HashMap<String, String>) {
        let mut current = self.servers.lock();
        let mut previous: HashMap<String, Weighted> = current
            .drain(..)
            .map(|server| (server.address.clone(), server))
            .collect();

        let mut next: Vec<Weighted> = servers
            .iter()
            .map(|(address, metadata)| {
                let weight = parse_weight(metadata);
                match previous.remove(address) {
                    Some(server) if server.weight == weight => server,
                    Some(server) => Weighted {
                        weight,
                        effective_weight: weight,
                        ..server
                    },
                    None => Weighted {
                        address: address.clone(),
                        weight,
                        current_weight: 0,
                        effective_weight: weight,
                    },
                }
            })
            .collect();
        next.sort_by(|a, b| a.address.cmp(&b.address));
        *current = next;
    }
}

/// The `weight` query parameter of discovery metadata. Missing, unparsable
/// or non-positive weights count as 1; larger ones are capped at
/// [`MAX_WEIGHT`].
fn parse_weight(metadata: &str) -> i64 {
    url::form_urlencoded::parse(metadata.as_bytes())
        .find(|(key, _)| key == "weight")
        .and_then(|(_, value)| value.parse::<i64>().ok())
        .filter(|weight| *weight > 0)
        .map_or(1, |weight| weight.min(MAX_WEIGHT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::servers;
    use proptest::prelude::*;

    fn picks(selector: &WeightedRoundRobinSelector, n: usize) -> Vec<String> {
        (0..n)
            .filter_map(|_| selector.select("S", "M", b""))
            .collect()
    }

    #[test]
    fn test_parse_weight() {
        assert_eq!(parse_weight("weight=5"), 5);
        assert_eq!(parse_weight("group=a&weight=3"), 3);
        assert_eq!(parse_weight(""), 1);
        assert_eq!(parse_weight("weight=abc"), 1);
        assert_eq!(parse_weight("weight=0"), 1);
        assert_eq!(parse_weight("weight=-2"), 1);
        assert_eq!(parse_weight("weight=9223372036854775807"), MAX_WEIGHT);
    }

    #[test]
    fn test_huge_weights_alternate() {
        let selector = WeightedRoundRobinSelector::default();
        selector.update_servers(&servers(&[
            ("a:1", "weight=9223372036854775807"),
            ("b:1", "weight=9223372036854775807"),
        ]));

        assert_eq!(picks(&selector, 4), ["a:1", "b:1", "a:1", "b:1"]);
    }

    #[test]
    fn test_smooth_distribution() {
        let selector = WeightedRoundRobinSelector::default();
        selector.update_servers(&servers(&[("a:1", "weight=5"), ("b:1", "weight=1")]));

        let picks = picks(&selector, 600);
        let a = picks.iter().filter(|p| *p == "a:1").count();
        assert_eq!(a, 500);
        assert_eq!(picks.len() - a, 100);

        let mut longest = 0;
        let mut run = 0;
        for pick in &picks {
            if pick == "a:1" {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        assert!(longest <= 6, "run of {longest}");
    }

    #[test]
    fn test_nginx_sequence() {
        let selector = WeightedRoundRobinSelector::default();
        selector.update_servers(&servers(&[
            ("a:1", "weight=5"),
            ("b:1", "weight=1"),
            ("c:1", "weight=1"),
        ]));

        assert_eq!(
            picks(&selector, 7),
            ["a:1", "a:1", "b:1", "a:1", "c:1", "a:1", "a:1"]
        );
    }

    #[test]
    fn test_update_keeps_surviving_state() {
        let selector = WeightedRoundRobinSelector::default();
        selector.update_servers(&servers(&[("a:1", "weight=2"), ("b:1", "weight=1")]));
        selector.select("S", "M", b"");

        selector.update_servers(&servers(&[
            ("a:1", "weight=2"),
            ("b:1", "weight=1"),
            ("c:1", ""),
        ]));
        let state = selector.servers.lock().clone();
        assert_eq!(state.len(), 3);
        assert_eq!(state[0].current_weight, -1);
        assert_eq!(state[1].current_weight, 1);
        assert_eq!(state[2].current_weight, 0);
    }

    proptest! {
        #[test]
        fn test_full_cycle_matches_weights(weights in prop::collection::vec(1i64..20, 1..6)) {
            let selector = WeightedRoundRobinSelector::default();
            let set: HashMap<String, String> = weights
                .iter()
                .enumerate()
                .map(|(i, weight)| (format!("s{i}:1"), format!("weight={weight}")))
                .collect();
            selector.update_servers(&set);

            let total: i64 = weights.iter().sum();
            let cycle = picks(&selector, usize::try_from(total).unwrap());
            for (i, weight) in weights.iter().enumerate() {
                let address = format!("s{i}:1");
                let count = cycle.iter().filter(|p| **p == address).count();
                prop_assert_eq!(i64::try_from(count).unwrap(), *weight);
            }
        }
    }
}
