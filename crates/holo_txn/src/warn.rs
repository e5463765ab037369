//! Rate limiting for repeated warnings about the same stuck item.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Minimum spacing of repeated warnings about the same key.
pub const WARN_INTERVAL: Duration = Duration::from_secs(10);

/// True when `key` has not warned within `interval`; records the warning.
pub fn should_warn(last_warn: &mut BTreeMap<String, Instant>, key: &str, interval: Duration) -> bool {
    let now = Instant::now();
    prune_warnings(last_warn, interval, now);
    let should = !last_warn.contains_key(key);
    if should {
        last_warn.insert(key.to_string(), now);
    }
    should
}

/// Forget keys whose last warning is at least `interval` old.
pub fn prune_warnings(last_warn: &mut BTreeMap<String, Instant>, interval: Duration, now: Instant) {
    last_warn.retain(|_, ts| now.duration_since(*ts) < interval);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_are_rate_limited_per_key() {
        let mut last_warn = BTreeMap::new();
        assert!(should_warn(&mut last_warn, "txn-1", Duration::from_secs(60)));
        assert!(!should_warn(&mut last_warn, "txn-1", Duration::from_secs(60)));
        assert!(should_warn(&mut last_warn, "txn-2", Duration::from_secs(60)));
        assert!(should_warn(&mut last_warn, "txn-1", Duration::ZERO));
    }

    #[test]
    fn stale_warning_keys_are_pruned() {
        let interval = Duration::from_millis(20);
        let mut last_warn = BTreeMap::new();
        for txn_id in 0..20 {
            assert!(should_warn(&mut last_warn, &format!("finish-{txn_id}"), interval));
        }
        assert_eq!(last_warn.len(), 20);

        std::thread::sleep(Duration::from_millis(30));
        assert!(should_warn(&mut last_warn, "finish-100", interval));
        assert_eq!(last_warn.keys().collect::<Vec<_>>(), vec!["finish-100"]);

        std::thread::sleep(Duration::from_millis(30));
        prune_warnings(&mut last_warn, interval, Instant::now());
        assert!(last_warn.is_empty());
    }
}
