//! The process-wide datacenter endpoint table.
//!
//! Starts from the built-in bootstrap addresses and can be atomically
//! replaced with the table the server publishes during the initial config
//! exchange. Readers grab an `Arc` snapshot; a publish swaps the whole map
//! so no reader ever sees a half-updated table.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// The datacenter a session falls back to when the endpoint is unknown.
pub const DEFAULT_DC: i32 = 4;

fn builtin() -> HashMap<i32, String> {
    [
        (1, "149.154.175.53:443"),
        (2, "149.154.167.51:443"),
        (3, "149.154.175.100:443"),
        (4, "149.154.167.91:443"),
        (5, "91.108.56.130:443"),
    ]
    .into_iter()
    .map(|(id, addr)| (id, addr.to_string()))
    .collect()
}

fn table() -> &'static RwLock<Arc<HashMap<i32, String>>> {
    static TABLE: OnceLock<RwLock<Arc<HashMap<i32, String>>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(Arc::new(builtin())))
}

/// The `host:port` for a datacenter id, if known.
pub fn lookup(dc_id: i32) -> Option<String> {
    table().read().unwrap().get(&dc_id).cloned()
}

/// Reverse lookup: which datacenter an endpoint belongs to.
///
/// Unknown endpoints report [`DEFAULT_DC`]; sessions restored from old
/// records may point at addresses that have since rotated out of the table.
pub fn dc_for_endpoint(endpoint: &str) -> i32 {
    table()
        .read()
        .unwrap()
        .iter()
        .find(|(_, addr)| addr.as_str() == endpoint)
        .map(|(id, _)| *id)
        .unwrap_or(DEFAULT_DC)
}

/// Replace the table with the server-provided one.
///
/// Entries missing from `new` keep their bootstrap values so a partial
/// config can never drop a reachable datacenter.
pub fn publish(new: HashMap<i32, String>) {
    let mut merged = builtin();
    merged.extend(new);
    *table().write().unwrap() = Arc::new(merged);
}

/// A snapshot of the current table.
pub fn snapshot() -> Arc<HashMap<i32, String>> {
    table().read().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_covers_dc_1_to_5() {
        for dc in 1..=5 {
            assert!(lookup(dc).is_some(), "missing bootstrap address for DC {dc}");
        }
        assert_eq!(lookup(0), None);
    }

    #[test]
    fn reverse_lookup_defaults_to_dc_4() {
        // DC 5 is never touched by the publish test below, so this stays
        // stable even with tests running in parallel.
        assert_eq!(dc_for_endpoint("91.108.56.130:443"), 5);
        assert_eq!(dc_for_endpoint("203.0.113.1:443"), DEFAULT_DC);
    }

    #[test]
    fn publish_replaces_atomically_and_merges() {
        let before = snapshot();
        publish([(2, "198.51.100.7:443".to_string())].into_iter().collect());
        assert_eq!(lookup(2).unwrap(), "198.51.100.7:443");
        // Untouched entries survive the replace.
        assert_eq!(lookup(5), before.get(&5).cloned());
        // Restore the bootstrap table for other tests.
        publish(HashMap::new());
    }
}
