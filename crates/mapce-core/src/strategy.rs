//! Connection-strategy persistence boundary.
//!
//! The strategy preference lives in an external configuration store; the
//! core only reads and writes through this trait. The bundled
//! implementation keeps entries in memory and round-trips them as JSON,
//! matching the external store's exchange format.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{Address, ConnectionStrategy};

/// Per-device connection-strategy store
pub trait StrategyStore: Send + Sync {
    /// Stored strategy for `address`, if any
    fn load(&self, address: Address) -> Option<ConnectionStrategy>;

    /// Persist the strategy for `address`
    fn store(&self, address: Address, strategy: ConnectionStrategy);
}

/// In-memory store with JSON import/export
#[derive(Default)]
pub struct JsonStrategyStore {
    entries: Mutex<HashMap<String, ConnectionStrategy>>,
}

impl JsonStrategyStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from its JSON exchange form.
    ///
    /// # Errors
    ///
    /// Returns the underlying deserialization error on malformed input.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let entries: HashMap<String, ConnectionStrategy> = serde_json::from_str(json)?;
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Serialize the store to its JSON exchange form
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(&*self.entries.lock().expect("store lock")).unwrap_or_default()
    }
}

impl StrategyStore for JsonStrategyStore {
    fn load(&self, address: Address) -> Option<ConnectionStrategy> {
        self.entries
            .lock()
            .expect("store lock")
            .get(&address.to_string())
            .copied()
    }

    fn store(&self, address: Address, strategy: ConnectionStrategy) {
        self.entries
            .lock()
            .expect("store lock")
            .insert(address.to_string(), strategy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_roundtrip() {
        let addr = Address::from_bytes([1, 2, 3, 4, 5, 6]);
        let store = JsonStrategyStore::new();
        assert!(store.load(addr).is_none());

        store.store(addr, ConnectionStrategy::Forbidden);
        assert_eq!(store.load(addr), Some(ConnectionStrategy::Forbidden));

        let json = store.to_json();
        let restored = JsonStrategyStore::from_json(&json).unwrap();
        assert_eq!(restored.load(addr), Some(ConnectionStrategy::Forbidden));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(JsonStrategyStore::from_json("not json").is_err());
    }
}
