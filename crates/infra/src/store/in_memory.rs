use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::keyed_store::{KeyedStore, StoreError};

/// In-memory keyed store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryKeyedStore {
    inner: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryKeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of records in a collection.
    pub fn count(&self, kind: &str) -> usize {
        self.inner
            .read()
            .map(|m| m.get(kind).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

impl KeyedStore for InMemoryKeyedStore {
    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(kind).and_then(|c| c.get(id)).cloned())
    }

    fn upsert(&self, kind: &str, id: &str, record: Value) -> Result<(), StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        map.entry(kind.to_string())
            .or_default()
            .insert(id.to_string(), record);
        Ok(())
    }

    fn remove(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get_mut(kind).and_then(|c| c.remove(id)).is_some())
    }

    fn list(&self, kind: &str) -> Result<Vec<Value>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map
            .get(kind)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
