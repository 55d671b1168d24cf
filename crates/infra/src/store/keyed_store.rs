use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Keyed store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,
    #[error("failed to encode/decode {kind} record: {source}")]
    Codec {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Generic CRUD over named collections of JSON documents.
///
/// Implementations must make each individual call atomic; callers that need a
/// read-modify-write sequence serialize it themselves.
pub trait KeyedStore: Send + Sync {
    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError>;
    fn upsert(&self, kind: &str, id: &str, record: Value) -> Result<(), StoreError>;
    /// Returns `true` if a record was removed.
    fn remove(&self, kind: &str, id: &str) -> Result<bool, StoreError>;
    fn list(&self, kind: &str) -> Result<Vec<Value>, StoreError>;
}

impl<S> KeyedStore for Arc<S>
where
    S: KeyedStore + ?Sized,
{
    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(kind, id)
    }

    fn upsert(&self, kind: &str, id: &str, record: Value) -> Result<(), StoreError> {
        (**self).upsert(kind, id, record)
    }

    fn remove(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        (**self).remove(kind, id)
    }

    fn list(&self, kind: &str) -> Result<Vec<Value>, StoreError> {
        (**self).list(kind)
    }
}

/// Store handle shared by all managers.
pub type SharedStore = Arc<dyn KeyedStore>;

/// A typed record living in one collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn key(&self) -> String;
}

/// Typed access on top of any [`KeyedStore`].
pub trait RecordStore: KeyedStore {
    fn load<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        match self.get(R::KIND, id)? {
            Some(value) => decode::<R>(value).map(Some),
            None => Ok(None),
        }
    }

    fn save<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let value = serde_json::to_value(record).map_err(|source| StoreError::Codec {
            kind: R::KIND.to_string(),
            source,
        })?;
        self.upsert(R::KIND, &record.key(), value)
    }

    fn delete<R: Record>(&self, id: &str) -> Result<bool, StoreError> {
        self.remove(R::KIND, id)
    }

    fn load_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        self.list(R::KIND)?.into_iter().map(decode::<R>).collect()
    }

    fn load_where<R: Record>(&self, filter: impl Fn(&R) -> bool) -> Result<Vec<R>, StoreError> {
        let mut out = Vec::new();
        for value in self.list(R::KIND)? {
            let record = decode::<R>(value)?;
            if filter(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }
}

impl<S: KeyedStore + ?Sized> RecordStore for S {}

fn decode<R: Record>(value: Value) -> Result<R, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Codec {
        kind: R::KIND.to_string(),
        source,
    })
}
