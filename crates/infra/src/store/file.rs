//! JSON-file backed keyed store.
//!
//! One file per collection (`<dir>/<kind>.json`, an object keyed by record id).
//! Every write rewrites the collection through a uniquely named temp file and
//! a rename, so a crash never leaves a half-written collection behind and
//! readers always see a whole file. Read-modify-write of a collection holds an
//! exclusive advisory lock on `<dir>/.<kind>.lock`, which serializes writers
//! across threads, store handles and processes sharing the directory.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fd_lock::RwLock;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::debug;

use super::keyed_store::{KeyedStore, StoreError};

#[derive(Debug)]
pub struct FileKeyedStore {
    dir: PathBuf,
}

impl FileKeyedStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| io_err(&dir, source))?;
        debug!(dir = %dir.display(), "opened file keyed store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{kind}.json"))
    }

    fn read_collection(&self, kind: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        let path = self.path_for(kind);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => return Err(io_err(&path, source)),
        };
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Codec {
            kind: kind.to_string(),
            source,
        })
    }

    fn write_collection(&self, kind: &str, records: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let path = self.path_for(kind);
        let bytes = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Codec {
            kind: kind.to_string(),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|source| io_err(&self.dir, source))?;
        tmp.write_all(&bytes).map_err(|source| io_err(tmp.path(), source))?;
        tmp.as_file().sync_all().map_err(|source| io_err(tmp.path(), source))?;
        tmp.persist(&path).map_err(|e| io_err(&path, e.error))?;
        Ok(())
    }

    /// Run `f` on the collection while holding its exclusive lock, writing
    /// the result back when `f` reports a change.
    fn modify<T>(
        &self,
        kind: &str,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> (T, bool),
    ) -> Result<T, StoreError> {
        let lock_path = self.dir.join(format!(".{kind}.lock"));
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| io_err(&lock_path, source))?;
        let mut lock = RwLock::new(lock_file);
        let _guard = lock.write().map_err(|source| io_err(&lock_path, source))?;

        let mut records = self.read_collection(kind)?;
        let (out, changed) = f(&mut records);
        if changed {
            self.write_collection(kind, &records)?;
        }
        Ok(out)
    }
}

// Reads go without the lock: writers replace the file by rename, so a reader
// sees either the previous or the next complete collection.
impl KeyedStore for FileKeyedStore {
    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_collection(kind)?.remove(id))
    }

    fn upsert(&self, kind: &str, id: &str, record: Value) -> Result<(), StoreError> {
        self.modify(kind, |records| {
            records.insert(id.to_string(), record);
            ((), true)
        })
    }

    fn remove(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        self.modify(kind, |records| {
            let removed = records.remove(id).is_some();
            (removed, removed)
        })
    }

    fn list(&self, kind: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.read_collection(kind)?.into_values().collect())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileKeyedStore::open(dir.path()).unwrap();
            store
                .upsert("queued-jobs", "j1", serde_json::json!({"status": "ready"}))
                .unwrap();
        }

        let store = FileKeyedStore::open(dir.path()).unwrap();
        let value = store.get("queued-jobs", "j1").unwrap().unwrap();
        assert_eq!(value["status"], "ready");
        assert_eq!(store.list("queued-jobs").unwrap().len(), 1);
    }

    #[test]
    fn missing_collection_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyedStore::open(dir.path()).unwrap();

        assert!(store.list("alert-events").unwrap().is_empty());
        assert!(!store.remove("alert-events", "nope").unwrap());
    }

    #[test]
    fn concurrent_writers_on_separate_handles_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let writers: Vec<_> = (0..2)
            .map(|w| {
                let store = FileKeyedStore::open(dir.path()).unwrap();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .upsert("job-executions", &format!("{w}-{i}"), serde_json::json!({ "n": i }))
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let store = FileKeyedStore::open(dir.path()).unwrap();
        assert_eq!(store.list("job-executions").unwrap().len(), 100);
        let stray: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.ends_with(".json") && !name.ends_with(".lock"))
            .collect();
        assert!(stray.is_empty(), "leftover temp files: {stray:?}");
    }

    #[test]
    fn corrupt_collection_surfaces_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("job-executions.json"), b"{not json").unwrap();
        let store = FileKeyedStore::open(dir.path()).unwrap();

        assert!(matches!(
            store.list("job-executions"),
            Err(StoreError::Codec { .. })
        ));
    }
}
