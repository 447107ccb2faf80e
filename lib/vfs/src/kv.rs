//! A small single-file key-value store.
//!
//! The whole store lives in one JSON file that is atomically rewritten on
//! every committed change (write to a sibling temp file, then rename over).
//! Writers batch their changes in a [`KvTx`]: nothing reaches the in-memory
//! map or the backing file until the transaction closure returns `Ok`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value as JsonValue;

use crate::{FsError, Result};

/// Ordered key-value store backed by a single file.
///
/// Keys are plain strings ordered lexicographically, which makes prefix
/// scans cheap (`range(prefix..)`), values are JSON records.
#[derive(Debug)]
pub struct SingleFileKv {
    path: PathBuf,
    inner: RwLock<BTreeMap<String, JsonValue>>,
}

impl SingleFileKv {
    /// Opens the store at `path`, creating an empty one if the file does not
    /// exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let entries = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|_| FsError::InvalidData)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            inner: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let inner = self.inner.read().map_err(|_| FsError::Lock)?;
        Ok(inner.get(key).cloned())
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let inner = self.inner.read().map_err(|_| FsError::Lock)?;
        Ok(inner.contains_key(key))
    }

    /// Calls `f` for every entry whose key starts with `prefix`, in key
    /// order. Iteration stops early if `f` returns `false`.
    pub fn for_each_prefix(
        &self,
        prefix: &str,
        mut f: impl FnMut(&str, &JsonValue) -> bool,
    ) -> Result<()> {
        let inner = self.inner.read().map_err(|_| FsError::Lock)?;
        for (key, value) in inner.range(prefix.to_owned()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if !f(key, value) {
                break;
            }
        }
        Ok(())
    }

    /// Runs `f` inside a write transaction.
    ///
    /// Changes are buffered in the [`KvTx`]; they are applied to the map and
    /// flushed to disk only when `f` returns `Ok`. On error the buffer is
    /// dropped and the store is untouched.
    pub fn update<T>(&self, f: impl FnOnce(&mut KvTx<'_>) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.write().map_err(|_| FsError::Lock)?;

        let mut tx = KvTx {
            store: &inner,
            pending: BTreeMap::new(),
        };
        let ret = f(&mut tx)?;
        let pending = tx.pending;

        if pending.is_empty() {
            return Ok(ret);
        }

        for (key, change) in pending {
            match change {
                Some(value) => {
                    inner.insert(key, value);
                }
                None => {
                    inner.remove(&key);
                }
            }
        }

        self.flush(&inner)?;
        Ok(ret)
    }

    /// Convenience for a single-key write.
    pub fn set(&self, key: &str, value: JsonValue) -> Result<()> {
        self.update(|tx| {
            tx.set(key, value);
            Ok(())
        })
    }

    /// Convenience for a single-key delete.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.update(|tx| {
            tx.delete(key);
            Ok(())
        })
    }

    fn flush(&self, entries: &BTreeMap<String, JsonValue>) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(entries).map_err(|_| FsError::InvalidData)?;

        // Write-then-rename so a crash mid-flush never truncates the store.
        let tmp_path = self.path.with_extension("kv.tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&serialized)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}

/// A buffered write transaction on a [`SingleFileKv`].
///
/// Reads see the transaction's own pending changes first, then the
/// committed map.
#[derive(Debug)]
pub struct KvTx<'a> {
    store: &'a BTreeMap<String, JsonValue>,
    // `None` marks a pending delete.
    pending: BTreeMap<String, Option<JsonValue>>,
}

impl KvTx<'_> {
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        match self.pending.get(key) {
            Some(change) => change.clone(),
            None => self.store.get(key).cloned(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match self.pending.get(key) {
            Some(change) => change.is_some(),
            None => self.store.contains_key(key),
        }
    }

    pub fn set(&mut self, key: &str, value: JsonValue) {
        self.pending.insert(key.to_owned(), Some(value));
    }

    pub fn delete(&mut self, key: &str) {
        self.pending.insert(key.to_owned(), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reopening_the_same_file_restores_the_same_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.kv");

        {
            let kv = SingleFileKv::open(&path).unwrap();
            kv.set("/files/a", json!({"file-mode": 420})).unwrap();
            kv.set("/files/b", json!({"file-mode": 493})).unwrap();
        }

        let kv = SingleFileKv::open(&path).unwrap();
        assert_eq!(kv.get("/files/a").unwrap(), Some(json!({"file-mode": 420})));
        assert_eq!(kv.get("/files/b").unwrap(), Some(json!({"file-mode": 493})));
        assert_eq!(kv.get("/files/c").unwrap(), None);
    }

    #[test]
    fn prefix_scan_only_visits_matching_keys() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SingleFileKv::open(dir.path().join("metadata.kv")).unwrap();

        kv.set("/files/a", json!(1)).unwrap();
        kv.set("/files/a/b", json!(2)).unwrap();
        kv.set("/files/ab", json!(3)).unwrap();
        kv.set("/other", json!(4)).unwrap();

        let mut seen = Vec::new();
        kv.for_each_prefix("/files/a", |key, _| {
            seen.push(key.to_owned());
            true
        })
        .unwrap();

        assert_eq!(seen, vec!["/files/a", "/files/a/b", "/files/ab"]);
    }

    #[test]
    fn failed_transaction_leaves_the_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SingleFileKv::open(dir.path().join("metadata.kv")).unwrap();
        kv.set("k", json!("committed")).unwrap();

        let result: Result<()> = kv.update(|tx| {
            tx.set("k", json!("doomed"));
            tx.set("k2", json!("doomed too"));
            Err(FsError::InvalidInput)
        });

        assert_eq!(result, Err(FsError::InvalidInput));
        assert_eq!(kv.get("k").unwrap(), Some(json!("committed")));
        assert_eq!(kv.get("k2").unwrap(), None);
    }

    #[test]
    fn transaction_reads_see_pending_changes() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SingleFileKv::open(dir.path().join("metadata.kv")).unwrap();
        kv.set("a", json!(1)).unwrap();

        kv.update(|tx| {
            tx.delete("a");
            assert!(!tx.contains("a"));
            assert_eq!(tx.get("a"), None);

            tx.set("b", json!(2));
            assert_eq!(tx.get("b"), Some(json!(2)));
            Ok(())
        })
        .unwrap();

        assert_eq!(kv.get("a").unwrap(), None);
        assert_eq!(kv.get("b").unwrap(), Some(json!(2)));
    }
}
