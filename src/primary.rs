use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{
    atomic_write, BackendKind, Collection, IndexRange, RawRecord, StorageBackend, WriteOp,
};
use crate::error::QuizStoreError;

#[derive(Default, Clone, Serialize, Deserialize)]
struct StoreInner {
    collections: BTreeMap<Collection, BTreeMap<String, RawRecord>>,
    // (indexed_at, id) per collection; rebuilt after load.
    #[serde(skip)]
    index: BTreeMap<Collection, BTreeSet<(DateTime<Utc>, String)>>,
}

impl StoreInner {
    fn put(&mut self, collection: Collection, record: RawRecord) {
        self.unindex(collection, &record.id);
        if let Some(at) = record.indexed_at {
            self.index
                .entry(collection)
                .or_default()
                .insert((at, record.id.clone()));
        }
        self.collections
            .entry(collection)
            .or_default()
            .insert(record.id.clone(), record);
    }

    fn delete(&mut self, collection: Collection, id: &str) {
        self.unindex(collection, id);
        if let Some(records) = self.collections.get_mut(&collection) {
            records.remove(id);
        }
    }

    fn unindex(&mut self, collection: Collection, id: &str) {
        let previous = self
            .collections
            .get(&collection)
            .and_then(|records| records.get(id))
            .and_then(|record| record.indexed_at);
        if let (Some(at), Some(index)) = (previous, self.index.get_mut(&collection)) {
            index.remove(&(at, id.to_string()));
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (collection, records) in &self.collections {
            let entries = records
                .values()
                .filter_map(|r| r.indexed_at.map(|at| (at, r.id.clone())))
                .collect();
            self.index.insert(*collection, entries);
        }
    }

    fn total_bytes(&self) -> u64 {
        self.collections
            .values()
            .flat_map(|records| records.values())
            .map(RawRecord::size)
            .sum()
    }
}

/// The preferred backend: named collections with a timestamp index, batch
/// writes applied all-or-nothing, and an optional CBOR snapshot on disk.
pub struct StructuredStore {
    inner: Arc<RwLock<StoreInner>>,
    persistence_path: Option<PathBuf>,
    quota_bytes: Option<u64>,
    offline: AtomicBool,
}

impl StructuredStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            persistence_path: None,
            quota_bytes: None,
            offline: AtomicBool::new(false),
        }
    }

    /// A store snapshotted to `path` after every committed batch. Existing
    /// state is loaded by `open`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            persistence_path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Make every operation fail as if the environment lost the store.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> crate::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QuizStoreError::BackendUnavailable(
                "primary store is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn with_read<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&StoreInner) -> R,
    {
        self.ensure_online()?;
        let guard = self
            .inner
            .read()
            .map_err(|e| QuizStoreError::Storage(e.to_string()))?;
        Ok(f(&guard))
    }

    /// Commit a batch. A file-backed store clones the whole state and writes
    /// the full CBOR snapshot per batch, so that work runs on the blocking
    /// pool instead of the async worker.
    async fn commit(&self, batch: Vec<WriteOp>) -> crate::Result<()> {
        self.ensure_online()?;
        let Some(path) = self.persistence_path.clone() else {
            return commit_batch(&self.inner, None, self.quota_bytes, batch);
        };

        let inner = Arc::clone(&self.inner);
        let quota = self.quota_bytes;
        tokio::task::spawn_blocking(move || commit_batch(&inner, Some(&path), quota, batch))
            .await
            .map_err(|e| QuizStoreError::Storage(format!("primary commit task failed: {}", e)))?
    }
}

/// Apply the batch to a copy of the state, check the quota, persist the
/// copy, then swap it in. Any failure leaves the live state untouched.
fn commit_batch(
    inner: &RwLock<StoreInner>,
    path: Option<&Path>,
    quota_bytes: Option<u64>,
    batch: Vec<WriteOp>,
) -> crate::Result<()> {
    let mut guard = inner
        .write()
        .map_err(|e| QuizStoreError::Storage(e.to_string()))?;

    let mut next = guard.clone();
    for op in batch {
        match op {
            WriteOp::Put { collection, record } => next.put(collection, record),
            WriteOp::Delete { collection, id } => next.delete(collection, &id),
        }
    }

    if let Some(quota) = quota_bytes {
        let current = guard.total_bytes();
        let projected = next.total_bytes();
        if projected > quota {
            return Err(QuizStoreError::QuotaExceeded {
                requested: projected.saturating_sub(current),
                available: quota.saturating_sub(current),
            });
        }
    }

    if let Some(path) = path {
        let bytes = serde_cbor::to_vec(&next)?;
        atomic_write(path, &bytes)?;
    }

    *guard = next;
    Ok(())
}

#[async_trait]
impl StorageBackend for StructuredStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Primary
    }

    fn is_transactional(&self) -> bool {
        true
    }

    async fn open(&self) -> crate::Result<()> {
        self.ensure_online()?;
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !path.exists() {
            debug!("No primary snapshot at {}, starting empty", path.display());
            return Ok(());
        }

        let bytes = std::fs::read(path).map_err(|e| QuizStoreError::FileSystem(e.to_string()))?;
        let mut loaded: StoreInner = serde_cbor::from_slice(&bytes).map_err(|e| {
            QuizStoreError::Storage(format!("primary snapshot {} is unreadable: {}", path.display(), e))
        })?;
        loaded.rebuild_index();

        let mut guard = self
            .inner
            .write()
            .map_err(|e| QuizStoreError::Storage(e.to_string()))?;
        *guard = loaded;
        info!("Loaded primary snapshot from {}", path.display());
        Ok(())
    }

    async fn put(&self, collection: Collection, record: RawRecord) -> crate::Result<()> {
        self.commit(vec![WriteOp::Put { collection, record }]).await
    }

    async fn get(&self, collection: Collection, id: &str) -> crate::Result<Option<RawRecord>> {
        self.with_read(|inner| {
            inner
                .collections
                .get(&collection)
                .and_then(|records| records.get(id))
                .cloned()
        })
    }

    async fn get_all(&self, collection: Collection) -> crate::Result<Vec<RawRecord>> {
        self.with_read(|inner| {
            inner
                .collections
                .get(&collection)
                .map(|records| records.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn delete(&self, collection: Collection, id: &str) -> crate::Result<()> {
        self.commit(vec![WriteOp::Delete {
            collection,
            id: id.to_string(),
        }])
        .await
    }

    async fn list_where(
        &self,
        collection: Collection,
        range: IndexRange,
    ) -> crate::Result<Vec<RawRecord>> {
        self.with_read(|inner| {
            let (Some(index), Some(records)) =
                (inner.index.get(&collection), inner.collections.get(&collection))
            else {
                return Vec::new();
            };
            let ids: Vec<&(DateTime<Utc>, String)> = match range {
                IndexRange::Before(end) => index.range(..(end, String::new())).collect(),
                IndexRange::AtOrAfter(start) => index.range((start, String::new())..).collect(),
                IndexRange::Between(start, end) => index
                    .range((start, String::new())..(end, String::new()))
                    .collect(),
            };
            ids.into_iter()
                .filter_map(|(_, id)| records.get(id).cloned())
                .collect()
        })
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> crate::Result<()> {
        self.commit(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, indexed_at: Option<DateTime<Utc>>, payload: &str) -> RawRecord {
        RawRecord {
            id: id.to_string(),
            indexed_at,
            stored_at: Utc::now(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = StructuredStore::in_memory();
        store.open().await.unwrap();
        store
            .put(Collection::Documents, record("a", None, "{}"))
            .await
            .unwrap();
        assert!(store.get(Collection::Documents, "a").await.unwrap().is_some());
        assert!(store.get(Collection::Drafts, "a").await.unwrap().is_none());

        store.delete(Collection::Documents, "a").await.unwrap();
        store.delete(Collection::Documents, "a").await.unwrap();
        assert!(store.get_all(Collection::Documents).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_where_uses_timestamp_index() {
        let store = StructuredStore::in_memory();
        let now = Utc::now();
        for (id, age) in [("old", 10), ("mid", 5), ("new", 0)] {
            store
                .put(
                    Collection::Drafts,
                    record(id, Some(now - Duration::days(age)), "{}"),
                )
                .await
                .unwrap();
        }
        // Re-stamping moves the record within the index.
        store
            .put(Collection::Drafts, record("mid", Some(now), "{}"))
            .await
            .unwrap();

        let stale = store
            .list_where(Collection::Drafts, IndexRange::Before(now - Duration::days(1)))
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);

        let fresh = store
            .list_where(Collection::Drafts, IndexRange::AtOrAfter(now))
            .await
            .unwrap();
        assert_eq!(fresh.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing_under_quota() {
        let store = StructuredStore::in_memory().with_quota(10);
        store
            .put(Collection::Documents, record("a", None, "12345"))
            .await
            .unwrap();

        let err = store
            .apply(vec![
                WriteOp::Delete {
                    collection: Collection::Documents,
                    id: "a".to_string(),
                },
                WriteOp::Put {
                    collection: Collection::Attachments,
                    record: record("big", None, "0123456789abc"),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, QuizStoreError::QuotaExceeded { .. }));
        assert!(store.get(Collection::Documents, "a").await.unwrap().is_some());
        assert!(store.get(Collection::Attachments, "big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_call() {
        let store = StructuredStore::in_memory();
        store.set_offline(true);
        assert!(store.open().await.is_err());
        assert!(store.get_all(Collection::Documents).await.is_err());
        assert!(store
            .put(Collection::Documents, record("a", None, "{}"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_rebuilds_index() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("primary.cbor");
        let at = Utc::now() - Duration::days(40);

        let store = StructuredStore::with_path(&path);
        store.open().await.unwrap();
        store
            .put(Collection::Drafts, record("q1", Some(at), r#"{"id":"q1"}"#))
            .await
            .unwrap();
        drop(store);

        let reopened = StructuredStore::with_path(&path);
        reopened.open().await.unwrap();
        let aged = reopened
            .list_where(Collection::Drafts, IndexRange::Before(Utc::now()))
            .await
            .unwrap();
        assert_eq!(aged.len(), 1);
        assert_eq!(aged[0].payload, br#"{"id":"q1"}"#.to_vec());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_file_backed_writes_all_land() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("primary.cbor");
        let store = Arc::new(StructuredStore::with_path(&path));
        store.open().await.unwrap();

        let writers: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let id = format!("q{}", n);
                    store
                        .put(Collection::Documents, record(&id, None, r#"{"n":1}"#))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let reopened = StructuredStore::with_path(&path);
        reopened.open().await.unwrap();
        assert_eq!(reopened.get_all(Collection::Documents).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_open() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("primary.cbor");
        std::fs::write(&path, b"not cbor at all").unwrap();

        let store = StructuredStore::with_path(&path);
        assert!(store.open().await.is_err());
    }
}
