use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{
    atomic_write, BackendKind, Collection, IndexRange, RawRecord, StorageBackend, WriteOp,
};
use crate::error::QuizStoreError;

const KEY_PREFIX: &str = "quizkeep";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    indexed_at: Option<DateTime<Utc>>,
    stored_at: DateTime<Utc>,
    payload: String,
}

fn key_for(collection: Collection, id: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, collection.as_str(), id)
}

fn collection_prefix(collection: Collection) -> String {
    format!("{}:{}:", KEY_PREFIX, collection.as_str())
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// Flat string key-value store used when the primary store is unusable.
/// Collections are encoded into the key; every value is a JSON envelope.
/// No transactions: batches run one operation at a time.
pub struct FlatKvStore {
    entries: RwLock<BTreeMap<String, String>>,
    persistence_path: Option<PathBuf>,
    quota_bytes: u64,
    offline: AtomicBool,
    // Set when the file on disk exists but could not be loaded. Writing
    // would replace it with only the new entries.
    unreadable: AtomicBool,
}

impl FlatKvStore {
    pub fn in_memory(quota_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            persistence_path: None,
            quota_bytes,
            offline: AtomicBool::new(false),
            unreadable: AtomicBool::new(false),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            persistence_path: Some(path.into()),
            ..Self::in_memory(quota_bytes)
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Store a raw value under a record key, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, collection: Collection, id: &str, value: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key_for(collection, id), value.to_string());
        }
    }

    fn ensure_online(&self) -> crate::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QuizStoreError::BackendUnavailable(
                "fallback store is offline".to_string(),
            ));
        }
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(QuizStoreError::BackendUnavailable(
                "fallback file could not be loaded; leaving it untouched".to_string(),
            ));
        }
        Ok(())
    }

    fn load(path: &Path) -> crate::Result<BTreeMap<String, String>> {
        let data =
            std::fs::read_to_string(path).map_err(|e| QuizStoreError::FileSystem(e.to_string()))?;
        Ok(serde_json::from_str(&data)?)
    }

    fn decode(collection: Collection, id: &str, value: &str) -> crate::Result<RawRecord> {
        let envelope: Envelope =
            serde_json::from_str(value).map_err(|e| QuizStoreError::CorruptRecord {
                collection: collection.to_string(),
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(RawRecord {
            id: id.to_string(),
            indexed_at: envelope.indexed_at,
            stored_at: envelope.stored_at,
            payload: envelope.payload.into_bytes(),
        })
    }

    fn encode(collection: Collection, record: RawRecord) -> crate::Result<String> {
        let payload = String::from_utf8(record.payload).map_err(|e| {
            QuizStoreError::InvalidRecord(format!(
                "{}/{} payload is not UTF-8: {}",
                collection, record.id, e
            ))
        })?;
        Ok(serde_json::to_string(&Envelope {
            indexed_at: record.indexed_at,
            stored_at: record.stored_at,
            payload,
        })?)
    }

    fn scan(&self, collection: Collection) -> crate::Result<Vec<RawRecord>> {
        self.ensure_online()?;
        let entries = self
            .entries
            .read()
            .map_err(|e| QuizStoreError::Storage(e.to_string()))?;
        let prefix = collection_prefix(collection);
        let mut records = Vec::new();
        for (key, value) in entries.range(prefix.clone()..) {
            let Some(id) = key.strip_prefix(&prefix) else {
                break;
            };
            match Self::decode(collection, id, value) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable fallback entry: {}", e),
            }
        }
        Ok(records)
    }

    fn write_one(&self, op: WriteOp) -> crate::Result<()> {
        self.ensure_online()?;
        let mut entries = self
            .entries
            .write()
            .map_err(|e| QuizStoreError::Storage(e.to_string()))?;

        let (key, value) = match op {
            WriteOp::Put { collection, record } => {
                let key = key_for(collection, &record.id);
                let value = Self::encode(collection, record)?;
                (key, Some(value))
            }
            WriteOp::Delete { collection, id } => (key_for(collection, &id), None),
        };
        if value.is_none() && !entries.contains_key(&key) {
            return Ok(());
        }

        if let Some(value) = &value {
            let used: u64 = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
            let replaced = entries.get(&key).map(|v| entry_size(&key, v)).unwrap_or(0);
            let requested = entry_size(&key, value);
            let available = self.quota_bytes.saturating_sub(used - replaced);
            if requested > available {
                return Err(QuizStoreError::QuotaExceeded {
                    requested,
                    available,
                });
            }
        }

        let previous = match value {
            Some(value) => entries.insert(key.clone(), value),
            None => entries.remove(&key),
        };

        if let Some(path) = &self.persistence_path {
            let persisted = serde_json::to_vec_pretty(&*entries)
                .map_err(QuizStoreError::from)
                .and_then(|bytes| atomic_write(path, &bytes));
            if let Err(e) = persisted {
                match previous {
                    Some(old) => entries.insert(key, old),
                    None => entries.remove(&key),
                };
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlatKvStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    fn is_transactional(&self) -> bool {
        false
    }

    async fn open(&self) -> crate::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QuizStoreError::BackendUnavailable(
                "fallback store is offline".to_string(),
            ));
        }
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let loaded = match Self::load(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.unreadable.store(true, Ordering::SeqCst);
                warn!("Fallback file {} is unreadable: {}", path.display(), e);
                return Err(e);
            }
        };
        let mut entries = self
            .entries
            .write()
            .map_err(|e| QuizStoreError::Storage(e.to_string()))?;
        *entries = loaded;
        self.unreadable.store(false, Ordering::SeqCst);
        debug!("Loaded {} fallback entries from {}", entries.len(), path.display());
        Ok(())
    }

    async fn put(&self, collection: Collection, record: RawRecord) -> crate::Result<()> {
        self.write_one(WriteOp::Put { collection, record })
    }

    async fn get(&self, collection: Collection, id: &str) -> crate::Result<Option<RawRecord>> {
        self.ensure_online()?;
        let entries = self
            .entries
            .read()
            .map_err(|e| QuizStoreError::Storage(e.to_string()))?;
        entries
            .get(&key_for(collection, id))
            .map(|value| Self::decode(collection, id, value))
            .transpose()
    }

    async fn get_all(&self, collection: Collection) -> crate::Result<Vec<RawRecord>> {
        self.scan(collection)
    }

    async fn delete(&self, collection: Collection, id: &str) -> crate::Result<()> {
        self.write_one(WriteOp::Delete {
            collection,
            id: id.to_string(),
        })
    }

    async fn list_where(
        &self,
        collection: Collection,
        range: IndexRange,
    ) -> crate::Result<Vec<RawRecord>> {
        Ok(self
            .scan(collection)?
            .into_iter()
            .filter(|r| r.indexed_at.map(|at| range.contains(at)).unwrap_or(false))
            .collect())
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> crate::Result<()> {
        let total = batch.len();
        for (applied, op) in batch.into_iter().enumerate() {
            let label = format!("{}/{}", op.collection(), op.id());
            if let Err(e) = self.write_one(op) {
                if applied == 0 {
                    return Err(e);
                }
                warn!("Fallback batch stopped at {} after {} of {} ops", label, applied, total);
                return Err(QuizStoreError::PartialWrite {
                    applied,
                    total,
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }
}
