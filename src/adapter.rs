//! One storage contract over two backends.
//!
//! The primary backend is opened once per adapter. While it is active every
//! call goes to it first; a call that fails there is retried on the fallback
//! and flagged `used_fallback`. The next call tries the primary again, so a
//! transient fault does not strand the session on the fallback.
//!
//! Because of that, a record can exist on both backends. Reads consult both
//! and keep the copy with the newest `stored_at`. Deletes that land on the
//! fallback while the primary is active are written as tombstones (records
//! with an empty payload) so the primary's stale copy stays hidden until the
//! primary itself is written again. A successful primary write clears the
//! fallback copies of every id it touched; a deleted id whose fallback copy
//! cannot be cleared gets a tombstone on the primary instead.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, Collection, IndexRange, RawRecord, StorageBackend, WriteOp};
use crate::error::QuizStoreError;

/// A value together with whether the fallback backend produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Served<T> {
    pub value: T,
    pub used_fallback: bool,
}

impl<T> Served<T> {
    pub fn new(value: T, used_fallback: bool) -> Self {
        Self {
            value,
            used_fallback,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Served<U> {
        Served {
            value: f(self.value),
            used_fallback: self.used_fallback,
        }
    }
}

pub struct BackendAdapter {
    primary: Arc<dyn StorageBackend>,
    fallback: Arc<dyn StorageBackend>,
    primary_ready: OnceCell<bool>,
}

impl BackendAdapter {
    pub fn new(primary: Arc<dyn StorageBackend>, fallback: Arc<dyn StorageBackend>) -> Self {
        Self {
            primary,
            fallback,
            primary_ready: OnceCell::new(),
        }
    }

    /// Open both backends. Returns whether the primary is active. Only the
    /// first call does any work.
    pub async fn initialize(&self) -> bool {
        *self
            .primary_ready
            .get_or_init(|| async {
                if let Err(e) = self.fallback.open().await {
                    warn!("Fallback store failed to open: {}", e);
                }
                match self.primary.open().await {
                    Ok(()) => {
                        info!("Primary store active");
                        true
                    }
                    Err(e) => {
                        warn!("Primary store unavailable, using fallback: {}", e);
                        false
                    }
                }
            })
            .await
    }

    pub async fn get(
        &self,
        collection: Collection,
        id: &str,
    ) -> crate::Result<Served<Option<RawRecord>>> {
        let served = self
            .read_both("get", |backend| async move { backend.get(collection, id).await }, newest)
            .await?;
        Ok(served.map(|record| record.filter(|r| !is_tombstone(r))))
    }

    pub async fn get_all(&self, collection: Collection) -> crate::Result<Served<Vec<RawRecord>>> {
        let served = self
            .read_both(
                "get_all",
                |backend| async move { backend.get_all(collection).await },
                merge_newest,
            )
            .await?;
        Ok(served.map(live_records))
    }

    pub async fn list_where(
        &self,
        collection: Collection,
        range: IndexRange,
    ) -> crate::Result<Served<Vec<RawRecord>>> {
        // The fallback contributes every copy it holds, tombstones included,
        // so a newer fallback copy can move a record out of the range or hide it.
        let served = self
            .read_both(
                "list_where",
                |backend| async move {
                    match backend.kind() {
                        BackendKind::Primary => backend.list_where(collection, range).await,
                        BackendKind::Fallback => backend.get_all(collection).await,
                    }
                },
                merge_newest,
            )
            .await?;
        Ok(served.map(|records| {
            live_records(records)
                .into_iter()
                .filter(|r| r.indexed_at.map(|at| range.contains(at)).unwrap_or(false))
                .collect()
        }))
    }

    pub async fn put(&self, collection: Collection, record: RawRecord) -> crate::Result<Served<()>> {
        self.apply(vec![WriteOp::Put { collection, record }]).await
    }

    pub async fn delete(&self, collection: Collection, id: &str) -> crate::Result<Served<()>> {
        self.apply(vec![WriteOp::Delete {
            collection,
            id: id.to_string(),
        }])
        .await
    }

    /// Run a batch. Atomic when the primary serves it; sequential with
    /// partial failures reported when the fallback does.
    pub async fn apply(&self, batch: Vec<WriteOp>) -> crate::Result<Served<()>> {
        let active = self.initialize().await;
        if batch.is_empty() {
            return Ok(Served::new((), !active));
        }

        let primary_error = if active {
            match self.primary.apply(batch.clone()).await {
                Ok(()) => {
                    self.clear_shadows(&batch).await?;
                    return Ok(Served::new((), false));
                }
                Err(e) => {
                    warn!("Primary write of {} ops failed, retrying on fallback: {}", batch.len(), e);
                    Some(e)
                }
            }
        } else {
            None
        };

        let fallback_batch = if active { with_tombstones(batch) } else { batch };
        match self.fallback.apply(fallback_batch).await {
            Ok(()) => Ok(Served::new((), true)),
            Err(e) => Err(both_failed("apply", primary_error, e)),
        }
    }

    /// Sum of stored payload sizes in a collection.
    pub async fn collection_bytes(&self, collection: Collection) -> crate::Result<Served<u64>> {
        Ok(self
            .get_all(collection)
            .await?
            .map(|records| records.iter().map(RawRecord::size).sum()))
    }

    pub async fn get_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> crate::Result<Served<Option<T>>> {
        let served = self.get(collection, id).await?;
        let value = match &served.value {
            Some(record) => Some(decode(collection, record)?),
            None => None,
        };
        Ok(Served::new(value, served.used_fallback))
    }

    /// All decodable records of a collection; corrupt ones are logged and
    /// skipped.
    pub async fn get_all_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> crate::Result<Served<Vec<T>>> {
        Ok(self
            .get_all(collection)
            .await?
            .map(|records| decode_all(collection, records)))
    }

    pub async fn list_where_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
        range: IndexRange,
    ) -> crate::Result<Served<Vec<T>>> {
        Ok(self
            .list_where(collection, range)
            .await?
            .map(|records| decode_all(collection, records)))
    }

    async fn read_both<T, F, Fut>(
        &self,
        op: &str,
        call: F,
        merge: fn(T, T) -> T,
    ) -> crate::Result<Served<T>>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let active = self.initialize().await;
        let (primary, fallback) = if active {
            let (p, f) = tokio::join!(call(self.primary.clone()), call(self.fallback.clone()));
            (Some(p), f)
        } else {
            (None, call(self.fallback.clone()).await)
        };

        match (primary, fallback) {
            (Some(Ok(p)), Ok(f)) => Ok(Served::new(merge(p, f), false)),
            (Some(Ok(p)), Err(e)) => {
                debug!("Fallback {} failed, primary result stands: {}", op, e);
                Ok(Served::new(p, false))
            }
            (Some(Err(e)), Ok(f)) => {
                warn!("Primary {} failed, served from fallback: {}", op, e);
                Ok(Served::new(f, true))
            }
            (None, Ok(f)) => Ok(Served::new(f, true)),
            (Some(Err(pe)), Err(fe)) => Err(both_failed(op, Some(pe), fe)),
            (None, Err(fe)) => Err(both_failed(op, None, fe)),
        }
    }

    /// Remove the fallback copies of every id in a batch the primary has
    /// applied. A deleted id whose copy cannot be removed is tombstoned on
    /// the primary, since the copy would otherwise come back once the
    /// fallback is reachable again.
    async fn clear_shadows(&self, batch: &[WriteOp]) -> crate::Result<()> {
        let now = Utc::now();
        let mut stranded = Vec::new();
        for op in batch {
            let (collection, id) = (op.collection(), op.id());
            if let Err(e) = self.fallback.delete(collection, id).await {
                match op {
                    WriteOp::Delete { .. } => {
                        warn!("Fallback copy of {}/{} not cleared, tombstoning: {}", collection, id, e);
                        stranded.push(tombstone(collection, id.to_string(), now));
                    }
                    WriteOp::Put { .. } => {
                        debug!("Could not clear fallback copy of {}/{}: {}", collection, id, e);
                    }
                }
            }
        }
        if stranded.is_empty() {
            return Ok(());
        }

        let applied = batch.len();
        let total = applied + stranded.len();
        self.primary
            .apply(stranded)
            .await
            .map_err(|e| QuizStoreError::PartialWrite {
                applied,
                total,
                reason: format!("deleted records may reappear from the fallback store: {}", e),
            })
    }
}

pub fn encode<T: Serialize>(
    id: &str,
    indexed_at: Option<DateTime<Utc>>,
    value: &T,
) -> crate::Result<RawRecord> {
    Ok(RawRecord {
        id: id.to_string(),
        indexed_at,
        stored_at: Utc::now(),
        payload: serde_json::to_vec(value)?,
    })
}

pub fn decode<T: DeserializeOwned>(collection: Collection, record: &RawRecord) -> crate::Result<T> {
    serde_json::from_slice(&record.payload).map_err(|e| QuizStoreError::CorruptRecord {
        collection: collection.to_string(),
        id: record.id.clone(),
        reason: e.to_string(),
    })
}

fn decode_all<T: DeserializeOwned>(collection: Collection, records: Vec<RawRecord>) -> Vec<T> {
    records
        .iter()
        .filter_map(|record| match decode(collection, record) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping record: {}", e);
                None
            }
        })
        .collect()
}

fn is_tombstone(record: &RawRecord) -> bool {
    record.payload.is_empty()
}

fn newest(primary: Option<RawRecord>, fallback: Option<RawRecord>) -> Option<RawRecord> {
    match (primary, fallback) {
        (Some(p), Some(f)) if f.stored_at > p.stored_at => Some(f),
        (Some(p), _) => Some(p),
        (None, f) => f,
    }
}

fn merge_newest(primary: Vec<RawRecord>, fallback: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut merged: HashMap<String, RawRecord> = HashMap::new();
    for record in primary.into_iter().chain(fallback) {
        match merged.get(&record.id) {
            Some(existing) if existing.stored_at >= record.stored_at => {}
            _ => {
                merged.insert(record.id.clone(), record);
            }
        }
    }
    merged.into_values().collect()
}

fn live_records(records: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut live: Vec<RawRecord> = records.into_iter().filter(|r| !is_tombstone(r)).collect();
    live.sort_by(|a, b| a.id.cmp(&b.id));
    live
}

fn tombstone(collection: Collection, id: String, stored_at: DateTime<Utc>) -> WriteOp {
    WriteOp::Put {
        collection,
        record: RawRecord {
            id,
            indexed_at: None,
            stored_at,
            payload: Vec::new(),
        },
    }
}

fn with_tombstones(batch: Vec<WriteOp>) -> Vec<WriteOp> {
    let now = Utc::now();
    batch
        .into_iter()
        .map(|op| match op {
            WriteOp::Delete { collection, id } => tombstone(collection, id, now),
            put => put,
        })
        .collect()
}

fn both_failed(op: &str, primary: Option<QuizStoreError>, fallback: QuizStoreError) -> QuizStoreError {
    match fallback {
        // Refusals from the fallback are meaningful to the caller as-is.
        e @ (QuizStoreError::QuotaExceeded { .. }
        | QuizStoreError::PartialWrite { .. }
        | QuizStoreError::CorruptRecord { .. }
        | QuizStoreError::InvalidRecord(_)) => e,
        e => {
            let primary = primary
                .map(|p| p.to_string())
                .unwrap_or_else(|| "not active".to_string());
            QuizStoreError::BackendUnavailable(format!(
                "{} failed on both stores (primary: {}; fallback: {})",
                op, primary, e
            ))
        }
    }
}
