//! Raw storage backends.
//!
//! A backend stores opaque payloads in named collections. It knows nothing
//! about documents or drafts: the adapter encodes and decodes records, and
//! the document store decides what goes where.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QuizStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Documents,
    Drafts,
    Attachments,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Documents,
        Collection::Drafts,
        Collection::Attachments,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Documents => "documents",
            Collection::Drafts => "drafts",
            Collection::Attachments => "attachments",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Collection::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored record as a backend sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub id: String,
    /// Value of the collection's timestamp index, if the record has one.
    pub indexed_at: Option<DateTime<Utc>>,
    /// When this copy was written; used to pick the newest copy when both
    /// backends hold the same id.
    pub stored_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Range over a collection's timestamp index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRange {
    Before(DateTime<Utc>),
    AtOrAfter(DateTime<Utc>),
    Between(DateTime<Utc>, DateTime<Utc>),
}

impl IndexRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        match *self {
            IndexRange::Before(end) => at < end,
            IndexRange::AtOrAfter(start) => at >= start,
            IndexRange::Between(start, end) => at >= start && at < end,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        collection: Collection,
        record: RawRecord,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

impl WriteOp {
    pub fn collection(&self) -> Collection {
        match self {
            WriteOp::Put { collection, .. } | WriteOp::Delete { collection, .. } => *collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOp::Put { record, .. } => &record.id,
            WriteOp::Delete { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Primary,
    Fallback,
}

/// Uniform operation contract implemented by both backends.
///
/// Deleting a missing id succeeds. `apply` executes a batch in order; a
/// backend reporting `is_transactional` applies it all-or-nothing, others
/// stop at the first failure and report how far they got with
/// `QuizStoreError::PartialWrite`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn is_transactional(&self) -> bool;

    /// Prepare the backend for use, loading any persisted state.
    async fn open(&self) -> crate::Result<()>;

    async fn put(&self, collection: Collection, record: RawRecord) -> crate::Result<()>;

    async fn get(&self, collection: Collection, id: &str) -> crate::Result<Option<RawRecord>>;

    /// Every readable record in the collection. Unreadable entries are
    /// logged and skipped.
    async fn get_all(&self, collection: Collection) -> crate::Result<Vec<RawRecord>>;

    async fn delete(&self, collection: Collection, id: &str) -> crate::Result<()>;

    async fn list_where(
        &self,
        collection: Collection,
        range: IndexRange,
    ) -> crate::Result<Vec<RawRecord>>;

    async fn apply(&self, batch: Vec<WriteOp>) -> crate::Result<()>;
}

/// Write to a temporary file beside `path` and rename it into place.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    use rand::{thread_rng, Rng};

    let parent = path
        .parent()
        .ok_or_else(|| QuizStoreError::FileSystem(format!("Invalid path: {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| QuizStoreError::FileSystem(e.to_string()))?;

    let suffix: u64 = thread_rng().gen();
    let tmp = parent.join(format!(".tmp_quizkeep.{}.tmp", suffix));
    fs::write(&tmp, bytes).map_err(|e| QuizStoreError::FileSystem(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| QuizStoreError::FileSystem(e.to_string()))?;
    Ok(())
}
