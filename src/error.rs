use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuizStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No storage backend is usable: {0}")]
    BackendUnavailable(String),

    #[error("Backend quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Capacity exceeded: {required} bytes required, {remaining} of {ceiling} remaining")]
    CapacityExceeded {
        required: u64,
        remaining: u64,
        ceiling: u64,
    },

    #[error("Attachment {id} is {size} bytes, over the {class} ceiling of {ceiling} bytes")]
    AttachmentTooLarge {
        id: String,
        class: String,
        size: u64,
        ceiling: u64,
    },

    #[error("Corrupt record {collection}/{id}: {reason}")]
    CorruptRecord {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("Partial write: {applied} of {total} operations applied before failure: {reason}")]
    PartialWrite {
        applied: usize,
        total: usize,
        reason: String,
    },

    #[error("Auto-save failed after {attempts} attempts: {reason}")]
    AutoSaveFailed { attempts: u32, reason: String },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record {0} was recently deleted and cannot be re-created as a draft")]
    RecentlyDeleted(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CBOR serialization error: {0}")]
    SerializationCbor(#[from] serde_cbor::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<anyhow::Error> for QuizStoreError {
    fn from(err: anyhow::Error) -> Self {
        QuizStoreError::Unknown(err.to_string())
    }
}

/// Coarse classification handed to UI collaborators alongside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BackendUnavailable,
    QuotaExceeded,
    CapacityExceeded,
    CorruptRecord,
    PartialWrite,
    AutoSaveFailed,
    NotFound,
    RecentlyDeleted,
    InvalidRecord,
    Internal,
}

impl QuizStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuizStoreError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            QuizStoreError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            QuizStoreError::CapacityExceeded { .. } | QuizStoreError::AttachmentTooLarge { .. } => {
                ErrorKind::CapacityExceeded
            }
            QuizStoreError::CorruptRecord { .. } => ErrorKind::CorruptRecord,
            QuizStoreError::PartialWrite { .. } => ErrorKind::PartialWrite,
            QuizStoreError::AutoSaveFailed { .. } => ErrorKind::AutoSaveFailed,
            QuizStoreError::NotFound(_) => ErrorKind::NotFound,
            QuizStoreError::RecentlyDeleted(_) => ErrorKind::RecentlyDeleted,
            QuizStoreError::InvalidRecord(_) => ErrorKind::InvalidRecord,
            _ => ErrorKind::Internal,
        }
    }

    /// Refusals that retrying the same write cannot change.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            QuizStoreError::RecentlyDeleted(_)
                | QuizStoreError::AttachmentTooLarge { .. }
                | QuizStoreError::InvalidRecord(_)
        )
    }
}
