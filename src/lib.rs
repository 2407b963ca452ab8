pub mod adapter;
pub mod autosave;
pub mod backend;
pub mod capacity;
pub mod config;
pub mod document_store;
pub mod error;
pub mod fallback;
pub mod lifecycle;
pub mod model;
pub mod notice;
pub mod primary;
pub mod sync;
pub mod usage;

pub use adapter::{BackendAdapter, Served};
pub use autosave::{AutoSaveScheduler, AutoSaveSettings, AutoSaveState, AutoSaveStatus, DraftSink};
pub use backend::{Collection, RawRecord, StorageBackend, WriteOp};
pub use capacity::{estimate_document_size, estimate_size, UsageSnapshot};
pub use config::StorageConfig;
pub use document_store::DocumentStore;
pub use error::{ErrorKind, QuizStoreError};
pub use fallback::FlatKvStore;
pub use lifecycle::{CleanupReport, DraftLifecycle};
pub use model::{Attachment, Document, DocumentStatus, Draft, MimeClass, Question, Round};
pub use notice::{Notice, NoticeBus};
pub use primary::StructuredStore;
pub use sync::{OperationReport, SyncLayer, SyncStatus, SyncedViews};
pub use usage::UsageMonitor;

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, QuizStoreError>;
