//! The entry point the editing UI talks to.
//!
//! Mutations are serialized through an async gate and each one reloads the
//! documents list, drafts list and usage snapshot together before it
//! returns, so the three views never disagree. Failures come back as an
//! `OperationReport` rather than an error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{BackendAdapter, Served};
use crate::autosave::{AutoSaveScheduler, AutoSaveSettings, AutoSaveState, DraftSink};
use crate::backend::StorageBackend;
use crate::capacity::UsageSnapshot;
use crate::config::StorageConfig;
use crate::document_store::DocumentStore;
use crate::error::{ErrorKind, QuizStoreError};
use crate::fallback::FlatKvStore;
use crate::lifecycle::DraftLifecycle;
use crate::model::{Document, Draft};
use crate::notice::{Notice, NoticeBus};
use crate::primary::StructuredStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&QuizStoreError> for Failure {
    fn from(err: &QuizStoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub success: bool,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl OperationReport {
    fn ok(used_fallback: bool) -> Self {
        Self {
            success: true,
            used_fallback,
            error: None,
        }
    }

    fn failed(err: &QuizStoreError) -> Self {
        Self {
            success: false,
            used_fallback: false,
            error: Some(Failure::from(err)),
        }
    }
}

/// The derived views, always replaced together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncedViews {
    pub documents: Vec<Document>,
    pub drafts: Vec<Draft>,
    pub usage: Option<UsageSnapshot>,
}

struct AutoSaveSession {
    draft_id: String,
    token: u64,
    scheduler: Arc<AutoSaveScheduler>,
}

pub struct SyncLayer {
    me: Weak<SyncLayer>,
    store: Arc<DocumentStore>,
    lifecycle: DraftLifecycle,
    notices: NoticeBus,
    config: Arc<StorageConfig>,
    views: RwLock<SyncedViews>,
    status: watch::Sender<SyncStatus>,
    gate: tokio::sync::Mutex<()>,
    tombstones: Mutex<HashMap<String, DateTime<Utc>>>,
    degraded_announced: AtomicBool,
    autosave: Mutex<Option<AutoSaveSession>>,
    autosave_token: AtomicU64,
}

impl SyncLayer {
    /// File-backed layer rooted at `config.data_dir`.
    pub fn open(config: StorageConfig) -> crate::Result<Arc<Self>> {
        config.validate()?;
        let primary = Arc::new(StructuredStore::with_path(config.primary_path()));
        let fallback = Arc::new(FlatKvStore::with_path(
            config.fallback_path(),
            config.fallback_quota_bytes,
        ));
        Ok(Self::with_backends(config, primary, fallback, NoticeBus::new()))
    }

    pub fn with_backends(
        config: StorageConfig,
        primary: Arc<dyn StorageBackend>,
        fallback: Arc<dyn StorageBackend>,
        notices: NoticeBus,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let adapter = Arc::new(BackendAdapter::new(primary, fallback));
        let store = Arc::new(DocumentStore::new(adapter, config.clone()));
        let (status, _) = watch::channel(SyncStatus::Idle);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            lifecycle: DraftLifecycle::new(store.clone()),
            store,
            notices,
            config,
            views: RwLock::new(SyncedViews::default()),
            status,
            gate: tokio::sync::Mutex::new(()),
            tombstones: Mutex::new(HashMap::new()),
            degraded_announced: AtomicBool::new(false),
            autosave: Mutex::new(None),
            autosave_token: AtomicU64::new(0),
        })
    }

    /// Open the backends and load the initial views. Returns whether the
    /// primary store is active.
    pub async fn initialize_storage(&self) -> bool {
        let _gate = self.gate.lock().await;
        let primary_active = self.store.initialize().await;
        if !primary_active {
            self.note_fallback(true);
        }
        self.status.send_replace(SyncStatus::Syncing);
        match self.refresh_views().await {
            Ok(()) => self.status.send_replace(SyncStatus::Synced),
            Err(e) => {
                error!("Initial load failed: {}", e);
                self.status.send_replace(SyncStatus::Error)
            }
        };
        primary_active
    }

    pub async fn save_document(&self, doc: &Document) -> OperationReport {
        let _gate = self.gate.lock().await;
        self.run("save document", self.store.save_document(doc)).await
    }

    /// Save a draft. Ids deleted within the tombstone window are refused
    /// with `RecentlyDeleted`.
    pub async fn save_draft(&self, draft: &Draft) -> OperationReport {
        let _gate = self.gate.lock().await;
        self.run("save draft", self.guarded_draft_save(draft)).await
    }

    pub async fn load_documents(&self) -> Vec<Document> {
        let _gate = self.gate.lock().await;
        match self.store.load_all_documents().await {
            Ok(served) => {
                self.note_fallback(served.used_fallback);
                served.value
            }
            Err(e) => {
                warn!("Loading documents failed, returning last view: {}", e);
                self.views().documents
            }
        }
    }

    pub async fn load_drafts(&self) -> Vec<Draft> {
        let _gate = self.gate.lock().await;
        match self.store.load_all_drafts().await {
            Ok(served) => {
                self.note_fallback(served.used_fallback);
                served.value
            }
            Err(e) => {
                warn!("Loading drafts failed, returning last view: {}", e);
                self.views().drafts
            }
        }
    }

    /// Delete a finished document together with any draft sharing its id,
    /// then tell other views about it.
    pub async fn delete_document(&self, id: &str) -> OperationReport {
        self.end_auto_save_for(id);
        let _gate = self.gate.lock().await;
        let report = self
            .run("delete document", async {
                let purged = self.store.purge(id).await?;
                self.tombstone(id);
                Ok::<_, QuizStoreError>(purged)
            })
            .await;
        if report.success {
            info!("Announcing deletion of {}", id);
            self.notices.publish(Notice::RecordDeleted { id: id.to_string() });
        }
        report
    }

    pub async fn delete_draft(&self, id: &str) -> OperationReport {
        self.end_auto_save_for(id);
        let _gate = self.gate.lock().await;
        self.run("delete draft", self.store.delete_draft(id)).await
    }

    /// Turn a draft into a finished document. On failure the draft and its
    /// auto-save session are left as they were.
    pub async fn promote_draft(&self, draft_id: &str, finished: &Document) -> OperationReport {
        let _gate = self.gate.lock().await;
        let report = self
            .run("promote draft", self.lifecycle.promote(draft_id, finished))
            .await;
        if report.success {
            self.end_auto_save_for(draft_id);
        }
        report
    }

    pub async fn get_usage(&self) -> crate::Result<UsageSnapshot> {
        let usage = self.store.usage().get_usage().await?;
        if let Ok(mut views) = self.views.write() {
            views.usage = Some(usage);
        }
        Ok(usage)
    }

    /// Remove drafts older than `max_age_days` and return how many went.
    pub async fn cleanup_aged_drafts(&self, max_age_days: u32) -> usize {
        let _gate = self.gate.lock().await;
        self.status.send_replace(SyncStatus::Syncing);
        let removed = match self.lifecycle.cleanup_aged(max_age_days).await {
            Ok(report) => {
                if !report.failed.is_empty() {
                    warn!("{} aged drafts could not be removed", report.failed.len());
                }
                report.removed
            }
            Err(e) => {
                warn!("Draft cleanup failed: {}", e);
                0
            }
        };
        self.finish_sync(true).await;
        removed
    }

    /// Start (or continue) auto-saving `draft`. Switching to another draft
    /// ends the previous session.
    pub fn enable_auto_save(&self, draft: Draft) {
        let Ok(mut slot) = self.autosave.lock() else {
            error!("Auto-save state is unavailable");
            return;
        };
        let reuse = matches!(&*slot, Some(session) if session.draft_id == draft.id);
        if !reuse {
            if let Some(previous) = slot.take() {
                previous.scheduler.close();
            }
            let token = self.autosave_token.fetch_add(1, Ordering::SeqCst) + 1;
            let sink = Arc::new(LayerSink {
                layer: self.me.clone(),
                token,
            });
            let settings = AutoSaveSettings::from_config(&self.config);
            debug!("Starting auto-save session {} for {}", token, draft.id);
            *slot = Some(AutoSaveSession {
                draft_id: draft.id.clone(),
                token,
                scheduler: Arc::new(AutoSaveScheduler::new(sink, settings)),
            });
        }
        if let Some(session) = slot.as_ref() {
            session.scheduler.schedule(draft);
        }
    }

    pub fn disable_auto_save(&self) {
        if let Ok(mut slot) = self.autosave.lock() {
            if let Some(session) = slot.take() {
                debug!("Ending auto-save session {}", session.token);
                session.scheduler.close();
            }
        }
        self.autosave_token.fetch_add(1, Ordering::SeqCst);
    }

    pub fn auto_save_status(&self) -> Option<AutoSaveState> {
        self.scheduler().map(|scheduler| scheduler.status())
    }

    /// Flush the current auto-save session immediately.
    pub async fn save_now(&self) -> OperationReport {
        let Some(scheduler) = self.scheduler() else {
            return OperationReport::ok(false);
        };
        match scheduler.save_now().await {
            Ok(_) => OperationReport::ok(false),
            Err(e) => OperationReport::failed(&e),
        }
    }

    /// React to a notice from another view sharing the same data.
    pub async fn apply_notice(&self, notice: &Notice) {
        match notice {
            Notice::RecordDeleted { id } => {
                debug!("Reconciling after deletion of {}", id);
                self.end_auto_save_for(id);
                self.tombstone(id);
                let _gate = self.gate.lock().await;
                self.status.send_replace(SyncStatus::Syncing);
                self.finish_sync(true).await;
            }
            Notice::StorageDegraded => {
                info!("Another view reported degraded storage");
            }
        }
    }

    /// Apply every notice arriving on the bus until the layer is dropped.
    pub fn spawn_notice_listener(&self) -> JoinHandle<()> {
        let mut receiver = self.notices.subscribe();
        let layer = self.me.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(notice) => {
                        let Some(layer) = layer.upgrade() else {
                            break;
                        };
                        layer.apply_notice(&notice).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} notices", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn notices(&self) -> &NoticeBus {
        &self.notices
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn sync_status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn views(&self) -> SyncedViews {
        self.views.read().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        let Ok(mut tombstones) = self.tombstones.lock() else {
            return false;
        };
        let now = Utc::now();
        tombstones.retain(|_, expires| *expires > now);
        tombstones.contains_key(id)
    }

    /// Run one mutation with the gate already held, then reload the views.
    async fn run<T, Fut>(&self, op: &str, mutation: Fut) -> OperationReport
    where
        Fut: Future<Output = crate::Result<Served<T>>>,
    {
        match self.execute(op, mutation).await {
            Ok(used_fallback) => OperationReport::ok(used_fallback),
            Err(e) => OperationReport::failed(&e),
        }
    }

    /// `run` for callers that need the error itself. Returns whether the
    /// fallback served the mutation.
    async fn execute<T, Fut>(&self, op: &str, mutation: Fut) -> crate::Result<bool>
    where
        Fut: Future<Output = crate::Result<Served<T>>>,
    {
        self.status.send_replace(SyncStatus::Syncing);
        let result = match mutation.await {
            Ok(served) => {
                self.note_fallback(served.used_fallback);
                Ok(served.used_fallback)
            }
            Err(e) => {
                warn!("Failed to {}: {}", op, e);
                Err(e)
            }
        };
        // A failed fallback batch may still have applied a prefix.
        self.finish_sync(result.is_ok()).await;
        result
    }

    async fn finish_sync(&self, succeeded: bool) {
        match self.refresh_views().await {
            Ok(()) if succeeded => self.status.send_replace(SyncStatus::Synced),
            Ok(()) => self.status.send_replace(SyncStatus::Error),
            Err(e) => {
                warn!("Refreshing views failed: {}", e);
                self.status.send_replace(SyncStatus::Error)
            }
        };
    }

    async fn refresh_views(&self) -> crate::Result<()> {
        let (documents, drafts, usage) = tokio::try_join!(
            self.store.load_all_documents(),
            self.store.load_all_drafts(),
            self.store.usage().get_usage(),
        )?;
        self.note_fallback(documents.used_fallback || drafts.used_fallback);

        let mut views = self
            .views
            .write()
            .map_err(|e| QuizStoreError::Storage(e.to_string()))?;
        *views = SyncedViews {
            documents: documents.value,
            drafts: drafts.value,
            usage: Some(usage),
        };
        Ok(())
    }

    async fn guarded_draft_save(&self, draft: &Draft) -> crate::Result<Served<Draft>> {
        if self.is_tombstoned(&draft.id) {
            return Err(QuizStoreError::RecentlyDeleted(draft.id.clone()));
        }
        self.store.save_draft(draft).await
    }

    /// Save for an auto-save session, skipped when the session has ended
    /// while the write was waiting for the gate.
    async fn persist_for_session(&self, token: u64, draft: &Draft) -> crate::Result<()> {
        let _gate = self.gate.lock().await;
        if self.autosave_token.load(Ordering::SeqCst) != token {
            debug!("Dropping auto-save for ended session {}", token);
            return Ok(());
        }
        self.execute("auto-save draft", self.guarded_draft_save(draft))
            .await
            .map(|_| ())
    }

    fn tombstone(&self, id: &str) {
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.insert(id.to_string(), Utc::now() + self.config.tombstone_ttl());
        }
    }

    fn end_auto_save_for(&self, id: &str) {
        let Ok(mut slot) = self.autosave.lock() else {
            return;
        };
        if matches!(&*slot, Some(session) if session.draft_id == id) {
            if let Some(session) = slot.take() {
                debug!("Ending auto-save session {} for {}", session.token, id);
                session.scheduler.close();
            }
            self.autosave_token.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler(&self) -> Option<Arc<AutoSaveScheduler>> {
        self.autosave
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| s.scheduler.clone()))
    }

    fn note_fallback(&self, used_fallback: bool) {
        if used_fallback && !self.degraded_announced.swap(true, Ordering::SeqCst) {
            info!("Primary storage unavailable, continuing on the fallback store");
            self.notices.publish(Notice::StorageDegraded);
        }
    }
}

impl Drop for SyncLayer {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.autosave.lock() {
            if let Some(session) = slot.take() {
                session.scheduler.close();
            }
        }
    }
}

/// Routes auto-saves back through the layer without keeping it alive.
struct LayerSink {
    layer: Weak<SyncLayer>,
    token: u64,
}

#[async_trait]
impl DraftSink for LayerSink {
    async fn persist_draft(&self, draft: &Draft) -> crate::Result<()> {
        match self.layer.upgrade() {
            Some(layer) => layer.persist_for_session(self.token, draft).await,
            None => Err(QuizStoreError::Storage(
                "synchronization layer is closed".to_string(),
            )),
        }
    }
}
