use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::adapter::{encode, BackendAdapter, Served};
use crate::backend::{Collection, IndexRange, WriteOp};
use crate::capacity::{estimate_document_size, estimate_draft_size, CapacityLimits};
use crate::config::StorageConfig;
use crate::error::QuizStoreError;
use crate::model::{next_timestamp, Attachment, Document, DocumentStatus, Draft};
use crate::usage::UsageMonitor;

/// Finished documents, drafts and their attachments.
///
/// Every multi-record change is a single batch handed to the adapter, so it
/// is atomic on the primary store and reported as partial on the fallback.
pub struct DocumentStore {
    adapter: Arc<BackendAdapter>,
    config: Arc<StorageConfig>,
    usage: UsageMonitor,
}

impl DocumentStore {
    pub fn new(adapter: Arc<BackendAdapter>, config: Arc<StorageConfig>) -> Self {
        let limits = CapacityLimits {
            ceiling_bytes: config.capacity_ceiling_bytes,
            near_limit_threshold: config.near_limit_threshold,
        };
        Self {
            usage: UsageMonitor::new(adapter.clone(), limits),
            adapter,
            config,
        }
    }

    pub async fn initialize(&self) -> bool {
        self.adapter.initialize().await
    }

    pub fn usage(&self) -> &UsageMonitor {
        &self.usage
    }

    /// Persist a finished document and every attachment it references.
    /// Refused with `CapacityExceeded`, writing nothing, when the document
    /// would not fit in the remaining capacity.
    pub async fn save_document(&self, doc: &Document) -> crate::Result<Served<Document>> {
        self.commit_document(doc, false).await
    }

    /// Like `save_document`, and also deletes the draft sharing the
    /// document's id in the same batch.
    pub(crate) async fn commit_document(
        &self,
        doc: &Document,
        retire_draft: bool,
    ) -> crate::Result<Served<Document>> {
        validate_id(&doc.id)?;
        let refs = doc.attachment_refs();
        self.check_attachment_ceilings(&doc.attachments, &refs)?;

        let previous = self.load_document_lenient(&doc.id).await?;
        let draft = self.load_draft_lenient(&doc.id).await?;
        let mut used_fallback = previous.used_fallback || draft.used_fallback;

        let mut stored = doc.clone();
        stored.status = DocumentStatus::Finished;
        stored.updated_at = next_timestamp(previous.value.as_ref().map(|p| p.updated_at));
        if let Some(prev) = &previous.value {
            stored.created_at = prev.created_at;
        }

        let required = estimate_document_size(&stored)?;
        let usage = self.usage.get_usage().await?;
        if !usage.fits(required) {
            warn!(
                "Refusing to save document {}: needs {} bytes, {} remaining",
                stored.id, required, usage.remaining_bytes
            );
            return Err(QuizStoreError::CapacityExceeded {
                required,
                remaining: usage.remaining_bytes,
                ceiling: usage.ceiling_bytes,
            });
        }

        let mut batch = vec![WriteOp::Put {
            collection: Collection::Documents,
            record: encode(&stored.id, Some(stored.updated_at), &stored)?,
        }];
        batch.extend(self.attachment_puts(&stored.attachments, &refs).await?);

        let mut orphaned: BTreeSet<String> = previous
            .value
            .as_ref()
            .map(|p| p.attachment_refs())
            .unwrap_or_default();
        match (&draft.value, retire_draft) {
            (Some(draft), true) => {
                orphaned.extend(draft.attachment_refs());
                batch.push(WriteOp::Delete {
                    collection: Collection::Drafts,
                    id: draft.id.clone(),
                });
            }
            (Some(draft), false) => {
                let kept = draft.attachment_refs();
                orphaned.retain(|id| !kept.contains(id));
            }
            (None, _) => {}
        }
        batch.extend(attachment_deletes(orphaned.difference(&refs)));

        used_fallback |= self.adapter.apply(batch).await?.used_fallback;
        info!("Saved document {} ({} bytes)", stored.id, required);
        Ok(Served::new(stored, used_fallback))
    }

    /// Persist a draft unconditionally (no capacity gate), stamped with the
    /// current time.
    pub async fn save_draft(&self, draft: &Draft) -> crate::Result<Served<Draft>> {
        validate_id(&draft.id)?;
        let refs = draft.attachment_refs();
        self.check_attachment_ceilings(&draft.attachments, &refs)?;

        let previous = self.load_draft_lenient(&draft.id).await?;
        let finished = self.load_document_lenient(&draft.id).await?;
        let mut used_fallback = previous.used_fallback || finished.used_fallback;

        let mut stored = draft.clone();
        stored.is_draft = true;
        stored.last_saved = next_timestamp(previous.value.as_ref().map(|p| p.last_saved));
        stored.created_at = previous
            .value
            .as_ref()
            .and_then(|p| p.created_at)
            .or(draft.created_at)
            .or(Some(stored.last_saved));

        let mut batch = vec![WriteOp::Put {
            collection: Collection::Drafts,
            record: encode(&stored.id, Some(stored.last_saved), &stored)?,
        }];
        batch.extend(self.attachment_puts(&stored.attachments, &refs).await?);

        let mut orphaned = previous
            .value
            .as_ref()
            .map(|p| p.attachment_refs())
            .unwrap_or_default();
        if let Some(doc) = &finished.value {
            let kept = doc.attachment_refs();
            orphaned.retain(|id| !kept.contains(id));
        }
        batch.extend(attachment_deletes(orphaned.difference(&refs)));

        used_fallback |= self.adapter.apply(batch).await?.used_fallback;
        debug!(
            "Saved draft {} at {} ({} bytes)",
            stored.id,
            stored.last_saved,
            estimate_draft_size(&stored)?
        );
        Ok(Served::new(stored, used_fallback))
    }

    /// All finished documents, most recently updated first.
    pub async fn load_all_documents(&self) -> crate::Result<Served<Vec<Document>>> {
        let mut served = self
            .adapter
            .get_all_as::<Document>(Collection::Documents)
            .await?;
        served.value.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(served)
    }

    /// All drafts, most recently saved first.
    pub async fn load_all_drafts(&self) -> crate::Result<Served<Vec<Draft>>> {
        let mut served = self.adapter.get_all_as::<Draft>(Collection::Drafts).await?;
        served.value.sort_by(|a, b| b.last_saved.cmp(&a.last_saved));
        Ok(served)
    }

    pub async fn load_document(&self, id: &str) -> crate::Result<Served<Option<Document>>> {
        self.adapter.get_as(Collection::Documents, id).await
    }

    pub async fn load_draft(&self, id: &str) -> crate::Result<Served<Option<Draft>>> {
        self.adapter.get_as(Collection::Drafts, id).await
    }

    pub async fn load_attachment(&self, id: &str) -> crate::Result<Served<Option<Attachment>>> {
        self.adapter.get_as(Collection::Attachments, id).await
    }

    pub async fn drafts_saved_before(&self, cutoff: DateTime<Utc>) -> crate::Result<Served<Vec<Draft>>> {
        self.adapter
            .list_where_as(Collection::Drafts, IndexRange::Before(cutoff))
            .await
    }

    /// Delete a finished document and the attachments it references, except
    /// those a draft with the same id still uses. Deleting a missing id
    /// succeeds; the value reports whether a document existed.
    pub async fn delete_document(&self, id: &str) -> crate::Result<Served<bool>> {
        let doc = self.load_document_lenient(id).await?;
        let draft = self.load_draft_lenient(id).await?;

        let mut refs = doc.value.as_ref().map(|d| d.attachment_refs()).unwrap_or_default();
        if let Some(draft) = &draft.value {
            let kept = draft.attachment_refs();
            refs.retain(|a| !kept.contains(a));
        }

        let mut batch = vec![WriteOp::Delete {
            collection: Collection::Documents,
            id: id.to_string(),
        }];
        batch.extend(attachment_deletes(refs.iter()));
        let applied = self.adapter.apply(batch).await?;

        info!("Deleted document {}", id);
        Ok(Served::new(
            doc.value.is_some(),
            doc.used_fallback || draft.used_fallback || applied.used_fallback,
        ))
    }

    /// Delete a draft and the attachments only it references.
    pub async fn delete_draft(&self, id: &str) -> crate::Result<Served<bool>> {
        let draft = self.load_draft_lenient(id).await?;
        let doc = self.load_document_lenient(id).await?;

        let mut refs = draft.value.as_ref().map(|d| d.attachment_refs()).unwrap_or_default();
        if let Some(doc) = &doc.value {
            let kept = doc.attachment_refs();
            refs.retain(|a| !kept.contains(a));
        }

        let mut batch = vec![WriteOp::Delete {
            collection: Collection::Drafts,
            id: id.to_string(),
        }];
        batch.extend(attachment_deletes(refs.iter()));
        let applied = self.adapter.apply(batch).await?;

        debug!("Deleted draft {}", id);
        Ok(Served::new(
            draft.value.is_some(),
            draft.used_fallback || doc.used_fallback || applied.used_fallback,
        ))
    }

    /// Remove every trace of an id: document, draft and all attachments
    /// either references, in one batch.
    pub async fn purge(&self, id: &str) -> crate::Result<Served<bool>> {
        let doc = self.load_document_lenient(id).await?;
        let draft = self.load_draft_lenient(id).await?;

        let mut refs = doc.value.as_ref().map(|d| d.attachment_refs()).unwrap_or_default();
        refs.extend(draft.value.as_ref().map(|d| d.attachment_refs()).unwrap_or_default());

        let mut batch = vec![
            WriteOp::Delete {
                collection: Collection::Documents,
                id: id.to_string(),
            },
            WriteOp::Delete {
                collection: Collection::Drafts,
                id: id.to_string(),
            },
        ];
        batch.extend(attachment_deletes(refs.iter()));
        let applied = self.adapter.apply(batch).await?;

        info!("Purged {} ({} attachments)", id, refs.len());
        Ok(Served::new(
            doc.value.is_some() || draft.value.is_some(),
            doc.used_fallback || draft.used_fallback || applied.used_fallback,
        ))
    }

    fn check_attachment_ceilings(
        &self,
        attachments: &[Attachment],
        refs: &BTreeSet<String>,
    ) -> crate::Result<()> {
        for attachment in attachments.iter().filter(|a| refs.contains(&a.id)) {
            let ceiling = self.config.attachment_ceiling(attachment.mime_class);
            let size = attachment.payload.len() as u64;
            if size > ceiling {
                return Err(QuizStoreError::AttachmentTooLarge {
                    id: attachment.id.clone(),
                    class: attachment.mime_class.as_str().to_string(),
                    size,
                    ceiling,
                });
            }
        }
        Ok(())
    }

    /// Puts for referenced attachments whose stored bytes differ from what
    /// would be written. Unchanged attachments produce no write.
    async fn attachment_puts(
        &self,
        attachments: &[Attachment],
        refs: &BTreeSet<String>,
    ) -> crate::Result<Vec<WriteOp>> {
        let mut puts = Vec::new();
        for attachment in attachments {
            if !refs.contains(&attachment.id) {
                debug!("Skipping unreferenced attachment {}", attachment.id);
                continue;
            }
            let mut normalized = attachment.clone();
            normalized.byte_size = normalized.payload.len() as u64;
            let record = encode(&normalized.id, None, &normalized)?;

            let existing = self
                .adapter
                .get(Collection::Attachments, &normalized.id)
                .await?;
            if existing.value.map(|r| r.payload) == Some(record.payload.clone()) {
                continue;
            }
            puts.push(WriteOp::Put {
                collection: Collection::Attachments,
                record,
            });
        }
        Ok(puts)
    }

    async fn load_document_lenient(&self, id: &str) -> crate::Result<Served<Option<Document>>> {
        match self.load_document(id).await {
            Err(QuizStoreError::CorruptRecord { reason, .. }) => {
                warn!("Document {} is unreadable, treating as absent: {}", id, reason);
                Ok(Served::new(None, false))
            }
            other => other,
        }
    }

    async fn load_draft_lenient(&self, id: &str) -> crate::Result<Served<Option<Draft>>> {
        match self.load_draft(id).await {
            Err(QuizStoreError::CorruptRecord { reason, .. }) => {
                warn!("Draft {} is unreadable, treating as absent: {}", id, reason);
                Ok(Served::new(None, false))
            }
            other => other,
        }
    }
}

fn validate_id(id: &str) -> crate::Result<()> {
    if id.trim().is_empty() {
        return Err(QuizStoreError::InvalidRecord("record id is empty".to_string()));
    }
    Ok(())
}

fn attachment_deletes<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<WriteOp> {
    ids.map(|id| WriteOp::Delete {
        collection: Collection::Attachments,
        id: id.clone(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::estimate_size;
    use crate::fallback::FlatKvStore;
    use crate::model::{MimeClass, Question, Round};
    use crate::primary::StructuredStore;

    struct Fixture {
        primary: Arc<StructuredStore>,
        fallback: Arc<FlatKvStore>,
        store: DocumentStore,
    }

    fn fixture(config: StorageConfig) -> Fixture {
        let primary = Arc::new(StructuredStore::in_memory());
        let fallback = Arc::new(FlatKvStore::in_memory(config.fallback_quota_bytes));
        let adapter = Arc::new(BackendAdapter::new(primary.clone(), fallback.clone()));
        Fixture {
            primary,
            fallback,
            store: DocumentStore::new(adapter, Arc::new(config)),
        }
    }

    fn quiz_with_media(title: &str, media: usize) -> Document {
        let mut doc = Document::new(title);
        let mut questions = Vec::new();
        for i in 0..media {
            let mut question = Question::new(&format!("Question {}", i), "Answer");
            let attachment = Attachment::new(&question.id, MimeClass::Image, vec![i as u8; 32]);
            question.attachment_id = Some(attachment.id.clone());
            doc.attachments.push(attachment);
            questions.push(question);
        }
        doc.rounds.push(Round {
            title: "Round 1".to_string(),
            questions,
        });
        doc
    }

    async fn attachment_ids(store: &DocumentStore) -> Vec<String> {
        store
            .adapter
            .get_all(Collection::Attachments)
            .await
            .unwrap()
            .value
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    #[tokio::test]
    async fn test_save_document_persists_attachments_separately() {
        let fx = fixture(StorageConfig::default());
        let doc = quiz_with_media("Picture Round", 2);
        fx.store.save_document(&doc).await.unwrap();

        let loaded = fx.store.load_document(&doc.id).await.unwrap().value.unwrap();
        assert!(loaded.attachments.is_empty());
        assert_eq!(loaded.attachment_refs(), doc.attachment_refs());
        for id in doc.attachment_refs() {
            let attachment = fx.store.load_attachment(&id).await.unwrap().value.unwrap();
            assert_eq!(attachment.byte_size, 32);
        }
    }

    #[tokio::test]
    async fn test_resave_with_unchanged_attachments_succeeds() {
        let fx = fixture(StorageConfig::default());
        let doc = quiz_with_media("Picture Round", 1);
        let first = fx.store.save_document(&doc).await.unwrap().value;
        let second = fx.store.save_document(&doc).await.unwrap().value;
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(attachment_ids(&fx.store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_replacing_media_reclaims_orphans() {
        let fx = fixture(StorageConfig::default());
        let mut doc = quiz_with_media("Picture Round", 2);
        fx.store.save_document(&doc).await.unwrap();

        let dropped = doc.rounds[0].questions[1].attachment_id.take().unwrap();
        fx.store.save_document(&doc).await.unwrap();

        let remaining = attachment_ids(&fx.store).await;
        assert_eq!(remaining.len(), 1);
        assert!(!remaining.contains(&dropped));
    }

    #[tokio::test]
    async fn test_capacity_gate_refuses_without_writing() {
        let doc = quiz_with_media("Too Big", 3);
        let size = estimate_document_size(&doc).unwrap();
        let fx = fixture(StorageConfig {
            capacity_ceiling_bytes: size / 2,
            ..StorageConfig::default()
        });

        let err = fx.store.save_document(&doc).await.unwrap_err();
        assert!(matches!(err, QuizStoreError::CapacityExceeded { .. }));
        assert!(fx.store.load_all_documents().await.unwrap().value.is_empty());
        assert!(attachment_ids(&fx.store).await.is_empty());
    }

    #[tokio::test]
    async fn test_estimate_matches_reported_usage() {
        let fx = fixture(StorageConfig::default());
        let doc = quiz_with_media("Measured", 2);
        let estimate = estimate_document_size(&doc).unwrap();
        fx.store.save_document(&doc).await.unwrap();

        let usage = fx.store.usage().get_usage().await.unwrap();
        assert_eq!(usage.collections.documents + usage.collections.attachments, estimate);
    }

    /// A store over `adapter` whose ceiling is `ceiling_bytes`.
    fn store_with_ceiling(adapter: &Arc<BackendAdapter>, ceiling_bytes: u64) -> DocumentStore {
        let config = StorageConfig {
            capacity_ceiling_bytes: ceiling_bytes,
            ..StorageConfig::default()
        };
        DocumentStore::new(adapter.clone(), Arc::new(config))
    }

    async fn filled_adapter() -> (Arc<BackendAdapter>, u64) {
        let adapter = Arc::new(BackendAdapter::new(
            Arc::new(StructuredStore::in_memory()),
            Arc::new(FlatKvStore::in_memory(1 << 20)),
        ));
        let roomy = store_with_ceiling(&adapter, 1 << 20);
        roomy.save_document(&quiz_with_media("Already Stored", 2)).await.unwrap();
        let in_use = roomy.usage().get_usage().await.unwrap().total_bytes;
        (adapter, in_use)
    }

    #[tokio::test]
    async fn test_capacity_gate_counts_existing_usage() {
        let (adapter, in_use) = filled_adapter().await;
        let incoming = quiz_with_media("Incoming", 1);
        let required = estimate_document_size(&incoming).unwrap();
        // Fits on its own, but not on top of what is already stored.
        let store = store_with_ceiling(&adapter, in_use + required - 1);
        assert!(required < in_use + required - 1);

        let err = store.save_document(&incoming).await.unwrap_err();
        match err {
            QuizStoreError::CapacityExceeded {
                required: needed,
                remaining,
                ..
            } => {
                assert_eq!(needed, required);
                assert_eq!(remaining, required - 1);
            }
            other => panic!("expected CapacityExceeded, got {:?}", other),
        }
        assert_eq!(store.load_all_documents().await.unwrap().value.len(), 1);
        assert_eq!(attachment_ids(&store).await.len(), 2);
        assert_eq!(store.usage().get_usage().await.unwrap().total_bytes, in_use);
    }

    #[tokio::test]
    async fn test_capacity_gate_admits_exact_fit() {
        let (adapter, in_use) = filled_adapter().await;
        let incoming = quiz_with_media("Incoming", 1);
        let required = estimate_document_size(&incoming).unwrap();
        let store = store_with_ceiling(&adapter, in_use + required);

        store.save_document(&incoming).await.unwrap();
        let usage = store.usage().get_usage().await.unwrap();
        assert_eq!(usage.total_bytes, in_use + required);
        assert_eq!(usage.remaining_bytes, 0);
        assert_eq!(attachment_ids(&store).await.len(), 3);
    }

    #[tokio::test]
    async fn test_drafts_bypass_capacity_gate_but_not_attachment_ceiling() {
        let fx = fixture(StorageConfig {
            capacity_ceiling_bytes: 10,
            image_ceiling_bytes: 64,
            ..StorageConfig::default()
        });
        let mut draft = Draft::with_id("q1", "Geo Quiz");
        draft.rounds.push(Round {
            title: "Capitals".to_string(),
            questions: vec![Question::new("Capital of Peru?", "Lima")],
        });
        fx.store.save_draft(&draft).await.unwrap();
        let usage = fx.store.usage().get_usage().await.unwrap();
        let stored = fx.store.load_draft("q1").await.unwrap().value.unwrap();
        assert_eq!(usage.collections.drafts, estimate_size(&stored).unwrap());

        let question = &mut draft.rounds[0].questions[0];
        let attachment = Attachment::new(&question.id, MimeClass::Image, vec![0; 65]);
        question.attachment_id = Some(attachment.id.clone());
        draft.attachments.push(attachment);
        let err = fx.store.save_draft(&draft).await.unwrap_err();
        assert!(matches!(err, QuizStoreError::AttachmentTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_attachments_and_is_idempotent() {
        let fx = fixture(StorageConfig::default());
        let doc = quiz_with_media("Cascade", 3);
        fx.store.save_document(&doc).await.unwrap();

        assert!(fx.store.delete_document(&doc.id).await.unwrap().value);
        assert!(attachment_ids(&fx.store).await.is_empty());
        assert!(!fx.store.delete_document(&doc.id).await.unwrap().value);
        assert!(!fx.store.delete_document("never-existed").await.unwrap().value);
    }

    #[tokio::test]
    async fn test_delete_draft_keeps_attachments_shared_with_document() {
        let fx = fixture(StorageConfig::default());
        let doc = quiz_with_media("Shared", 1);
        fx.store.save_document(&doc).await.unwrap();

        let mut draft = Draft::with_id(&doc.id, "Shared (editing)");
        draft.rounds = doc.rounds.clone();
        fx.store.save_draft(&draft).await.unwrap();

        fx.store.delete_draft(&doc.id).await.unwrap();
        assert_eq!(attachment_ids(&fx.store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_document_skipped_in_listing() {
        let fx = fixture(StorageConfig::default());
        fx.primary.set_offline(true);
        fx.store.save_document(&Document::new("Fine")).await.unwrap();
        fx.fallback
            .insert_raw(Collection::Documents, "broken", r#"{"storedAt":"nope"}"#);

        let docs = fx.store.load_all_documents().await.unwrap();
        assert_eq!(docs.value.len(), 1);
        assert_eq!(docs.value[0].title, "Fine");
        assert!(docs.used_fallback);
    }

    #[tokio::test]
    async fn test_fallback_partial_cascade_is_reported() {
        let fx = fixture(StorageConfig {
            fallback_quota_bytes: 2048,
            ..StorageConfig::default()
        });
        fx.primary.set_offline(true);

        let mut doc = Document::new("Audio Round");
        let mut question = Question::new("Name the composer", "Bach");
        let attachment = Attachment::new(&question.id, MimeClass::Audio, vec![9; 4096]);
        question.attachment_id = Some(attachment.id.clone());
        doc.attachments.push(attachment);
        doc.rounds.push(Round {
            title: "Music".to_string(),
            questions: vec![question],
        });

        let err = fx.store.save_document(&doc).await.unwrap_err();
        assert!(matches!(err, QuizStoreError::PartialWrite { applied: 1, total: 2, .. }));
    }
}
