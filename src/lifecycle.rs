use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapter::Served;
use crate::document_store::DocumentStore;
use crate::error::QuizStoreError;
use crate::model::Document;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: usize,
    /// Ids whose deletion failed; they are retried on the next sweep.
    pub failed: Vec<String>,
}

/// Promotion of drafts to finished documents and removal of stale drafts.
pub struct DraftLifecycle {
    store: Arc<DocumentStore>,
}

impl DraftLifecycle {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Save `finished` and delete the draft it came from in one batch. If the
    /// save is refused nothing changes and the draft stays readable.
    pub async fn promote(
        &self,
        draft_id: &str,
        finished: &Document,
    ) -> crate::Result<Served<Document>> {
        if finished.id != draft_id {
            return Err(QuizStoreError::InvalidRecord(format!(
                "cannot promote draft {} into document {}",
                draft_id, finished.id
            )));
        }
        let promoted = self.store.commit_document(finished, true).await?;
        info!("Promoted draft {} to a finished document", draft_id);
        Ok(promoted)
    }

    pub async fn cleanup_aged(&self, max_age_days: u32) -> crate::Result<CleanupReport> {
        self.cleanup_aged_at(max_age_days, Utc::now()).await
    }

    /// Delete every draft last saved strictly before `now - max_age_days`.
    /// Individual failures are collected, not returned as an error.
    pub async fn cleanup_aged_at(
        &self,
        max_age_days: u32,
        now: DateTime<Utc>,
    ) -> crate::Result<CleanupReport> {
        let cutoff = now - Duration::days(max_age_days as i64);
        let aged = self.store.drafts_saved_before(cutoff).await?.value;

        let mut report = CleanupReport::default();
        for draft in aged {
            match self.store.delete_draft(&draft.id).await {
                Ok(_) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to remove aged draft {}: {}", draft.id, e);
                    report.failed.push(draft.id);
                }
            }
        }
        if report.removed > 0 {
            info!("Removed {} drafts older than {} days", report.removed, max_age_days);
        }
        Ok(report)
    }
}
