//! Size accounting. Sizes are the length of the JSON serialization, which is
//! exactly what the backends store, so an estimate taken before a write
//! matches what usage reports after it.

use serde::{Deserialize, Serialize};

use crate::model::{Document, Draft};

/// Serialized size of any record.
pub fn estimate_size<T: Serialize>(record: &T) -> crate::Result<u64> {
    Ok(serde_json::to_vec(record)?.len() as u64)
}

/// Size a document will occupy once written: the document record plus every
/// attachment it references.
pub fn estimate_document_size(doc: &Document) -> crate::Result<u64> {
    let refs = doc.attachment_refs();
    let mut total = estimate_size(doc)?;
    for attachment in doc.attachments.iter().filter(|a| refs.contains(&a.id)) {
        total += estimate_size(attachment)?;
    }
    Ok(total)
}

pub fn estimate_draft_size(draft: &Draft) -> crate::Result<u64> {
    let refs = draft.attachment_refs();
    let mut total = estimate_size(draft)?;
    for attachment in draft.attachments.iter().filter(|a| refs.contains(&a.id)) {
        total += estimate_size(attachment)?;
    }
    Ok(total)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSizes {
    pub documents: u64,
    pub drafts: u64,
    pub attachments: u64,
}

impl CollectionSizes {
    pub fn total(&self) -> u64 {
        self.documents + self.drafts + self.attachments
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityLimits {
    pub ceiling_bytes: u64,
    pub near_limit_threshold: f64,
}

/// A point-in-time view of storage consumption. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub total_bytes: u64,
    pub collections: CollectionSizes,
    pub ceiling_bytes: u64,
    pub remaining_bytes: u64,
    /// 0.0..=1.0, may exceed 1.0 if the ceiling was lowered below current usage.
    pub percentage_used: f64,
    pub is_near_limit: bool,
}

impl UsageSnapshot {
    /// Whether `additional` more bytes still fit under the ceiling.
    pub fn fits(&self, additional: u64) -> bool {
        self.total_bytes.saturating_add(additional) <= self.ceiling_bytes
    }
}

pub fn compute_usage(collections: CollectionSizes, limits: &CapacityLimits) -> UsageSnapshot {
    let total_bytes = collections.total();
    let percentage_used = if limits.ceiling_bytes == 0 {
        1.0
    } else {
        total_bytes as f64 / limits.ceiling_bytes as f64
    };
    UsageSnapshot {
        total_bytes,
        collections,
        ceiling_bytes: limits.ceiling_bytes,
        remaining_bytes: limits.ceiling_bytes.saturating_sub(total_bytes),
        percentage_used,
        is_near_limit: percentage_used > limits.near_limit_threshold,
    }
}
