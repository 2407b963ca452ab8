use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::adapter::BackendAdapter;
use crate::backend::Collection;
use crate::capacity::{compute_usage, CapacityLimits, CollectionSizes, UsageSnapshot};

/// Computes storage consumption per collection.
///
/// Sizes come from the stored payload lengths, so nothing is re-serialized.
/// `get_usage` always reads the backends; `last_snapshot` is the cheap,
/// possibly stale figure for display.
pub struct UsageMonitor {
    adapter: Arc<BackendAdapter>,
    limits: CapacityLimits,
    last: RwLock<Option<UsageSnapshot>>,
}

impl UsageMonitor {
    pub fn new(adapter: Arc<BackendAdapter>, limits: CapacityLimits) -> Self {
        Self {
            adapter,
            limits,
            last: RwLock::new(None),
        }
    }

    pub fn limits(&self) -> CapacityLimits {
        self.limits
    }

    pub async fn get_usage(&self) -> crate::Result<UsageSnapshot> {
        let (documents, drafts, attachments) = tokio::try_join!(
            self.adapter.collection_bytes(Collection::Documents),
            self.adapter.collection_bytes(Collection::Drafts),
            self.adapter.collection_bytes(Collection::Attachments),
        )?;
        let snapshot = compute_usage(
            CollectionSizes {
                documents: documents.value,
                drafts: drafts.value,
                attachments: attachments.value,
            },
            &self.limits,
        );

        if snapshot.is_near_limit {
            warn!(
                "Storage near limit: {} of {} bytes ({:.1}%)",
                snapshot.total_bytes,
                snapshot.ceiling_bytes,
                snapshot.percentage_used * 100.0
            );
        } else {
            debug!("Storage usage: {} bytes", snapshot.total_bytes);
        }

        if let Ok(mut last) = self.last.write() {
            *last = Some(snapshot);
        }
        Ok(snapshot)
    }

    pub fn last_snapshot(&self) -> Option<UsageSnapshot> {
        self.last.read().ok().and_then(|last| *last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::encode;
    use crate::fallback::FlatKvStore;
    use crate::primary::StructuredStore;

    fn monitor(ceiling: u64) -> (Arc<BackendAdapter>, UsageMonitor) {
        let adapter = Arc::new(BackendAdapter::new(
            Arc::new(StructuredStore::in_memory()),
            Arc::new(FlatKvStore::in_memory(1 << 20)),
        ));
        let limits = CapacityLimits {
            ceiling_bytes: ceiling,
            near_limit_threshold: 0.8,
        };
        (adapter.clone(), UsageMonitor::new(adapter, limits))
    }

    #[tokio::test]
    async fn test_usage_breaks_down_by_collection() {
        let (adapter, monitor) = monitor(1000);
        assert!(monitor.last_snapshot().is_none());

        let doc = encode("d", None, &"x".repeat(98)).unwrap(); // 100 bytes with quotes
        let draft = encode("r", None, &"y".repeat(48)).unwrap();
        adapter.put(Collection::Documents, doc).await.unwrap();
        adapter.put(Collection::Drafts, draft).await.unwrap();

        let usage = monitor.get_usage().await.unwrap();
        assert_eq!(usage.collections.documents, 100);
        assert_eq!(usage.collections.drafts, 50);
        assert_eq!(usage.collections.attachments, 0);
        assert_eq!(usage.remaining_bytes, 850);
        assert!(!usage.is_near_limit);
        assert_eq!(monitor.last_snapshot(), Some(usage));
    }

    #[tokio::test]
    async fn test_near_limit_flag() {
        let (adapter, monitor) = monitor(100);
        let big = encode("a", None, &"z".repeat(88)).unwrap();
        adapter.put(Collection::Attachments, big).await.unwrap();

        let usage = monitor.get_usage().await.unwrap();
        assert_eq!(usage.total_bytes, 90);
        assert!(usage.is_near_limit);
    }
}
