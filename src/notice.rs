use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const NOTICE_CAPACITY: usize = 64;

/// Cross-view notices. Delivery is best effort: a lagging or absent
/// receiver simply misses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notice {
    /// A finished record and everything sharing its id were deleted.
    RecordDeleted { id: String },
    /// The primary store failed and the fallback served a request.
    StorageDegraded,
}

#[derive(Debug, Clone)]
pub struct NoticeBus {
    sender: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, notice: Notice) {
        // No subscribers is not an error for a best-effort channel.
        match self.sender.send(notice) {
            Ok(receivers) => debug!("Notice delivered to {} receivers", receivers),
            Err(broadcast::error::SendError(notice)) => {
                debug!("Notice {:?} dropped, nobody is listening", notice)
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}
