//! Debounced, retrying auto-save for one editing session.
//!
//! A scheduler owns all of its state. Dropping it (or calling `close`) aborts
//! every timer it armed, so no save fires after the session is torn down.
//! Writes that already started run to completion; their outcome is ignored
//! once the scheduler is closed.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::error::QuizStoreError;
use crate::model::Draft;

/// Where auto-saved drafts go.
#[async_trait]
pub trait DraftSink: Send + Sync {
    async fn persist_draft(&self, draft: &Draft) -> crate::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoSaveStatus {
    Idle,
    Saving,
    Saved,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSaveState {
    pub status: AutoSaveStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    /// Set once the retry ceiling is reached. Only `save_now` clears it.
    pub halted: bool,
}

impl AutoSaveState {
    fn idle() -> Self {
        Self {
            status: AutoSaveStatus::Idle,
            retry_count: 0,
            error: None,
            halted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSaveSettings {
    pub debounce: Duration,
    /// Total save attempts for one pending draft before giving up.
    pub retry_ceiling: u32,
    pub retry_backoff: Duration,
    pub saved_display: Duration,
}

impl AutoSaveSettings {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            debounce: config.autosave_debounce(),
            retry_ceiling: config.autosave_retry_ceiling.max(1),
            retry_backoff: config.autosave_retry_backoff(),
            saved_display: config.autosave_saved_display(),
        }
    }
}

/// Why an attempt failed, and whether retrying could help.
#[derive(Debug, Clone)]
struct SaveFailure {
    reason: String,
    permanent: bool,
}

impl From<QuizStoreError> for SaveFailure {
    fn from(err: QuizStoreError) -> Self {
        Self {
            permanent: err.is_permanent(),
            reason: err.to_string(),
        }
    }
}

#[derive(Default)]
struct Session {
    pending: Option<Draft>,
    generation: u64,
    retry_count: u32,
    timer: Option<JoinHandle<()>>,
    display_timer: Option<JoinHandle<()>>,
    closed: bool,
    halted: bool,
}

impl Session {
    fn abort_timers(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.display_timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    sink: Arc<dyn DraftSink>,
    settings: AutoSaveSettings,
    session: Mutex<Session>,
    status: watch::Sender<AutoSaveState>,
}

pub struct AutoSaveScheduler {
    inner: Arc<Inner>,
}

impl AutoSaveScheduler {
    pub fn new(sink: Arc<dyn DraftSink>, settings: AutoSaveSettings) -> Self {
        let (status, _) = watch::channel(AutoSaveState::idle());
        Self {
            inner: Arc::new(Inner {
                sink,
                settings,
                session: Mutex::new(Session::default()),
                status,
            }),
        }
    }

    /// Replace the pending draft and restart the debounce window.
    pub fn schedule(&self, draft: Draft) {
        let mut session = self.inner.lock();
        if session.closed {
            return;
        }
        session.pending = Some(draft);
        session.generation += 1;
        if session.halted {
            debug!("Auto-save halted, holding draft until a manual save");
            return;
        }
        let generation = session.generation;
        self.inner.arm(&mut session, self.inner.settings.debounce, generation);
    }

    /// Drop the pending draft, any armed timer and all retry state.
    pub fn cancel(&self) {
        let mut session = self.inner.lock();
        session.abort_timers();
        session.pending = None;
        session.generation += 1;
        session.retry_count = 0;
        session.halted = false;
        self.inner.status.send_replace(AutoSaveState::idle());
    }

    /// End the session. Nothing is saved afterwards.
    pub fn close(&self) {
        self.cancel();
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Save the pending draft immediately, bypassing the debounce and
    /// clearing a previous give-up. Returns false when nothing was pending.
    pub async fn save_now(&self) -> crate::Result<bool> {
        let (draft, generation) = {
            let mut session = self.inner.lock();
            if session.closed {
                return Ok(false);
            }
            session.halted = false;
            session.retry_count = 0;
            if let Some(timer) = session.timer.take() {
                timer.abort();
            }
            let Some(draft) = session.pending.clone() else {
                return Ok(false);
            };
            session.generation += 1;
            (draft, session.generation)
        };

        self.inner.publish(AutoSaveStatus::Saving, 0, None, false);
        let outcome = self
            .inner
            .sink
            .persist_draft(&draft)
            .await
            .map_err(SaveFailure::from);
        let attempts = self.inner.finish(generation, outcome.clone());
        match outcome {
            Ok(()) => Ok(true),
            Err(failure) => Err(QuizStoreError::AutoSaveFailed {
                attempts,
                reason: failure.reason,
            }),
        }
    }

    pub fn status(&self) -> AutoSaveState {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AutoSaveState> {
        self.inner.status.subscribe()
    }

    pub fn pending_id(&self) -> Option<String> {
        self.inner.lock().pending.as_ref().map(|d| d.id.clone())
    }
}

impl Drop for AutoSaveScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        // A panic while holding the lock leaves the session usable.
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, status: AutoSaveStatus, retry_count: u32, error: Option<String>, halted: bool) {
        self.status.send_replace(AutoSaveState {
            status,
            retry_count,
            error,
            halted,
        });
    }

    fn arm(self: &Arc<Self>, session: &mut Session, delay: Duration, generation: u64) {
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        let inner = Arc::clone(self);
        session.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(generation);
        }));
    }

    /// Timer expiry. The write runs in its own task so aborting a timer
    /// never cuts a write short.
    fn fire(self: &Arc<Self>, generation: u64) {
        let (draft, retry_count) = {
            let mut session = self.lock();
            if session.closed || session.generation != generation {
                return;
            }
            session.timer = None;
            match session.pending.clone() {
                Some(draft) => (draft, session.retry_count),
                None => return,
            }
        };
        self.publish(AutoSaveStatus::Saving, retry_count, None, false);
        debug!("Auto-saving draft {}", draft.id);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = inner.sink.persist_draft(&draft).await.map_err(SaveFailure::from);
            inner.finish(generation, outcome);
        });
    }

    /// Record a finished attempt and decide what happens next. Returns the
    /// number of consecutive failures so far. A permanent refusal halts at
    /// once instead of retrying.
    fn finish(self: &Arc<Self>, generation: u64, outcome: Result<(), SaveFailure>) -> u32 {
        let mut session = self.lock();
        if session.closed {
            debug!("Auto-save finished after the session closed");
            return session.retry_count;
        }
        let superseded = session.generation != generation;

        match outcome {
            Ok(()) => {
                if !superseded {
                    session.pending = None;
                }
                session.retry_count = 0;
                self.publish(AutoSaveStatus::Saved, 0, None, false);
                info!("Auto-save succeeded");

                if let Some(timer) = session.display_timer.take() {
                    timer.abort();
                }
                let inner = Arc::clone(self);
                let display = self.settings.saved_display;
                session.display_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(display).await;
                    inner.status.send_if_modified(|state| {
                        if state.status == AutoSaveStatus::Saved {
                            state.status = AutoSaveStatus::Idle;
                            true
                        } else {
                            false
                        }
                    });
                }));
                0
            }
            Err(SaveFailure { reason, permanent }) => {
                session.retry_count += 1;
                let attempts = session.retry_count;
                if permanent || attempts >= self.settings.retry_ceiling {
                    session.halted = true;
                    if let Some(timer) = session.timer.take() {
                        timer.abort();
                    }
                    let failure = QuizStoreError::AutoSaveFailed { attempts, reason };
                    if permanent {
                        warn!("Auto-save refused, not retrying: {}", failure);
                    } else {
                        error!("Giving up on auto-save: {}", failure);
                    }
                    self.publish(AutoSaveStatus::Idle, attempts, Some(failure.to_string()), true);
                } else {
                    warn!(
                        "Auto-save attempt {} of {} failed: {}",
                        attempts, self.settings.retry_ceiling, reason
                    );
                    self.publish(AutoSaveStatus::Error, attempts, Some(reason), false);
                    // A newer schedule already armed its own timer.
                    if !superseded {
                        self.arm(&mut session, self.settings.retry_backoff, generation);
                    }
                }
                attempts
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        saved: Mutex<Vec<Draft>>,
        attempts: AtomicU32,
        failing: AtomicBool,
        refusing: AtomicBool,
    }

    #[async_trait]
    impl DraftSink for RecordingSink {
        async fn persist_draft(&self, draft: &Draft) -> crate::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(QuizStoreError::BackendUnavailable("disk unplugged".to_string()));
            }
            if self.refusing.load(Ordering::SeqCst) {
                return Err(QuizStoreError::RecentlyDeleted(draft.id.clone()));
            }
            self.saved.lock().unwrap().push(draft.clone());
            Ok(())
        }
    }

    fn settings() -> AutoSaveSettings {
        AutoSaveSettings {
            debounce: Duration::from_secs(30),
            retry_ceiling: 3,
            retry_backoff: Duration::from_secs(5),
            saved_display: Duration::from_secs(2),
        }
    }

    fn scheduler() -> (Arc<RecordingSink>, AutoSaveScheduler) {
        let sink = Arc::new(RecordingSink::default());
        (sink.clone(), AutoSaveScheduler::new(sink, settings()))
    }

    async fn wait(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_schedules_coalesce_into_one_write() {
        let (sink, scheduler) = scheduler();
        let mut draft = Draft::with_id("q1", "Geo");
        for i in 0..5 {
            draft.title = format!("Geo v{}", i);
            scheduler.schedule(draft.clone());
            wait(1).await;
        }
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 0);

        wait(30).await;
        let saved = sink.saved.lock().unwrap().clone();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].title, "Geo v4");
        assert_eq!(scheduler.status().status, AutoSaveStatus::Saved);

        wait(3).await;
        assert_eq!(scheduler.status(), AutoSaveState::idle());
        assert!(scheduler.pending_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_ceiling() {
        let (sink, scheduler) = scheduler();
        sink.failing.store(true, Ordering::SeqCst);
        scheduler.schedule(Draft::with_id("q1", "Geo"));

        wait(31).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
        let state = scheduler.status();
        assert_eq!(state.status, AutoSaveStatus::Error);
        assert_eq!(state.retry_count, 1);

        wait(120).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        let state = scheduler.status();
        assert_eq!(state.status, AutoSaveStatus::Idle);
        assert!(state.halted);
        assert!(state.error.as_deref().unwrap().contains("3 attempts"));

        // Further edits are held, not retried automatically.
        scheduler.schedule(Draft::with_id("q1", "Geo edited"));
        wait(600).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert!(scheduler.status().halted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_refusal_is_not_retried() {
        let (sink, scheduler) = scheduler();
        sink.refusing.store(true, Ordering::SeqCst);
        scheduler.schedule(Draft::with_id("q1", "Geo"));

        wait(31).await;
        let state = scheduler.status();
        assert_eq!(state.status, AutoSaveStatus::Idle);
        assert!(state.halted);
        assert_eq!(state.retry_count, 1);
        assert!(state.error.as_deref().unwrap().contains("recently deleted"));

        wait(600).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_save_resumes_after_give_up() {
        let (sink, scheduler) = scheduler();
        sink.failing.store(true, Ordering::SeqCst);
        scheduler.schedule(Draft::with_id("q1", "Geo"));
        wait(200).await;
        assert!(scheduler.status().halted);

        sink.failing.store(false, Ordering::SeqCst);
        assert!(scheduler.save_now().await.unwrap());
        let state = scheduler.status();
        assert_eq!(state.status, AutoSaveStatus::Saved);
        assert!(!state.halted);
        assert_eq!(state.retry_count, 0);
        assert_eq!(sink.saved.lock().unwrap()[0].title, "Geo");

        // Debounced saves work again.
        scheduler.schedule(Draft::with_id("q1", "Geo again"));
        wait(31).await;
        assert_eq!(sink.saved.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_save_failure_is_reported() {
        let (sink, scheduler) = scheduler();
        assert!(!scheduler.save_now().await.unwrap());

        sink.failing.store(true, Ordering::SeqCst);
        scheduler.schedule(Draft::with_id("q1", "Geo"));
        let err = scheduler.save_now().await.unwrap_err();
        assert!(matches!(err, QuizStoreError::AutoSaveFailed { attempts: 1, .. }));
        assert_eq!(scheduler.status().status, AutoSaveStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_pending_save() {
        let (sink, scheduler) = scheduler();
        scheduler.schedule(Draft::with_id("q1", "Geo"));
        wait(10).await;
        scheduler.cancel();
        wait(60).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.status(), AutoSaveState::idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_scheduler_disarms_timer() {
        let (sink, scheduler) = scheduler();
        scheduler.schedule(Draft::with_id("q1", "Geo"));
        drop(scheduler);
        wait(60).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_scheduler_ignores_schedule() {
        let (sink, scheduler) = scheduler();
        scheduler.close();
        assert!(scheduler.is_closed());
        scheduler.schedule(Draft::with_id("q1", "Geo"));
        wait(60).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 0);
    }
}
