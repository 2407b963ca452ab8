use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QuizStoreError;
use crate::model::MimeClass;

const MIB: u64 = 1024 * 1024;

/// Tunables for the storage layer. Every field has a default, so a config
/// file only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub capacity_ceiling_bytes: u64,
    /// Fraction of the ceiling above which usage is reported as near the limit.
    pub near_limit_threshold: f64,
    pub image_ceiling_bytes: u64,
    pub audio_ceiling_bytes: u64,
    pub video_ceiling_bytes: u64,
    /// Quota of the flat key-value fallback store.
    pub fallback_quota_bytes: u64,
    pub autosave_debounce_ms: u64,
    pub autosave_retry_ceiling: u32,
    pub autosave_retry_backoff_ms: u64,
    pub autosave_saved_display_ms: u64,
    pub draft_max_age_days: u32,
    pub tombstone_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            capacity_ceiling_bytes: 100 * MIB,
            near_limit_threshold: 0.8,
            image_ceiling_bytes: 5 * MIB,
            audio_ceiling_bytes: 10 * MIB,
            video_ceiling_bytes: 50 * MIB,
            fallback_quota_bytes: 5 * MIB,
            autosave_debounce_ms: 30_000,
            autosave_retry_ceiling: 3,
            autosave_retry_backoff_ms: 5_000,
            autosave_saved_display_ms: 2_000,
            draft_max_age_days: 30,
            tombstone_ttl_secs: 600,
        }
    }
}

impl StorageConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| QuizStoreError::Configuration(format!("{}: {}", path.display(), e)))?;
        let config: StorageConfig = serde_json::from_str(&data)
            .map_err(|e| QuizStoreError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `QUIZKEEP_*` environment variables.
    pub fn from_env() -> crate::Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a lookup function keyed by environment variable name.
    pub fn with_overrides<F>(mut self, lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("QUIZKEEP_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        override_num(&lookup, "QUIZKEEP_CAPACITY_CEILING_BYTES", &mut self.capacity_ceiling_bytes)?;
        override_num(&lookup, "QUIZKEEP_NEAR_LIMIT_THRESHOLD", &mut self.near_limit_threshold)?;
        override_num(&lookup, "QUIZKEEP_IMAGE_CEILING_BYTES", &mut self.image_ceiling_bytes)?;
        override_num(&lookup, "QUIZKEEP_AUDIO_CEILING_BYTES", &mut self.audio_ceiling_bytes)?;
        override_num(&lookup, "QUIZKEEP_VIDEO_CEILING_BYTES", &mut self.video_ceiling_bytes)?;
        override_num(&lookup, "QUIZKEEP_FALLBACK_QUOTA_BYTES", &mut self.fallback_quota_bytes)?;
        override_num(&lookup, "QUIZKEEP_AUTOSAVE_DEBOUNCE_MS", &mut self.autosave_debounce_ms)?;
        override_num(&lookup, "QUIZKEEP_AUTOSAVE_RETRY_CEILING", &mut self.autosave_retry_ceiling)?;
        override_num(&lookup, "QUIZKEEP_AUTOSAVE_RETRY_BACKOFF_MS", &mut self.autosave_retry_backoff_ms)?;
        override_num(&lookup, "QUIZKEEP_DRAFT_MAX_AGE_DAYS", &mut self.draft_max_age_days)?;
        override_num(&lookup, "QUIZKEEP_TOMBSTONE_TTL_SECS", &mut self.tombstone_ttl_secs)?;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.capacity_ceiling_bytes == 0 {
            return Err(QuizStoreError::Configuration(
                "capacity_ceiling_bytes must be positive".to_string(),
            ));
        }
        if !(self.near_limit_threshold > 0.0 && self.near_limit_threshold <= 1.0) {
            return Err(QuizStoreError::Configuration(format!(
                "near_limit_threshold must be in (0, 1], got {}",
                self.near_limit_threshold
            )));
        }
        if self.autosave_retry_ceiling == 0 {
            return Err(QuizStoreError::Configuration(
                "autosave_retry_ceiling must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn attachment_ceiling(&self, class: MimeClass) -> u64 {
        match class {
            MimeClass::Image => self.image_ceiling_bytes,
            MimeClass::Audio => self.audio_ceiling_bytes,
            MimeClass::Video => self.video_ceiling_bytes,
        }
    }

    pub fn primary_path(&self) -> PathBuf {
        self.data_dir.join("primary.cbor")
    }

    pub fn fallback_path(&self) -> PathBuf {
        self.data_dir.join("fallback.json")
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn autosave_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.autosave_retry_backoff_ms)
    }

    pub fn autosave_saved_display(&self) -> Duration {
        Duration::from_millis(self.autosave_saved_display_ms)
    }

    pub fn tombstone_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.tombstone_ttl_secs as i64)
    }
}

fn override_num<F, T>(lookup: &F, key: &str, slot: &mut T) -> crate::Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| QuizStoreError::Configuration(format!("{}={:?}: {}", key, raw, e)))?;
    }
    Ok(())
}

fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "windows") {
        std::env::var("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("quizkeep")
    } else if cfg!(target_os = "macos") {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("Library/Application Support/quizkeep")
    } else {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".local/share/quizkeep")
    }
}
