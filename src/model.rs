use std::collections::BTreeSet;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Finished,
}

/// Media type of an attachment; each has its own size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MimeClass {
    Image,
    Audio,
    Video,
}

impl MimeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            MimeClass::Image => "image",
            MimeClass::Audio => "audio",
            MimeClass::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

impl Question {
    pub fn new(prompt: &str, answer: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            answer: answer.to_string(),
            attachment_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub title: String,
    #[serde(default)]
    pub questions: Vec<Question>,
}

/// An embedded media blob. Persisted in its own collection and referenced
/// from a question by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub owner_question_id: String,
    pub byte_size: u64,
    pub mime_class: MimeClass,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
}

impl Attachment {
    pub fn new(owner_question_id: &str, mime_class: MimeClass, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_question_id: owner_question_id.to_string(),
            byte_size: payload.len() as u64,
            mime_class,
            payload,
        }
    }
}

/// A finished quiz.
///
/// `attachments` carries media embedded by the editor; it is never written
/// into the document record itself. The store persists each referenced
/// attachment separately and documents loaded back carry only references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub status: DocumentStatus,
    #[serde(default)]
    pub rounds: Vec<Round>,
    #[serde(with = "micros")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "micros")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

impl Document {
    pub fn new(title: &str) -> Self {
        let now = timestamp_now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            status: DocumentStatus::Finished,
            rounds: Vec::new(),
            created_at: now,
            updated_at: now,
            attachments: Vec::new(),
        }
    }

    pub fn attachment_refs(&self) -> BTreeSet<String> {
        attachment_refs(&self.rounds)
    }
}

/// An in-progress quiz saved incrementally while editing. Shares its id
/// with the document it is eventually promoted to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub rounds: Vec<Round>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "micros::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(with = "micros")]
    pub last_saved: DateTime<Utc>,
    pub is_draft: bool,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

impl Draft {
    /// Start editing a new quiz. The id is fixed from here on.
    pub fn new(title: &str) -> Self {
        Self::with_id(&Uuid::new_v4().to_string(), title)
    }

    pub fn with_id(id: &str, title: &str) -> Self {
        let now = timestamp_now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            rounds: Vec::new(),
            created_at: Some(now),
            last_saved: now,
            is_draft: true,
            attachments: Vec::new(),
        }
    }

    pub fn attachment_refs(&self) -> BTreeSet<String> {
        attachment_refs(&self.rounds)
    }

    /// Build the finished document this draft turns into, carrying the
    /// same id, content and embedded attachments.
    pub fn to_document(&self) -> Document {
        let now = timestamp_now();
        Document {
            id: self.id.clone(),
            title: self.title.clone(),
            status: DocumentStatus::Finished,
            rounds: self.rounds.clone(),
            created_at: self.created_at.unwrap_or(now),
            updated_at: now,
            attachments: self.attachments.clone(),
        }
    }
}

pub fn attachment_refs(rounds: &[Round]) -> BTreeSet<String> {
    rounds
        .iter()
        .flat_map(|round| round.questions.iter())
        .filter_map(|question| question.attachment_id.clone())
        .collect()
}

/// The current time at the microsecond precision records are stored with.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(Duration::microseconds(1)).unwrap_or(now)
}

/// Timestamp for a mutation of a record last stamped at `previous`,
/// strictly later than it even if the clock has not advanced.
pub fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = timestamp_now();
    match previous {
        Some(prev) if prev >= now => prev + Duration::milliseconds(1),
        _ => now,
    }
}

/// RFC 3339 with exactly six fractional digits, so a record's serialized
/// length does not change with the clock.
mod micros {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => super::serialize(at, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|at| at.with_timezone(&Utc))
                        .map_err(serde::de::Error::custom)
                })
                .transpose()
        }
    }
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
