use chrono::{DateTime, Utc};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Speaker {
    Technician,
    Customer,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// One utterance of the visit conversation.
///
/// `turn_id` is the reconciliation key, stable once the backend persists the
/// turn; it is `None` for turns only the transcription provider has seen so
/// far, which fall back to `result_id` for matching.
///
/// `turn_index` orders turns within a single transcription sub-session only.
/// Sub-sessions restart indexing at 0, so it must never be used as a
/// cross-session sort key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Turn {
    pub turn_id: Option<i64>,
    pub result_id: String,
    pub speaker: Speaker,
    pub text: String,
    pub turn_index: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub word_timestamps: Vec<WordTimestamp>,
    pub is_partial: bool,
}
