use chrono::{DateTime, Utc};

/// Inbound control payloads, tagged by `type`.
///
/// `cached_turns` elements arrive as raw JSON values rather than typed
/// structs: the backend is known to emit partially-populated elements, and a
/// single bad element must be dropped without discarding the rest of the
/// snapshot. Use [`WireTurn::from_value`] per element.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    CachedTurns { turns: Vec<serde_json::Value> },
    ProactiveSuggestions { data: serde_json::Value },
    SessionEnded,
}

/// Caller-initiated signals sent as plain JSON text, never through the
/// `0x01` frame tag.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundControl {
    EndSession,
}

impl OutboundControl {
    pub fn to_json(&self) -> String {
        // Infallible for a unit-only enum.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WireWord {
    pub word: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// One `cached_turns` element as the backend serializes it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WireTurn {
    #[serde(default)]
    pub turn_id: Option<i64>,
    pub provider_result_id: String,
    pub turn_index: i64,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub words: Option<Vec<WireWord>>,
    #[serde(default)]
    pub is_partial: Option<bool>,
}

impl WireTurn {
    /// Parse and validate one snapshot element. `None` means the element is
    /// dropped: `provider_result_id` must be a non-empty string,
    /// `turn_index` an integer, and `text` a string.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let turn: Self = serde_json::from_value(value.clone()).ok()?;
        if turn.provider_result_id.is_empty() {
            return None;
        }
        Some(turn)
    }
}
