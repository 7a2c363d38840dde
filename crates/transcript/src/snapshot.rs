use chrono::Utc;
use visit_wire::{WireTurn, WireWord};

use crate::types::{Speaker, Turn, WordTimestamp};

/// Convert a `cached_turns` snapshot into displayable [`Turn`]s.
///
/// Elements failing validation are dropped and logged. The validated set is
/// sorted by `turn_index` ascending, which is sound here only because a
/// snapshot is always scoped to a single transcription sub-session.
pub fn turns_from_snapshot(elements: &[serde_json::Value]) -> Vec<Turn> {
    let mut wire: Vec<WireTurn> = Vec::with_capacity(elements.len());

    for element in elements {
        match WireTurn::from_value(element) {
            Some(turn) => wire.push(turn),
            None => {
                tracing::warn!(?element, "dropped_invalid_cached_turn");
            }
        }
    }

    wire.sort_by_key(|t| t.turn_index);
    wire.into_iter().map(turn_from_wire).collect()
}

fn turn_from_wire(wire: WireTurn) -> Turn {
    let speaker = wire
        .speaker
        .as_deref()
        .and_then(|s| s.parse::<Speaker>().ok())
        .unwrap_or(Speaker::Technician);

    Turn {
        turn_id: wire.turn_id,
        result_id: wire.provider_result_id,
        speaker,
        text: wire.text,
        turn_index: wire.turn_index,
        timestamp: wire.timestamp.unwrap_or_else(Utc::now),
        word_timestamps: wire
            .words
            .unwrap_or_default()
            .into_iter()
            .map(word_from_wire)
            .collect(),
        is_partial: wire.is_partial.unwrap_or(false),
    }
}

fn word_from_wire(word: WireWord) -> WordTimestamp {
    WordTimestamp {
        word: word.word,
        start_ms: word.start_ms,
        end_ms: word.end_ms,
    }
}
