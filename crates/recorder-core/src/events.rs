use serde::Serialize;

use visit_transcript::Turn;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionLifecycleEvent {
    Active {
        session_id: String,
    },
    Retrying {
        session_id: String,
    },
    Finalizing {
        session_id: String,
    },
    Inactive {
        session_id: String,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionDataEvent {
    TurnsUpdated {
        session_id: String,
        turns: Vec<Turn>,
    },
    ProactiveSuggestions {
        session_id: String,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionErrorEvent {
    ConnectionError { session_id: String, error: String },
    AudioError { session_id: String, error: String },
}
