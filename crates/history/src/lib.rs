//! REST fetch of persisted transcription history.
//!
//! The socket only streams what happens while it is open; reopening a recent
//! session starts from this endpoint's snapshot instead of an empty list.

use serde::Deserialize;
use url::Url;

use visit_transcript::{Turn, turns_from_snapshot};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    #[error("history api returned {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct ListTurnsResponse {
    #[serde(default)]
    turns: Vec<serde_json::Value>,
}

#[derive(Default)]
pub struct HistoryClientBuilder {
    api_base: Option<String>,
    api_key: Option<String>,
}

impl HistoryClientBuilder {
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn build(self) -> Result<HistoryClient, Error> {
        let api_base = Url::parse(&self.api_base.unwrap_or_default())?;

        Ok(HistoryClient {
            client: reqwest::Client::new(),
            api_base,
            api_key: self.api_key,
        })
    }
}

#[derive(Clone)]
pub struct HistoryClient {
    client: reqwest::Client,
    api_base: Url,
    api_key: Option<String>,
}

impl HistoryClient {
    pub fn builder() -> HistoryClientBuilder {
        HistoryClientBuilder::default()
    }

    /// Fetches the persisted turn list for `session_id`, validated and
    /// ordered by `turn_index`. Invalid elements are dropped, not fatal.
    pub async fn list_turns(&self, session_id: &str) -> Result<Vec<Turn>, Error> {
        let mut url = self.api_base.clone();
        url.set_path(&format!("/api/transcriptions/{session_id}/turns"));

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(%session_id, status = status.as_u16(), "history_fetch_failed");
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ListTurnsResponse = response.json().await?;
        Ok(turns_from_snapshot(&body.turns))
    }
}
