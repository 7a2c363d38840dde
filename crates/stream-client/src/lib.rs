mod registry;
mod session;
mod url_builder;

pub use registry::{ConnectionGuard, ConnectionRegistry};
pub use session::{
    AUDIO_ARM_TIMEOUT, ConnectDecision, END_GRACE, HEARTBEAT_STALE, IDLE_TIMEOUT, RETRY_DELAY,
    SessionCallbacks, SessionHandle, SessionOptions, SessionState, connect_precondition,
    spawn_session,
};
pub use url_builder::{is_local_host, subscribe_url};

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid api_base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid request uri: {0}")]
    InvalidUri(#[from] tungstenite::http::uri::InvalidUri),
    #[error(transparent)]
    Ws(#[from] tungstenite::Error),
}

pub type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Builder for the duplex subscribe connection, one per `visit_session_id`.
pub struct SubscribeClientBuilder {
    api_base: Option<String>,
    api_key: Option<String>,
    session_id: Option<String>,
    company_id: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl Default for SubscribeClientBuilder {
    fn default() -> Self {
        Self {
            api_base: None,
            api_key: None,
            session_id: None,
            company_id: None,
            extra_headers: Vec::new(),
        }
    }
}

impl SubscribeClientBuilder {
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn company_id(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> Result<SubscribeClient, Error> {
        let api_base = self.api_base.unwrap_or_default();
        let session_id = self.session_id.unwrap_or_default();

        let mut url = subscribe_url(&api_base, &session_id)?;
        if let Some(company_id) = &self.company_id {
            url.query_pairs_mut().append_pair("company_id", company_id);
        }

        let uri: tungstenite::http::Uri = url.as_str().parse()?;
        let mut request = tungstenite::ClientRequestBuilder::new(uri);

        if let Some(api_key) = &self.api_key {
            request = request.with_header("Authorization", format!("Bearer {}", api_key));
        }
        for (name, value) in self.extra_headers {
            request = request.with_header(name, value);
        }

        Ok(SubscribeClient {
            request,
            session_id,
        })
    }
}

#[derive(Clone)]
pub struct SubscribeClient {
    request: tungstenite::ClientRequestBuilder,
    session_id: String,
}

impl SubscribeClient {
    pub fn builder() -> SubscribeClientBuilder {
        SubscribeClientBuilder::default()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn connect(&self) -> Result<WsStream, Error> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.request.clone()).await?;
        Ok(stream)
    }
}
