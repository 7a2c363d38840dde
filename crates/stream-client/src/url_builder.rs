use crate::Error;

pub fn is_local_host(host: &str) -> bool {
    host == "127.0.0.1" || host == "localhost" || host == "0.0.0.0" || host == "::1"
}

/// Derive the subscribe endpoint from the paired REST base URL.
///
/// `https://host/...` becomes `wss://host/api/transcriptions/subscribe/<id>`;
/// a plain-`http` base (local development) maps to `ws`.
pub fn subscribe_url(api_base: &str, session_id: &str) -> Result<url::Url, Error> {
    let parsed: url::Url = api_base.parse()?;

    let scheme = if parsed.scheme() == "https" { "wss" } else { "ws" };
    let mut url = parsed;
    let _ = url.set_scheme(scheme);
    url.set_query(None);
    url.set_path(&format!("/api/transcriptions/subscribe/{}", session_id));

    Ok(url)
}
