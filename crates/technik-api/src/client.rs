// TechnikTeam REST client
//
// Wraps `reqwest::Client` with base-URL path construction, bearer-token
// injection, and `{ success, data, message }` envelope unwrapping. Screens
// never build requests directly -- they compose fetch closures on top of
// the typed verb helpers here.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::ApiError;

/// Response envelope used by every TechnikTeam backend endpoint.
///
/// `data` is kept as raw JSON until the envelope outcome is known, so a
/// failure envelope never has to deserialize a payload it doesn't carry.
#[derive(serde::Deserialize)]
struct ApiEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the TechnikTeam backend.
///
/// Handles the `{ success, data, message }` envelope and bearer-token
/// auth. All verb helpers return the unwrapped `data` payload -- the
/// envelope is stripped before the caller sees it. The token lives in a
/// swappable cell so login/logout can rotate it without rebuilding the
/// client or invalidating fetch closures that hold an `Arc<ApiClient>`.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: ArcSwapOption<SecretString>,
}

impl ApiClient {
    /// Create a client for the given backend base URL.
    ///
    /// `base_url` is the server root (e.g. `https://team.example.org`);
    /// API paths are resolved beneath `/api/v1/`.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("technikteam-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            token: ArcSwapOption::empty(),
        }
    }

    /// The backend base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Token management ─────────────────────────────────────────────

    /// Install or clear the bearer token used on subsequent requests.
    pub fn set_token(&self, token: Option<SecretString>) {
        self.token.store(token.map(Arc::new));
    }

    /// The current bearer token, if one is installed.
    pub fn token(&self) -> Option<Arc<SecretString>> {
        self.token.load_full()
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Build a full URL for an API path: `{base}/api/v1/{path}`
    pub(crate) fn api_url(&self, path: &str) -> Url {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let full = format!("{base}/api/v1/{path}");
        Url::parse(&full).expect("invalid API URL")
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Send a GET request and unwrap the envelope.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.api_url(path);
        debug!("GET {}", url);

        let builder = self.apply_auth(self.http.get(url));
        let resp = builder.send().await.map_err(ApiError::Transport)?;

        self.parse_envelope(resp).await
    }

    /// Send a POST request with JSON body and unwrap the envelope.
    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &(impl Serialize + Sync),
    ) -> Result<T, ApiError> {
        let url = self.api_url(path);
        debug!("POST {}", url);

        let builder = self.apply_auth(self.http.post(url).json(body));
        let resp = builder.send().await.map_err(ApiError::Transport)?;

        self.parse_envelope(resp).await
    }

    /// Send a PUT request with JSON body and unwrap the envelope.
    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &(impl Serialize + Sync),
    ) -> Result<T, ApiError> {
        let url = self.api_url(path);
        debug!("PUT {}", url);

        let builder = self.apply_auth(self.http.put(url).json(body));
        let resp = builder.send().await.map_err(ApiError::Transport)?;

        self.parse_envelope(resp).await
    }

    /// Send a DELETE request and unwrap the envelope.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.api_url(path);
        debug!("DELETE {}", url);

        let builder = self.apply_auth(self.http.delete(url));
        let resp = builder.send().await.map_err(ApiError::Transport)?;

        self.parse_envelope(resp).await
    }

    /// Apply the stored bearer token to a request builder.
    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.load_full() {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    /// Parse the `{ success, data, message }` envelope, returning `data`
    /// on success or an [`ApiError`] otherwise.
    ///
    /// HTTP 401 and 403 map to [`ApiError::Authentication`] regardless
    /// of body shape -- the backend's auth filter short-circuits before
    /// the envelope is written.
    async fn parse_envelope<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ApiError::Authentication {
                message: format!("request rejected with HTTP {status}"),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // Prefer the envelope's message when the error body carries one.
            let message = serde_json::from_str::<ApiEnvelope>(&body)
                .ok()
                .and_then(|env| env.message)
                .unwrap_or_else(|| format!("HTTP {status}: {}", body_preview(&body)));
            return Err(ApiError::Api {
                message,
                status: Some(status.as_u16()),
            });
        }

        let body = resp.text().await.map_err(ApiError::Transport)?;

        let envelope: ApiEnvelope = serde_json::from_str(&body).map_err(|e| {
            let preview = body_preview(&body);
            ApiError::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body: body.clone(),
            }
        })?;

        if !envelope.success {
            return Err(ApiError::Api {
                message: envelope
                    .message
                    .unwrap_or_else(|| "request failed".into()),
                status: Some(status.as_u16()),
            });
        }

        // Endpoints without a payload return `data: null`; deserializing
        // Null into `()` or `Option<T>` keeps one code path for both.
        let data = envelope.data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(|e| ApiError::Deserialization {
            message: e.to_string(),
            body,
        })
    }
}

/// Bounded body excerpt for error messages. Counts characters, not
/// bytes -- a byte slice could land inside a multibyte sequence.
fn body_preview(body: &str) -> String {
    body.chars().take(200).collect()
}
