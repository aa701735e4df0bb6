use thiserror::Error;

/// Top-level error type for the `technik-api` crate.
///
/// Covers every failure mode across both transport surfaces: the REST
/// API and the realtime channel. `technik-core` maps these into
/// consumer-facing diagnostics.
#[derive(Debug, Error)]
pub enum ApiError {
    // ── Authentication ──────────────────────────────────────────────
    /// The backend rejected the request's credentials (HTTP 401/403).
    ///
    /// Consumers treat this as a signal for the auth layer, not as a
    /// displayable error -- see [`is_auth_error`](Self::is_auth_error).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── REST API ────────────────────────────────────────────────────
    /// The backend reported a failure, either as a non-2xx status or as
    /// a `success: false` envelope with a server-supplied message.
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status, when the failure carried one.
        status: Option<u16>,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Realtime channel ────────────────────────────────────────────
    /// The realtime channel handshake failed.
    #[error("Channel connection failed: {0}")]
    ChannelConnect(String),
}

impl ApiError {
    /// Returns `true` if this error means the caller's credentials were
    /// rejected. Fetch-state machinery suppresses these from error state
    /// entirely -- the auth layer owns the recovery (logout/redirect).
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::ChannelConnect(_) => true,
            _ => false,
        }
    }
}
