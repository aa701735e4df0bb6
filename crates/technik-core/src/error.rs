// ── Core error types ──
//
// Consumer-facing errors from technik-core. These are NOT API-specific --
// consumers never see HTTP status codes or JSON parse failures directly.
// The `From<ApiError>` impl translates transport-layer errors into
// domain-appropriate variants.

use thiserror::Error;

use technik_api::ApiError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("API error: {message}")]
    Api { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<ApiError> for CoreError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Authentication { message } => Self::AuthenticationFailed { message },
            ApiError::Transport(e) => {
                if e.is_connect() || e.is_timeout() {
                    Self::ConnectionFailed {
                        reason: e.to_string(),
                    }
                } else {
                    Self::Api {
                        message: e.to_string(),
                    }
                }
            }
            ApiError::InvalidUrl(e) => Self::Config {
                message: format!("Invalid URL: {e}"),
            },
            ApiError::Api { message, .. } => Self::Api { message },
            ApiError::Deserialization { message, body: _ } => {
                Self::Internal(format!("Deserialization error: {message}"))
            }
            ApiError::ChannelConnect(reason) => Self::ConnectionFailed { reason },
        }
    }
}
