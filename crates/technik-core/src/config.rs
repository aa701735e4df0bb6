// ── Runtime connection configuration ──
//
// These types describe *how* to reach a TechnikTeam backend. They carry
// credential data and connection tuning, but never touch disk -- the
// technik-config crate (or the embedding app) constructs a
// `ClientConfig` and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::CoreError;

/// Configuration for connecting to a single TechnikTeam backend.
///
/// On web-style deployments `base_url` is the page origin; native
/// clients point it at the configured absolute host. The realtime
/// endpoint is always derived from it by scheme swap, so the two
/// transports never disagree about the host.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL (e.g., `https://team.example.org`).
    pub base_url: Url,
    /// Bearer token, when a session already exists. Rotatable later via
    /// the session facade.
    pub token: Option<SecretString>,
    /// Request timeout for REST calls.
    pub timeout: Duration,
    /// Fixed delay between realtime reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".parse().expect("static URL"),
            token: None,
            timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Resolve a realtime endpoint from a relative path (e.g.
    /// `/ws/chat/7`): joins against the base URL and swaps the scheme
    /// `http` → `ws` / `https` → `wss`.
    ///
    /// The auth token is NOT part of the result -- the channel appends
    /// it as a query parameter at connect time, so a rotated token is
    /// picked up on reconnect.
    pub fn ws_url(&self, path: &str) -> Result<Url, CoreError> {
        let mut url = self.base_url.join(path).map_err(|e| CoreError::Config {
            message: format!("invalid realtime path {path:?}: {e}"),
        })?;

        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => return Ok(url),
            other => {
                return Err(CoreError::Config {
                    message: format!("cannot derive realtime URL from scheme {other:?}"),
                });
            }
        };

        url.set_scheme(scheme).map_err(|()| CoreError::Config {
            message: format!("cannot derive realtime URL from {}", self.base_url),
        })?;
        Ok(url)
    }
}
