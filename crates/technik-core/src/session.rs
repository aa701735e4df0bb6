// ── Session facade ──
//
// Wires the shared pieces together: one ApiClient, one RefetchRegistry,
// one ClientConfig. Screens go through a Session to build fetchers, open
// realtime channels, and invalidate entity tags after mutations.

use std::future::Future;
use std::sync::Arc;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use technik_api::{ApiClient, ApiError, Envelope, RealtimeConfig, RealtimeHandle};

use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::fetch::Fetcher;
use crate::store::RefetchRegistry;

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc` -- every screen holds a clone and shares
/// the HTTP client, the refetch registry, and the session-wide teardown
/// token. Channels opened through the session get child tokens, so one
/// `shutdown()` closes everything the session spawned.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ClientConfig,
    client: Arc<ApiClient>,
    registry: Arc<RefetchRegistry>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session from runtime configuration.
    ///
    /// Installs the configured token (if any) into the client's token
    /// cell. Does not perform any network I/O.
    pub fn new(config: ClientConfig) -> Result<Self, CoreError> {
        let client = ApiClient::new(config.base_url.clone(), config.timeout)?;
        client.set_token(config.token.clone());

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                client: Arc::new(client),
                registry: Arc::new(RefetchRegistry::new()),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Create a session around a pre-built client and registry.
    ///
    /// Tests wire a fresh registry per case this way; production goes
    /// through [`new`](Self::new).
    pub fn with_parts(
        config: ClientConfig,
        client: Arc<ApiClient>,
        registry: Arc<RefetchRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                client,
                registry,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The shared HTTP client.
    pub fn client(&self) -> &Arc<ApiClient> {
        &self.inner.client
    }

    /// The shared refetch registry.
    pub fn registry(&self) -> &Arc<RefetchRegistry> {
        &self.inner.registry
    }

    // ── Token management ─────────────────────────────────────────────

    /// Rotate or clear the bearer token.
    ///
    /// Takes effect on the next REST request and the next realtime
    /// connect attempt -- live channels pick it up on reconnect.
    pub fn set_token(&self, token: Option<SecretString>) {
        self.inner.client.set_token(token);
    }

    // ── Fetchers ─────────────────────────────────────────────────────

    /// Build a fetcher around the given operation and start it.
    pub fn fetcher<T, F, Fut>(&self, fetch: F) -> Fetcher<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        Fetcher::new(fetch)
    }

    /// Build a fetcher that additionally refetches when any of `tags`
    /// is invalidated through this session's registry.
    pub fn fetcher_watching<T, F, Fut, I, S>(&self, tags: I, fetch: F) -> Fetcher<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fetcher = Fetcher::new(fetch);
        fetcher.watch_tags(&self.inner.registry, tags);
        fetcher
    }

    /// Record that entities of the given tag changed.
    ///
    /// Mutation call sites invoke this after a successful write; every
    /// fetcher watching the tag refetches.
    pub fn invalidate(&self, tag: &str) {
        self.inner.registry.bump(tag);
    }

    // ── Realtime channels ────────────────────────────────────────────

    /// Open a realtime channel for a relative endpoint path (e.g.
    /// `/ws/chat/7`) with the given inbound message handler.
    ///
    /// The endpoint is resolved against the configured base URL; the
    /// session token is read from the client's cell at every connect
    /// attempt, so login/logout rotation carries over to reconnects.
    /// The channel's lifetime is bounded by the session: `shutdown()`
    /// closes it along with everything else.
    pub fn open_channel(
        &self,
        path: &str,
        handler: impl Fn(Envelope) + Send + Sync + 'static,
    ) -> Result<RealtimeHandle, CoreError> {
        let endpoint = self.inner.config.ws_url(path)?;

        let client = Arc::clone(&self.inner.client);
        let token_provider = Arc::new(move || client.token().map(|token| (*token).clone()));

        let handle = RealtimeHandle::open(
            endpoint,
            RealtimeConfig {
                reconnect_delay: self.inner.config.reconnect_delay,
            },
            self.inner.cancel.child_token(),
            token_provider,
        );
        handle.set_handler(handler);
        Ok(handle)
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Shut the session down: closes every channel opened through it
    /// and stops pending reconnects. Safe to call multiple times;
    /// clones of the session share the same token.
    pub fn shutdown(&self) {
        debug!("session shutdown");
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(ClientConfig {
            base_url: "https://team.example.org".parse().unwrap(),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn invalidate_bumps_the_shared_registry() {
        let session = session();
        assert!(session.registry().stamp("KIT").is_none());

        session.invalidate("kit");
        assert!(session.registry().stamp("KIT").is_some());
    }

    #[tokio::test]
    async fn clones_share_client_and_registry() {
        let session = session();
        let clone = session.clone();

        clone.invalidate("USER");
        assert!(session.registry().stamp("USER").is_some());

        session.set_token(Some(SecretString::from("tok".to_string())));
        assert!(clone.client().token().is_some());
    }

    #[tokio::test]
    async fn with_parts_wires_an_injected_registry() {
        let registry = Arc::new(RefetchRegistry::new());
        let client = Arc::new(
            ApiClient::new(
                "https://team.example.org".parse().unwrap(),
                std::time::Duration::from_secs(5),
            )
            .unwrap(),
        );

        let session =
            Session::with_parts(ClientConfig::default(), client, Arc::clone(&registry));

        session.invalidate("USER");
        assert!(registry.stamp("USER").is_some());
    }

    #[tokio::test]
    async fn configured_token_lands_in_the_client_cell() {
        let session = Session::new(ClientConfig {
            base_url: "https://team.example.org".parse().unwrap(),
            token: Some(SecretString::from("configured".to_string())),
            ..ClientConfig::default()
        })
        .unwrap();

        assert!(session.client().token().is_some());
    }

    #[tokio::test]
    async fn open_channel_requires_a_ws_capable_base() {
        let session = Session::new(ClientConfig {
            base_url: "ftp://team.example.org".parse().unwrap(),
            ..ClientConfig::default()
        })
        .unwrap();

        let result = session.open_channel("/ws/chat/1", |_| {});
        assert!(matches!(result, Err(CoreError::Config { .. })));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_shared_across_clones() {
        let session = session();
        session.set_token(Some(SecretString::from("tok".to_string())));
        let handle = session.open_channel("/ws/chat/1", |_| {}).unwrap();

        session.clone().shutdown();
        session.shutdown();

        // The channel's child token is cancelled with the session.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let mut state = handle.state_changes();
            loop {
                if *state.borrow_and_update() == technik_api::ChannelState::Closed {
                    return;
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .unwrap();
    }
}
