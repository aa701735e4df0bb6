//! Realtime duplex channel with auto-reconnect.
//!
//! Maintains a single logical WebSocket connection to a TechnikTeam
//! realtime endpoint (chat, collaborative editing), handling token
//! authentication, JSON message framing, and reconnection with a fixed
//! delay. Callers send/receive [`Envelope`] messages without touching
//! socket lifecycle.
//!
//! # Example
//!
//! ```rust,ignore
//! use technik_api::realtime::{RealtimeHandle, RealtimeConfig};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let cancel = CancellationToken::new();
//! let endpoint = Url::parse("wss://team.example.org/ws/chat/7")?;
//! let provider = std::sync::Arc::new(|| Some("bearer-token".to_string().into()));
//!
//! let handle = RealtimeHandle::open(endpoint, RealtimeConfig::default(), cancel, provider);
//! handle.set_handler(|envelope| println!("{}: {}", envelope.kind, envelope.payload));
//!
//! handle.shutdown();
//! ```

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Supplies the current bearer token at every connect attempt.
///
/// Returning `None` means "not ready": the channel closes without
/// scheduling a reconnect, because a missing token is an auth-layer
/// condition, not a network failure.
pub type TokenProvider = Arc<dyn Fn() -> Option<SecretString> + Send + Sync>;

/// Caller-supplied message handler, stored boxed so the swappable cell
/// has a sized payload.
type Handler = Box<dyn Fn(Envelope) + Send + Sync>;

// ── Envelope ─────────────────────────────────────────────────────────

/// Wire envelope for every realtime message, inbound and outbound.
///
/// `kind` and `payload` are opaque to the channel -- interpretation is
/// the caller's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message discriminator, e.g. `"CHAT_MESSAGE"`, `"TYPING"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Message body. Defaults to `null` when absent.
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ── ChannelState ─────────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

// ── RealtimeConfig ───────────────────────────────────────────────────

/// Reconnection tuning for the realtime channel.
///
/// The delay is fixed: every reconnect waits the same interval, with no
/// backoff curve and no attempt cap. Kept configurable so tests and
/// operators can tune it.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Delay between a lost connection and the reconnect attempt.
    /// Default: 5s.
    pub reconnect_delay: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

// ── RealtimeHandle ───────────────────────────────────────────────────

/// Handle to a running realtime channel.
///
/// Owns exactly one logical connection: a reconnect fully tears down the
/// previous socket before a new one is opened. Dropping the handle shuts
/// the channel down.
pub struct RealtimeHandle {
    outbound_tx: mpsc::UnboundedSender<String>,
    state_rx: watch::Receiver<ChannelState>,
    handler: Arc<ArcSwapOption<Handler>>,
    cancel: CancellationToken,
}

impl RealtimeHandle {
    /// Spawn the channel task for `endpoint` (a ready `ws://`/`wss://`
    /// URL without credentials).
    ///
    /// Returns immediately; the first connection attempt happens
    /// asynchronously. The token from `token_provider` is appended to
    /// the endpoint as a `token` query parameter on every attempt.
    pub fn open(
        endpoint: Url,
        config: RealtimeConfig,
        cancel: CancellationToken,
        token_provider: TokenProvider,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let handler: Arc<ArcSwapOption<Handler>> = Arc::new(ArcSwapOption::empty());

        let task_handler = Arc::clone(&handler);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            channel_loop(
                endpoint,
                token_provider,
                task_handler,
                outbound_rx,
                state_tx,
                config,
                task_cancel,
            )
            .await;
        });

        Self {
            outbound_tx,
            state_rx,
            handler,
            cancel,
        }
    }

    /// Install the inbound message handler, replacing any previous one.
    ///
    /// Frames are always dispatched to the most recently installed
    /// handler, even if it changes while the channel is open.
    pub fn set_handler(&self, handler: impl Fn(Envelope) + Send + Sync + 'static) {
        self.handler.store(Some(Arc::new(Box::new(handler))));
    }

    /// Serialize and transmit a message, but only while the channel is
    /// open. Otherwise the message is dropped with a diagnostic -- it is
    /// never queued and never an error.
    pub fn send(&self, envelope: &Envelope) {
        if *self.state_rx.borrow() != ChannelState::Open {
            warn!(kind = %envelope.kind, "dropping message sent while channel is not open");
            return;
        }
        match serde_json::to_string(envelope) {
            Ok(json) => {
                if self.outbound_tx.send(json).is_err() {
                    warn!(kind = %envelope.kind, "dropping message, channel task has exited");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize outbound message"),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Shut the channel down: cancels a pending reconnect and closes the
    /// live connection. Safe to call multiple times.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Why a connection attempt or session ended.
enum Disconnect {
    /// Self-initiated teardown. Never reconnects.
    Shutdown,
    /// The server rejected our credentials. Terminal -- the auth layer
    /// owns the recovery, reconnecting would just loop the rejection.
    AuthRejected(String),
    /// Anything else: network failure, server restart, generic close.
    Lost(String),
}

/// Main loop: resolve token → connect → run → on loss, wait the fixed
/// delay → reconnect.
async fn channel_loop(
    endpoint: Url,
    token_provider: TokenProvider,
    handler: Arc<ArcSwapOption<Handler>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    state_tx: watch::Sender<ChannelState>,
    config: RealtimeConfig,
    cancel: CancellationToken,
) {
    loop {
        let Some(token) = token_provider() else {
            debug!("no auth token available, channel closed");
            let _ = state_tx.send(ChannelState::Closed);
            return;
        };

        let _ = state_tx.send(ChannelState::Connecting);
        let url = authenticated_url(&endpoint, &token);

        let disconnect = tokio::select! {
            biased;
            _ = cancel.cancelled() => Disconnect::Shutdown,
            d = connect_and_run(&url, &handler, &mut outbound_rx, &state_tx, &cancel) => d,
        };

        let _ = state_tx.send(ChannelState::Closed);

        match disconnect {
            Disconnect::Shutdown => {
                debug!("channel shut down");
                return;
            }
            Disconnect::AuthRejected(reason) => {
                warn!(%reason, "channel rejected by server auth, not reconnecting");
                return;
            }
            Disconnect::Lost(reason) => {
                info!(
                    %reason,
                    delay_ms = config.reconnect_delay.as_millis() as u64,
                    "channel lost, waiting before reconnect"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                }
            }
        }
    }
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one connection and run its read/write loop until it ends.
async fn connect_and_run(
    url: &Url,
    handler: &ArcSwapOption<Handler>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    state_tx: &watch::Sender<ChannelState>,
    cancel: &CancellationToken,
) -> Disconnect {
    debug!(endpoint = %url.path(), "connecting realtime channel");

    let (ws_stream, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok(ok) => ok,
        Err(tungstenite::Error::Http(resp))
            if resp.status() == tungstenite::http::StatusCode::UNAUTHORIZED
                || resp.status() == tungstenite::http::StatusCode::FORBIDDEN =>
        {
            return Disconnect::AuthRejected(format!(
                "handshake rejected: HTTP {}",
                resp.status()
            ));
        }
        Err(e) => return Disconnect::Lost(format!("connect failed: {e}")),
    };

    info!("realtime channel open");
    let _ = state_tx.send(ChannelState::Open);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                return Disconnect::Shutdown;
            }
            outbound = outbound_rx.recv() => {
                let Some(json) = outbound else {
                    return Disconnect::Shutdown;
                };
                if let Err(e) = write.send(tungstenite::Message::Text(json.into())).await {
                    return Disconnect::Lost(format!("send failed: {e}"));
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        dispatch_frame(&text, handler);
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite answers pongs automatically
                        trace!("channel ping");
                    }
                    Some(Ok(tungstenite::Message::Close(close))) => {
                        let (code, reason) = close
                            .map_or((1005, String::new()), |cf| {
                                (u16::from(cf.code), cf.reason.to_string())
                            });
                        if is_auth_close(code) {
                            return Disconnect::AuthRejected(
                                format!("close code {code}: {reason}"),
                            );
                        }
                        return Disconnect::Lost(format!("close code {code}: {reason}"));
                    }
                    Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                    None => return Disconnect::Lost("stream ended".into()),
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }
}

// ── Frame dispatch ───────────────────────────────────────────────────

/// Parse a text frame and hand it to the current handler.
///
/// Malformed frames are logged and dropped -- they never tear down the
/// channel or reach the handler.
fn dispatch_frame(text: &str, handler: &ArcSwapOption<Handler>) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            debug!(error = %e, "dropping malformed channel frame");
            return;
        }
    };

    // load_full rather than a captured clone: the cell may have been
    // swapped since the connection opened.
    if let Some(handler) = handler.load_full() {
        handler(envelope);
    } else {
        trace!(kind = %envelope.kind, "frame received before a handler was installed");
    }
}

// ── URL composition ──────────────────────────────────────────────────

/// Append the bearer token as a URL-encoded `token` query parameter.
fn authenticated_url(endpoint: &Url, token: &SecretString) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("token", token.expose_secret());
    url
}

/// Close codes the backend uses for authentication/authorization
/// rejection. These are terminal: reconnecting would loop the rejection.
fn is_auth_close(code: u16) -> bool {
    matches!(code, 4401 | 4403)
}

// ── Tests ────────────────────────────────────────────────────────────
