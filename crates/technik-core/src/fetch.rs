//! Per-resource fetch state machine.
//!
//! A [`Fetcher`] wraps one injected async fetch operation with
//! loading/error/data state published through a watch channel. Screens
//! compose a fetch closure over [`technik_api::ApiClient`], hand it to a
//! fetcher, and render whatever [`FetchState`] the watch side reports.
//! Optional entity-tag watching refetches automatically when a mutation
//! site bumps the [`RefetchRegistry`].
//!
//! # Example
//!
//! ```rust,ignore
//! let fetcher = Fetcher::new(move || {
//!     let client = Arc::clone(&client);
//!     async move { client.get::<Vec<Kit>>("kits").await }
//! });
//! fetcher.watch_tags(&registry, ["KIT"]);
//!
//! let state = fetcher.state();
//! if let Some(kits) = state.data { /* render */ }
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use futures_core::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use technik_api::ApiError;

use crate::error::CoreError;
use crate::store::{RefetchRegistry, Subscription};
use crate::stream::FetchStream;

/// Boxed fetch operation, stored behind a swappable cell so every
/// attempt invokes the most recently supplied closure.
type FetchFn<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

// ── FetchState ───────────────────────────────────────────────────────

/// Snapshot of one fetcher's state, as rendered by a screen.
#[derive(Debug)]
pub struct FetchState<T> {
    /// Last successfully fetched payload. `None` until the first success;
    /// a later failed attempt keeps the previous payload around so the
    /// screen can show stale data next to the error.
    pub data: Option<Arc<T>>,

    /// True while an attempt is in flight.
    pub loading: bool,

    /// Display message of the last failed attempt. Cleared when a new
    /// attempt starts. Auth failures never set this -- the auth layer
    /// owns that recovery.
    pub error: Option<String>,
}

// Not derived: the payload sits behind an Arc, so a snapshot clones
// cheaply even when T itself is not Clone.
impl<T> Clone for FetchState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            loading: self.loading,
            error: self.error.clone(),
        }
    }
}

impl<T> FetchState<T> {
    fn idle() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
        }
    }

    fn loading() -> Self {
        Self {
            data: None,
            loading: true,
            error: None,
        }
    }

    /// The canonical "render the error" condition: the attempt settled,
    /// nothing was ever fetched, and a message is available.
    pub fn show_error(&self) -> bool {
        !self.loading && self.data.is_none() && self.error.is_some()
    }
}

// ── Fetcher ──────────────────────────────────────────────────────────

/// State machine around one async fetch operation.
///
/// Owns its request state exclusively; the only cross-instance coupling
/// is the optional [`RefetchRegistry`] subscription. Concurrent
/// [`reload`](Self::reload) calls are not deduplicated -- each spawns a
/// fresh attempt and the last one to settle wins. Dropping the fetcher
/// cancels the internals; an attempt that settles afterwards does not
/// write state.
pub struct Fetcher<T: Send + Sync + 'static> {
    inner: Arc<FetcherInner<T>>,
}

struct FetcherInner<T: Send + Sync + 'static> {
    fetch: ArcSwapOption<FetchFn<T>>,
    state_tx: watch::Sender<FetchState<T>>,
    invalidate_tx: mpsc::UnboundedSender<()>,
    subscription: Mutex<Option<Subscription>>,
    cancel: CancellationToken,
}

impl<T: Send + Sync + 'static> Fetcher<T> {
    /// Create a fetcher and start its first attempt immediately.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let fetcher = Self::build(FetchState::loading());
        fetcher.inner.fetch.store(Some(Arc::new(box_fetch(fetch))));
        spawn_attempt(&fetcher.inner);
        fetcher
    }

    /// Create a fetcher with no operation yet: `loading` is false and
    /// nothing runs until [`set_fetch`](Self::set_fetch) supplies one.
    pub fn idle() -> Self {
        Self::build(FetchState::idle())
    }

    fn build(initial: FetchState<T>) -> Self {
        let (state_tx, _) = watch::channel(initial);
        let (invalidate_tx, invalidate_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(FetcherInner {
            fetch: ArcSwapOption::empty(),
            state_tx,
            invalidate_tx,
            subscription: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(invalidation_pump(Arc::clone(&inner), invalidate_rx));

        Self { inner }
    }

    /// Install or replace the fetch operation and start an attempt.
    ///
    /// Every attempt -- including tag-triggered refetches -- reads the
    /// cell at spawn time, so in-flight subscriptions always invoke the
    /// closure installed most recently.
    pub fn set_fetch<F, Fut>(&self, fetch: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        self.inner.fetch.store(Some(Arc::new(box_fetch(fetch))));
        spawn_attempt(&self.inner);
    }

    /// Start a fresh attempt regardless of current state.
    ///
    /// Attempts are not deduplicated: two quick reloads run two fetches
    /// and whichever settles last determines the final state.
    pub fn reload(&self) {
        spawn_attempt(&self.inner);
    }

    /// Refetch whenever one of `tags` is bumped in the registry.
    ///
    /// Replaces any previous tag watch. The listener lives exactly as
    /// long as the fetcher -- the subscription guard is dropped on
    /// teardown, so no listener leaks past it.
    pub fn watch_tags<I, S>(&self, registry: &RefetchRegistry, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(|t| t.into().to_uppercase()).collect();
        if tags.is_empty() {
            *self.inner.subscription.lock().expect("subscription lock poisoned") = None;
            return;
        }

        let wake = self.inner.invalidate_tx.clone();
        let subscription = registry.subscribe(move |current, previous| {
            let changed = tags.iter().any(|tag| current.get(tag) != previous.get(tag));
            if changed {
                let _ = wake.send(());
            }
        });

        *self
            .inner
            .subscription
            .lock()
            .expect("subscription lock poisoned") = Some(subscription);
    }

    /// Current state snapshot.
    pub fn state(&self) -> FetchState<T> {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe as a [`FetchStream`] for `StreamExt`-style consumers.
    pub fn stream(&self) -> FetchStream<T> {
        FetchStream::new(self.inner.state_tx.subscribe())
    }
}

impl<T: Send + Sync + 'static> Drop for Fetcher<T> {
    fn drop(&mut self) {
        // Stops the pump and bars in-flight attempts from writing state.
        self.inner.cancel.cancel();
        // Release the registry listener now -- background tasks may keep
        // the inner alive a moment longer, and a bump in that window must
        // not reach a dead fetcher.
        if let Ok(mut subscription) = self.inner.subscription.lock() {
            subscription.take();
        }
    }
}

/// Box a generic fetch closure into the stored cell shape.
fn box_fetch<T, F, Fut>(fetch: F) -> FetchFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
    Box::new(move || {
        let fut: BoxFuture<'static, Result<T, ApiError>> = Box::pin(fetch());
        fut
    })
}

// ── Attempt lifecycle ────────────────────────────────────────────────

/// Spawn one fetch attempt against the latest installed operation.
fn spawn_attempt<T: Send + Sync + 'static>(inner: &Arc<FetcherInner<T>>) {
    let Some(fetch) = inner.fetch.load_full() else {
        debug!("reload requested on an idle fetcher, nothing to run");
        return;
    };
    if inner.cancel.is_cancelled() {
        return;
    }

    inner.state_tx.send_modify(|state| {
        state.loading = true;
        state.error = None;
    });

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let result = fetch().await;

        // The owning screen is gone; its state must not change anymore.
        if inner.cancel.is_cancelled() {
            return;
        }

        match result {
            Ok(data) => inner.state_tx.send_modify(|state| {
                state.data = Some(Arc::new(data));
                state.loading = false;
                state.error = None;
            }),
            Err(e) if e.is_auth_error() => {
                // Silent abort: the auth layer redirects/logs out, the
                // screen never renders this as a fetch error.
                debug!(error = %e, "fetch hit an auth failure, suppressing error state");
                inner.state_tx.send_modify(|state| state.loading = false);
            }
            Err(e) => {
                let message = CoreError::from(e).to_string();
                warn!(%message, "fetch attempt failed");
                inner.state_tx.send_modify(|state| {
                    state.loading = false;
                    state.error = Some(message);
                });
            }
        }
    });
}

/// Receive invalidation wakeups from the registry listener and turn each
/// into a reload. Registry listeners are synchronous and may run outside
/// the runtime, so the bridge from bump to spawn happens here.
async fn invalidation_pump<T: Send + Sync + 'static>(
    inner: Arc<FetcherInner<T>>,
    mut invalidate_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            wake = invalidate_rx.recv() => {
                if wake.is_none() {
                    break;
                }
                debug!("watched entity tag bumped, refetching");
                spawn_attempt(&inner);
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Wait until the watch side reports a settled state.
    async fn settled<T: Send + Sync + 'static>(
        rx: &mut watch::Receiver<FetchState<T>>,
    ) -> FetchState<T> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let state = rx.borrow_and_update().clone();
                if !state.loading {
                    return state;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("fetcher never settled")
    }

    #[tokio::test]
    async fn success_settles_with_data() {
        let fetcher = Fetcher::new(|| async { Ok("payload".to_string()) });
        assert!(fetcher.state().loading, "initial state is loading");

        let mut rx = fetcher.subscribe();
        let state = settled(&mut rx).await;

        assert_eq!(state.data.as_deref(), Some(&"payload".to_string()));
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn server_failure_surfaces_the_message() {
        let fetcher = Fetcher::<String>::new(|| async {
            Err(ApiError::Api {
                message: "boom".into(),
                status: Some(500),
            })
        });

        let mut rx = fetcher.subscribe();
        let state = settled(&mut rx).await;

        assert!(state.data.is_none());
        assert!(state.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn auth_failure_is_a_silent_abort() {
        let fetcher = Fetcher::<String>::new(|| async {
            Err(ApiError::Authentication {
                message: "session expired".into(),
            })
        });

        let mut rx = fetcher.subscribe();
        let state = settled(&mut rx).await;

        assert!(state.data.is_none());
        assert!(state.error.is_none(), "auth failures never set error state");
    }

    #[tokio::test]
    async fn starting_an_attempt_clears_the_previous_error() {
        let flaky = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&flaky);
        let fetcher = Fetcher::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApiError::Api {
                        message: "first attempt failed".into(),
                        status: None,
                    })
                } else {
                    Ok(n)
                }
            }
        });

        let mut rx = fetcher.subscribe();
        let state = settled(&mut rx).await;
        assert!(state.show_error());

        fetcher.reload();
        let state = settled(&mut rx).await;
        assert!(state.error.is_none());
        assert_eq!(state.data.as_deref(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_reloads_resolve_to_the_last_settled() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let fetcher = Fetcher::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                // First attempt is slow, second is fast: the slow one
                // settles last and owns the final state.
                if n == 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                } else {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(n)
            }
        });
        fetcher.reload();

        let mut rx = fetcher.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let state = rx.borrow_and_update().clone();
                if state.data.as_deref() == Some(&0) && !state.loading {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("slow attempt never overwrote the fast one");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bumping_a_watched_tag_refetches_once() {
        let registry = RefetchRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let fetcher = Fetcher::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        fetcher.watch_tags(&registry, ["user"]);

        let mut rx = fetcher.subscribe();
        settled(&mut rx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.bump("USER");
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bump never triggered a refetch");

        // One bump, exactly one extra fetch.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unwatched_tags_do_not_refetch() {
        let registry = RefetchRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let fetcher = Fetcher::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        fetcher.watch_tags(&registry, ["USER"]);

        let mut rx = fetcher.subscribe();
        settled(&mut rx).await;

        registry.bump("EVENT");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refetch_invokes_the_latest_fetch_fn() {
        let registry = RefetchRegistry::new();

        let fetcher = Fetcher::new(|| async { Ok("old") });
        fetcher.watch_tags(&registry, ["KIT"]);

        let mut rx = fetcher.subscribe();
        settled(&mut rx).await;

        fetcher.set_fetch(|| async { Ok("new") });
        settled(&mut rx).await;

        registry.bump("KIT");
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().data.as_deref() == Some(&"new") {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("refetch used a stale fetch fn");
    }

    #[tokio::test]
    async fn dropping_the_fetcher_releases_its_registry_listener() {
        let registry = RefetchRegistry::new();

        let fetcher = Fetcher::new(|| async { Ok(()) });
        fetcher.watch_tags(&registry, ["USER"]);
        assert_eq!(registry.listener_count(), 1);

        drop(fetcher);
        assert_eq!(registry.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_completion_after_drop_does_not_write_state() {
        let fetcher = Fetcher::new(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok("late")
        });

        let mut rx = fetcher.subscribe();
        drop(fetcher);

        // Let the in-flight attempt run to completion.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = rx.borrow_and_update().clone();
        assert!(state.data.is_none(), "discarded attempt wrote state");
        assert!(state.loading, "state stayed as it was at drop time");
    }

    #[tokio::test]
    async fn idle_fetcher_runs_nothing_until_a_fetch_fn_arrives() {
        let fetcher = Fetcher::<u32>::idle();
        let state = fetcher.state();
        assert!(!state.loading);
        assert!(state.data.is_none() && state.error.is_none());

        // A reload without an operation is a logged no-op.
        fetcher.reload();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fetcher.state().loading);

        fetcher.set_fetch(|| async { Ok(7) });
        let mut rx = fetcher.subscribe();
        let state = settled(&mut rx).await;
        assert_eq!(state.data.as_deref(), Some(&7));
    }
}
