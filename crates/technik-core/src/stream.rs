// ── Reactive fetch-state streams ──
//
// Subscription adapter for consuming Fetcher state changes as a Stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::fetch::FetchState;

/// A subscription to one fetcher's state.
///
/// Provides both point-in-time snapshot access and reactive change
/// notification via the `changed()` method or by converting to a `Stream`.
pub struct FetchStream<T: Send + Sync + 'static> {
    current: FetchState<T>,
    receiver: watch::Receiver<FetchState<T>>,
}

impl<T: Send + Sync + 'static> FetchStream<T> {
    pub(crate) fn new(receiver: watch::Receiver<FetchState<T>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// Get the snapshot captured at creation time.
    pub fn current(&self) -> &FetchState<T> {
        &self.current
    }

    /// Get the latest snapshot (may have changed since creation).
    pub fn latest(&self) -> FetchState<T> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change, returning the new snapshot.
    /// Returns `None` if the owning fetcher has been dropped.
    pub async fn changed(&mut self) -> Option<FetchState<T>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> FetchWatchStream<T> {
        FetchWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `watch::Receiver`.
///
/// Yields a new [`FetchState`] snapshot each time the fetcher's state
/// is mutated.
pub struct FetchWatchStream<T: Send + Sync + 'static> {
    inner: WatchStream<FetchState<T>>,
}

impl<T: Send + Sync + 'static> Stream for FetchWatchStream<T> {
    type Item = FetchState<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // WatchStream is Unpin when the inner type is Unpin.
        // FetchState<T> only holds Arcs and owned fields, so it always is.
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;
    use crate::fetch::Fetcher;

    #[tokio::test]
    async fn changed_yields_each_state_transition() {
        let fetcher = Fetcher::new(|| async { Ok(41) });
        let mut stream = fetcher.stream();

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let state = stream.changed().await.unwrap();
                if !state.loading {
                    return state;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(settled.data.as_deref(), Some(&41));
        assert_eq!(stream.current().data.as_deref(), Some(&41));
    }

    #[tokio::test]
    async fn changed_returns_none_after_the_fetcher_drops() {
        let fetcher = Fetcher::<u32>::idle();
        let mut stream = fetcher.stream();

        drop(fetcher);
        // The pump task may hold the sender a beat longer than the drop.
        tokio::time::timeout(Duration::from_secs(5), async {
            while stream.changed().await.is_some() {}
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn into_stream_feeds_combinators() {
        let fetcher = Fetcher::new(|| async { Ok("done") });
        let stream = fetcher.stream().into_stream();

        let settled = tokio::time::timeout(
            Duration::from_secs(5),
            stream.filter(|s| std::future::ready(!s.loading)).next(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(settled.data.as_deref(), Some(&"done"));
    }
}
