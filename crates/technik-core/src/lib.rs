// technik-core: Reactive client layer between technik-api and the screens.

pub mod config;
pub mod error;
pub mod fetch;
pub mod session;
pub mod store;
pub mod stream;
pub mod tags;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::ClientConfig;
pub use error::CoreError;
pub use fetch::{FetchState, Fetcher};
pub use session::Session;
pub use store::{RefetchRegistry, Subscription, TriggerMap};
pub use stream::FetchStream;
