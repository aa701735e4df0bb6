// ── Refetch trigger store ──
//
// Process-wide invalidation registry with synchronous push-based
// notification.

mod registry;

pub use registry::{RefetchRegistry, Subscription, TriggerMap};
