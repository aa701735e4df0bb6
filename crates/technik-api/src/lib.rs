// technik-api: Async transport for the TechnikTeam backend (REST + realtime)

pub mod client;
pub mod error;
pub mod realtime;

pub use client::ApiClient;
pub use error::ApiError;
pub use realtime::{ChannelState, Envelope, RealtimeConfig, RealtimeHandle, TokenProvider};
