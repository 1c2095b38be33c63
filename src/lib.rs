//! Client-side subscription multiplexer for Nostr-style relay networks.
//!
//! A [`RelayPool`] issues one logical query against many relays at once and
//! hands back a deduplicated, merged result stream. Subscribe calls arriving
//! within a debounce window are batched into one wire-level flush; per-relay
//! filters are merged before they generate traffic; previously observed
//! events answer from the in-memory cache instead of requerying; and one
//! long-lived connection per relay URL is shared by every subscription.
//!
//! The transport is pluggable through the [`conn::Connector`] trait, with a
//! tokio-tungstenite implementation ([`ws::WsConnector`]) as the default.
//! Record validation, relay discovery, and rate limiting are out of scope;
//! an unreachable relay never surfaces as an error — it simply contributes
//! no events.

pub mod cache;
pub mod conn;
pub mod error;
pub mod event;
pub mod filter;
pub mod pool;
pub mod router;
pub mod wire;
pub mod ws;

// Re-export commonly used types
pub use cache::EventCache;
pub use conn::{ConnectionRegistry, Connector, ConnectorHandle, RelayConnection};
pub use error::PoolError;
pub use event::Event;
pub use filter::{merge_filters, Filter};
pub use pool::{OnEose, OnEvent, PoolOptions, RelayPool, SubscribeOptions, Unsubscribe};
pub use wire::RelayMessage;
pub use ws::WsConnector;
