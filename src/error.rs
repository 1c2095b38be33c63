//! Typed errors surfaced by the public API.
//!
//! Connection-level failures are never turned into errors for callers: an
//! unreachable relay simply contributes no events, and coverage gaps show up
//! as end markers that never fire. The only synchronous failure is a
//! configuration conflict on the subscribe call itself.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// `max_delay` and `on_eose` cannot be combined: a debounced batch merges
    /// several logical subscriptions into one wire flush, so a single end
    /// marker cannot be attributed to one caller.
    #[error("max_delay and on_eose are mutually exclusive on a subscribe call")]
    ConflictingOptions,
}
