//! Session State
//!
//! The per-peer aggregate of membership, queue and player state, and the
//! store that serializes every mutation of it.

mod model;
mod store;

pub use model::*;
pub(crate) use model::index_or_none;
pub use store::*;

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
