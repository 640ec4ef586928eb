//! Tabletop Jukebox - Core Library
//!
//! A shared video queue for a group session: one member at a time holds
//! the DJ role and drives playback, and every other peer's player follows
//! the DJ's through relayed commands and periodic drift correction.

pub mod bus;
pub mod config;
pub mod dialog;
pub mod ffi;
pub mod membership;
pub mod network;
pub mod peer;
pub mod playback;
pub mod player;
pub mod queue;
pub mod state;

// Re-exports for convenience
pub use bus::{Envelope, LocalHub, MessageBus, Relay};
pub use config::SyncConfig;
pub use peer::{LocalUser, Peer, PeerContext};
pub use player::{HttpPlayer, PlayerDriver};
pub use state::{QueueItem, SessionState, StateStore};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
