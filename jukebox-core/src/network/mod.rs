//! P2P Networking
//!
//! Uses libp2p gossipsub to relay bus envelopes between the peers of a
//! session.

mod behaviour;
mod session_code;

pub use behaviour::{NetworkConfig, NetworkError, NetworkEvent, NetworkHandle, NetworkManager};
pub use session_code::SessionCode;
