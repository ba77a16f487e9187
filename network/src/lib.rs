//! Peer transport and signaling for the voice mesh
//!
//! This crate owns everything between the relay channel and the WebRTC
//! transports: the wire protocol, the connection table, session building
//! and the dispatcher that applies inbound offers, answers and candidates.

pub mod builder;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod table;

pub use builder::{SessionBuilder, TransportConfig};
pub use protocol::{InboundEvent, RelayFrame, Signal};
#[cfg(any(test, feature = "test_utils"))]
pub use relay::MockSignalRelay;
pub use relay::{HubRelay, RelayHub, SignalRelay};
pub use session::{OutboundCandidates, PeerSession};
pub use signaling::{SignalSender, SignalingDispatcher};
pub use table::{ConnectionTable, Registered, Reservation};
