//! Voice session coordination for one participant
//!
//! This crate ties the capture manager, connection table and signaling
//! dispatcher together behind the session controller, and runs them on a
//! single event loop fed by local commands, membership ticks and the relay.

pub mod commands;
pub mod controller;
pub mod handler;
pub mod reactor;
pub mod state;

pub use commands::{VoiceCommand, VoiceHandle};
pub use controller::SessionController;
pub use handler::{VoiceConfig, VoiceHandler};
pub use reactor::MembershipReactor;
pub use state::{LocalSessionState, PeerView, SharedSessionState, VoiceSnapshot};
