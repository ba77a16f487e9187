use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a participant as addressed by the message relay.
///
/// Relay identifiers are opaque strings, stable for the lifetime of a
/// connection to the relay but not globally persistent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display only the first 8 characters for brevity
        let short: String = self.0.chars().take(8).collect();
        write!(f, "{}", short)
    }
}

/// Unified error type for the voice mesh.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The audio capture device refused or could not be opened.
    #[error("Capture denied: {0}")]
    CaptureDenied(String),

    /// Applying a remote description or candidate failed.
    #[error("Signaling dropped: {0}")]
    SignalingDropped(String),

    /// A signal or continuation referenced a peer with no live session.
    #[error("No live session for peer {0}")]
    StaleReference(PeerId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Errors that are expected under churn and dropped without a warning.
    pub fn is_silent_drop(&self) -> bool {
        matches!(self, Error::StaleReference(_))
    }
}

/// Sample rate carried on the wire (G.711 narrowband).
pub const SAMPLE_RATE: u32 = 8000;
pub const CHANNELS: u16 = 1;
/// Duration of one audio frame in milliseconds.
pub const FRAME_MS: u64 = 20;
/// Samples per channel in one frame at [`SAMPLE_RATE`].
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize * FRAME_MS as usize) / 1000;

/// Represents a buffer of audio samples.
/// Samples are typically f32.
pub type AudioBuffer = Vec<f32>;

pub mod events;

pub use events::{MembershipEvent, Participant, ParticipantStatus};
