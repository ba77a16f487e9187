//! Audio input/output for the voice mesh
//!
//! This crate owns the local capture lifecycle (microphone or synthetic
//! tone), the outgoing PCMU tracks, and per-peer playback sinks.

pub mod capture;
pub mod device;
pub mod g711;
pub mod microphone;
pub mod playback;
pub mod stream;

pub use capture::{CaptureManager, CaptureTicket};
#[cfg(any(test, feature = "test_utils"))]
pub use device::MockMediaDevice;
pub use device::{tone_frame, MediaDevice, ToneDevice};
pub use microphone::CpalMicrophone;
pub use playback::PlaybackSink;
pub use stream::{pcmu_capability, CaptureGuard, LocalAudioTrack, MediaKind, MediaStream};
