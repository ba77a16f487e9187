//! Local media stream and its outgoing audio tracks.

use crate::g711;
use bytes::Bytes;
use log::debug;
use room_core::{Error, FRAME_MS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Kind of media requested from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
}

/// Codec capability of every local audio track
pub fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: room_core::SAMPLE_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Keeps capture hardware running until stopped
pub trait CaptureGuard: Send + Sync {
    /// Release the hardware. Called at most once.
    fn stop(&self);
}

/// One outgoing audio track. Clones share the enabled flag.
#[derive(Clone)]
pub struct LocalAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalAudioTrack {
    pub fn new(stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            pcmu_capability(),
            format!("audio-{}", uuid::Uuid::new_v4()),
            stream_id.to_string(),
        );
        Self {
            track: Arc::new(track),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// The track as handed to a peer connection
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Encode and write one frame to every bound transport.
    /// A disabled track keeps the RTP clock running with silence.
    pub async fn write_frame(&self, pcm: &[f32]) -> Result<(), Error> {
        let data = if self.is_enabled() {
            g711::encode_frame(pcm)
        } else {
            vec![g711::SILENCE; pcm.len()]
        };

        self.track
            .write_sample(&Sample {
                data: Bytes::from(data),
                duration: Duration::from_millis(FRAME_MS),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Audio(format!("Failed to write sample: {}", e)))
    }
}

struct StreamInner {
    id: String,
    tracks: Vec<LocalAudioTrack>,
    guard: Option<Box<dyn CaptureGuard>>,
    stopped: AtomicBool,
}

/// Captured local audio. Cheap to clone; clones refer to the same capture.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(id: String, tracks: Vec<LocalAudioTrack>, guard: Option<Box<dyn CaptureGuard>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id,
                tracks,
                guard,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// A stream with one audio track and no hardware behind it
    pub fn detached() -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let track = LocalAudioTrack::new(&id);
        Self::new(id, vec![track], None)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[LocalAudioTrack] {
        &self.inner.tracks
    }

    /// Toggle every track
    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.inner.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop capture. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_enabled(false);
        if let Some(guard) = &self.inner.guard {
            guard.stop();
        }
        debug!("Stopped media stream {}", self.inner.id);
    }

    pub fn ptr_eq(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
