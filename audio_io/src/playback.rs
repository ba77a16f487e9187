//! Playback of one remote peer's audio.

use crate::g711;
use log::{debug, info};
use room_core::{AudioBuffer, PeerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Output device instance bound to exactly one transport.
///
/// Decoded audio is delivered as `(peer, buffer)` on the output channel
/// unless the sink is muted. Only the first inbound audio track is bound.
pub struct PlaybackSink {
    peer_id: PeerId,
    muted: Arc<AtomicBool>,
    detached: AtomicBool,
    output: Option<mpsc::Sender<(PeerId, AudioBuffer)>>,
    reader: OnceLock<AbortHandle>,
}

impl PlaybackSink {
    pub fn new(peer_id: PeerId, output: Option<mpsc::Sender<(PeerId, AudioBuffer)>>) -> Self {
        Self {
            peer_id,
            muted: Arc::new(AtomicBool::new(false)),
            detached: AtomicBool::new(false),
            output,
            reader: OnceLock::new(),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Whether a remote track is currently bound
    pub fn is_bound(&self) -> bool {
        self.reader.get().is_some() && !self.is_detached()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Bind a remote track. Returns false if the track was ignored.
    pub fn attach(&self, track: Arc<TrackRemote>) -> bool {
        if self.is_detached() || track.kind() != RTPCodecType::Audio {
            return false;
        }
        if self.reader.get().is_some() {
            debug!("Peer {} already has a bound stream, ignoring track", self.peer_id);
            return false;
        }

        let task = tokio::spawn(read_track(
            track,
            self.peer_id.clone(),
            self.muted.clone(),
            self.output.clone(),
        ));
        if self.reader.set(task.abort_handle()).is_err() {
            task.abort();
            return false;
        }
        // A detach may have raced with the bind
        if self.is_detached() {
            task.abort();
        }
        true
    }

    /// Stop playback and release the bound track. Idempotent.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.get() {
            reader.abort();
        }
        debug!("Playback sink for peer {} detached", self.peer_id);
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn read_track(
    track: Arc<TrackRemote>,
    peer_id: PeerId,
    muted: Arc<AtomicBool>,
    output: Option<mpsc::Sender<(PeerId, AudioBuffer)>>,
) {
    info!("Starting playback of audio track {} from peer {}", track.id(), peer_id);

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                if muted.load(Ordering::SeqCst) {
                    continue;
                }
                let Some(output) = &output else { continue };
                let buffer = g711::decode_frame(&packet.payload);
                // Playback must not stall the transport; drop on backpressure
                let _ = output.try_send((peer_id.clone(), buffer));
            }
            Err(e) => {
                debug!("Audio track from peer {} ended: {}", peer_id, e);
                break;
            }
        }
    }
}
