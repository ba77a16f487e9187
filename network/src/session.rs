//! One remote participant's transport, playback sink and mute flag.

use crate::signaling::SignalSender;
use audio_io::PlaybackSink;
use log::{debug, warn};
use room_core::{Error, PeerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Default)]
struct GateState {
    open: bool,
    held: Vec<RTCIceCandidateInit>,
}

/// Forwards locally discovered candidates to the peer.
///
/// Candidates found before this side's offer/answer has been handed to the
/// relay are held back and flushed right after it, so the relay's
/// per-target ordering delivers the description first.
pub struct OutboundCandidates {
    peer_id: PeerId,
    signals: SignalSender,
    gate: Mutex<GateState>,
}

impl OutboundCandidates {
    pub fn new(peer_id: PeerId, signals: SignalSender) -> Self {
        Self {
            peer_id,
            signals,
            gate: Mutex::new(GateState::default()),
        }
    }

    /// Called for every local candidate the transport discovers
    pub async fn discovered(&self, candidate: RTCIceCandidateInit) {
        {
            let mut gate = self.gate.lock().await;
            if !gate.open {
                gate.held.push(candidate);
                return;
            }
        }
        self.forward(candidate).await;
    }

    /// Open the gate and send anything held
    pub async fn release(&self) {
        let held = {
            let mut gate = self.gate.lock().await;
            gate.open = true;
            std::mem::take(&mut gate.held)
        };
        for candidate in held {
            self.forward(candidate).await;
        }
    }

    async fn forward(&self, candidate: RTCIceCandidateInit) {
        // Fire-and-forget: a lost candidate only narrows the path search
        if let Err(e) = self.signals.send_candidate(self.peer_id.clone(), candidate).await {
            warn!("Failed to send candidate to peer {}: {}", self.peer_id, e);
        }
    }

    #[cfg(test)]
    pub(crate) async fn held_count(&self) -> usize {
        self.gate.lock().await.held.len()
    }
}

/// A fully wired connection to one remote peer
pub struct PeerSession {
    peer_id: PeerId,
    transport: Arc<RTCPeerConnection>,
    sink: Arc<PlaybackSink>,
    outbound: Arc<OutboundCandidates>,
    locally_muted: AtomicBool,
    /// Remote candidates received before the remote description
    pending_remote: Mutex<Vec<RTCIceCandidateInit>>,
    closed: AtomicBool,
}

impl PeerSession {
    pub fn new(
        peer_id: PeerId,
        transport: Arc<RTCPeerConnection>,
        sink: Arc<PlaybackSink>,
        outbound: Arc<OutboundCandidates>,
    ) -> Self {
        Self {
            peer_id,
            transport,
            sink,
            outbound,
            locally_muted: AtomicBool::new(false),
            pending_remote: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn transport(&self) -> &Arc<RTCPeerConnection> {
        &self.transport
    }

    pub fn sink(&self) -> &Arc<PlaybackSink> {
        &self.sink
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.transport.connection_state()
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.transport.signaling_state()
    }

    pub fn is_locally_muted(&self) -> bool {
        self.locally_muted.load(Ordering::SeqCst)
    }

    /// Mute this peer's audio on the local machine only
    pub fn set_locally_muted(&self, muted: bool) {
        self.locally_muted.store(muted, Ordering::SeqCst);
        self.sink.set_muted(muted);
    }

    /// Flip the local playback mute and return the new value
    pub fn toggle_locally_muted(&self) -> bool {
        let muted = !self.locally_muted.fetch_xor(true, Ordering::SeqCst);
        self.sink.set_muted(muted);
        muted
    }

    /// Create an offer and install it as the local description
    pub async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self
            .transport
            .create_offer(None)
            .await
            .map_err(|e| Error::Network(format!("Failed to create offer: {}", e)))?;
        self.transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| Error::Network(format!("Failed to set local description: {}", e)))?;
        Ok(offer)
    }

    /// Create an answer and install it as the local description
    pub async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self
            .transport
            .create_answer(None)
            .await
            .map_err(|e| Error::SignalingDropped(format!("Failed to create answer: {}", e)))?;
        self.transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::SignalingDropped(format!("Failed to set local description: {}", e)))?;
        Ok(answer)
    }

    /// Apply the peer's offer or answer, then add any candidates that
    /// arrived ahead of it.
    pub async fn apply_remote_description(&self, description: RTCSessionDescription) -> Result<(), Error> {
        self.transport
            .set_remote_description(description)
            .await
            .map_err(|e| Error::SignalingDropped(format!("Failed to set remote description: {}", e)))?;

        let queued = std::mem::take(&mut *self.pending_remote.lock().await);
        if !queued.is_empty() {
            debug!("Flushing {} early candidate(s) from peer {}", queued.len(), self.peer_id);
        }
        for candidate in queued {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Dropping queued candidate from peer {}: {}", self.peer_id, e);
            }
        }
        Ok(())
    }

    /// Add a remote candidate, queueing it until a remote description exists
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        {
            let mut pending = self.pending_remote.lock().await;
            if self.transport.remote_description().await.is_none() {
                pending.push(candidate);
                return Ok(());
            }
        }
        self.transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::SignalingDropped(format!("Failed to add candidate: {}", e)))
    }

    pub async fn pending_remote_candidates(&self) -> usize {
        self.pending_remote.lock().await.len()
    }

    /// Send any local candidates held back until our description went out
    pub async fn release_candidates(&self) {
        self.outbound.release().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the transport and detach the sink. Never fails; repeated
    /// calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.detach();
        if let Err(e) = self.transport.close().await {
            warn!("Error closing transport for peer {}: {}", self.peer_id, e);
        }
        debug!("Closed session for peer {}", self.peer_id);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("locally_muted", &self.is_locally_muted())
            .field("closed", &self.is_closed())
            .finish()
    }
}
