use room_core::PeerId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

/// The local participant's voice flags. The captured stream itself is held
/// by the capture manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalSessionState {
    /// Whether the local participant has opted into voice
    pub joined: bool,
    /// Whether outgoing tracks are disabled
    pub local_muted: bool,
}

impl LocalSessionState {
    pub fn mark_joined(&mut self) {
        self.joined = true;
        self.local_muted = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Local session state shared by the controller and the membership reactor
pub type SharedSessionState = Arc<RwLock<LocalSessionState>>;

/// Per-peer row of the read model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerView {
    pub muted: bool,
    #[serde(serialize_with = "display_state")]
    pub connection: RTCPeerConnectionState,
    #[serde(serialize_with = "display_state")]
    pub signaling: RTCSignalingState,
}

/// Read-only view of the voice session for rendering
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VoiceSnapshot {
    pub joined: bool,
    pub local_muted: bool,
    pub peers: BTreeMap<PeerId, PeerView>,
}

impl VoiceSnapshot {
    /// Peers whose offer/answer exchange has completed
    pub fn negotiated_peers(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.signaling == RTCSignalingState::Stable)
            .count()
    }

    pub fn connected_peers(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.connection == RTCPeerConnectionState::Connected)
            .count()
    }
}

fn display_state<T: std::fmt::Display, S: serde::Serializer>(state: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_then_reset() {
        let mut state = LocalSessionState {
            joined: false,
            local_muted: true,
        };
        state.mark_joined();
        assert!(state.joined);
        assert!(!state.local_muted);

        state.reset();
        assert_eq!(state, LocalSessionState::default());
    }

    #[test]
    fn counts_peers_by_state() {
        let mut snapshot = VoiceSnapshot::default();
        snapshot.peers.insert(
            PeerId::from("a"),
            PeerView {
                muted: false,
                connection: RTCPeerConnectionState::Connected,
                signaling: RTCSignalingState::Stable,
            },
        );
        snapshot.peers.insert(
            PeerId::from("b"),
            PeerView {
                muted: true,
                connection: RTCPeerConnectionState::Connecting,
                signaling: RTCSignalingState::HaveLocalOffer,
            },
        );
        assert_eq!(snapshot.connected_peers(), 1);
        assert_eq!(snapshot.negotiated_peers(), 1);
    }
}
