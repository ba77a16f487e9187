//! Reacts to membership changes by initiating or tearing down sessions.

use crate::state::SharedSessionState;
use log::{debug, info, warn};
use network::{ConnectionTable, PeerSession, SessionBuilder};
use room_core::{Error, Participant, ParticipantStatus, PeerId};
use std::sync::Arc;

/// Only the side that observes a new peer initiates; a newly joined peer
/// waits for incoming offers.
pub struct MembershipReactor {
    local_id: PeerId,
    state: SharedSessionState,
    builder: Arc<SessionBuilder>,
    table: ConnectionTable,
}

impl MembershipReactor {
    pub fn new(local_id: PeerId, state: SharedSessionState, builder: Arc<SessionBuilder>) -> Self {
        let table = builder.table().clone();
        Self {
            local_id,
            state,
            builder,
            table,
        }
    }

    /// Participants we should offer to: everyone present except ourselves
    /// who has no session yet. Empty unless joined.
    pub async fn peers_to_initiate(&self, participants: &[Participant]) -> Vec<PeerId> {
        if !self.state.read().await.joined {
            return Vec::new();
        }

        let mut peers = Vec::new();
        for participant in participants {
            if participant.peer_id == self.local_id || participant.status == ParticipantStatus::Offline {
                continue;
            }
            if !self.table.contains(&participant.peer_id).await {
                peers.push(participant.peer_id.clone());
            }
        }
        peers
    }

    /// Build a session for `peer_id` and send it an offer. A peer that
    /// fails is left without a session until the next membership tick.
    pub async fn initiate(&self, peer_id: &PeerId) -> Result<(), Error> {
        if !self.state.read().await.joined {
            debug!("No longer joined, not offering to peer {}", peer_id);
            return Ok(());
        }
        if self.table.contains(peer_id).await {
            return Ok(());
        }

        let session = self.builder.build_session(peer_id).await?;
        if let Err(e) = self.offer(&session).await {
            if self.table.is_current(&session).await {
                self.table.teardown(peer_id).await;
            }
            return Err(e);
        }
        info!("Sent offer to peer {}", peer_id);
        Ok(())
    }

    async fn offer(&self, session: &Arc<PeerSession>) -> Result<(), Error> {
        let offer = session.create_offer().await?;
        if !self.table.is_current(session).await {
            return Err(Error::StaleReference(session.peer_id().clone()));
        }
        self.builder
            .signals()
            .send_offer(session.peer_id().clone(), offer)
            .await?;
        session.release_candidates().await;
        Ok(())
    }

    /// The membership service reported a departure. Runs whether or not
    /// we are joined.
    pub async fn on_peer_departed(&self, peer_id: &PeerId) {
        if self.table.teardown(peer_id).await {
            info!("Peer {} left, session closed", peer_id);
        } else {
            debug!("Peer {} left with no session", peer_id);
        }
    }

    pub(crate) fn log_failure(peer_id: &PeerId, e: &Error) {
        if e.is_silent_drop() {
            debug!("Offer to peer {} abandoned: {}", peer_id, e);
        } else {
            warn!("Could not offer to peer {}: {}", peer_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalSessionState;
    use audio_io::{CaptureManager, LocalAudioTrack, MediaStream, MockMediaDevice};
    use network::{MockSignalRelay, SignalSender, TransportConfig};
    use tokio::sync::RwLock;

    fn reactor(device: MockMediaDevice, relay: MockSignalRelay, joined: bool) -> MembershipReactor {
        let capture = Arc::new(CaptureManager::new(Arc::new(device)));
        let builder = SessionBuilder::new(
            &TransportConfig::local_only(),
            capture,
            ConnectionTable::new(),
            SignalSender::new(Arc::new(relay)),
            None,
        )
        .unwrap();
        let state = Arc::new(RwLock::new(LocalSessionState {
            joined,
            local_muted: false,
        }));
        MembershipReactor::new(PeerId::from("me"), state, Arc::new(builder))
    }

    fn granting_device() -> MockMediaDevice {
        let mut device = MockMediaDevice::new();
        device
            .expect_acquire()
            .returning(|_| Ok(MediaStream::new("s".to_string(), vec![LocalAudioTrack::new("s")], None)));
        device
    }

    fn members() -> Vec<Participant> {
        let mut away = Participant::online(PeerId::from("carol"), "Carol");
        away.status = ParticipantStatus::Away;
        let mut gone = Participant::online(PeerId::from("dave"), "Dave");
        gone.status = ParticipantStatus::Offline;
        vec![
            Participant::online(PeerId::from("me"), "Me"),
            Participant::online(PeerId::from("bob"), "Bob"),
            away,
            gone,
        ]
    }

    #[tokio::test]
    async fn test_nothing_to_initiate_unless_joined() {
        let reactor = reactor(MockMediaDevice::new(), MockSignalRelay::new(), false);
        assert!(reactor.peers_to_initiate(&members()).await.is_empty());
        reactor.initiate(&PeerId::from("bob")).await.unwrap();
        assert!(reactor.table.is_empty().await);
    }

    #[tokio::test]
    async fn test_skips_self_and_offline() {
        let reactor = reactor(MockMediaDevice::new(), MockSignalRelay::new(), true);
        let peers = reactor.peers_to_initiate(&members()).await;
        assert_eq!(peers, vec![PeerId::from("bob"), PeerId::from("carol")]);
    }

    #[test_log::test(tokio::test)]
    async fn test_initiate_sends_one_offer() {
        let mut relay = MockSignalRelay::new();
        relay
            .expect_send()
            .withf(|target, signal| target == &PeerId::from("bob") && signal.name() == "offer")
            .times(1)
            .returning(|_, _| Ok(()));
        relay
            .expect_send()
            .withf(|_, signal| signal.name() == "ice-candidate")
            .returning(|_, _| Ok(()));
        let reactor = reactor(granting_device(), relay, true);
        let bob = PeerId::from("bob");

        reactor.initiate(&bob).await.unwrap();
        reactor.initiate(&bob).await.unwrap();

        assert_eq!(reactor.table.len().await, 1);
        assert_eq!(reactor.peers_to_initiate(&members()).await, vec![PeerId::from("carol")]);
    }

    #[test_log::test(tokio::test)]
    async fn test_capture_denial_skips_peer() {
        let mut device = MockMediaDevice::new();
        device
            .expect_acquire()
            .returning(|_| Err(Error::CaptureDenied("denied".to_string())));
        let reactor = reactor(device, MockSignalRelay::new(), true);

        let result = reactor.initiate(&PeerId::from("bob")).await;
        assert!(matches!(result, Err(Error::CaptureDenied(_))));
        assert!(reactor.table.is_empty().await);
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_offer_send_tears_down() {
        let mut relay = MockSignalRelay::new();
        relay
            .expect_send()
            .returning(|_, _| Err(Error::Network("relay down".to_string())));
        let reactor = reactor(granting_device(), relay, true);

        assert!(reactor.initiate(&PeerId::from("bob")).await.is_err());
        assert!(reactor.table.is_empty().await);
    }

    #[tokio::test]
    async fn test_departure_without_session() {
        let reactor = reactor(MockMediaDevice::new(), MockSignalRelay::new(), false);
        reactor.on_peer_departed(&PeerId::from("bob")).await;
        assert!(reactor.table.is_empty().await);
    }
}
