//! Signaling dispatcher: drives peer sessions from relay events.

use crate::builder::SessionBuilder;
use crate::protocol::{InboundEvent, Signal};
use crate::relay::SignalRelay;
use crate::table::ConnectionTable;
use log::{debug, info, warn};
use room_core::{Error, PeerId};
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Outbound signaling path. Each call forwards one payload to the relay;
/// there is no acknowledgement or retry.
#[derive(Clone)]
pub struct SignalSender {
    relay: Arc<dyn SignalRelay>,
}

impl SignalSender {
    pub fn new(relay: Arc<dyn SignalRelay>) -> Self {
        Self { relay }
    }

    pub async fn send_offer(&self, target: PeerId, offer: RTCSessionDescription) -> Result<(), Error> {
        debug!("Sending offer to peer {}", target);
        self.relay.send(target, Signal::Offer(offer)).await
    }

    pub async fn send_answer(&self, target: PeerId, answer: RTCSessionDescription) -> Result<(), Error> {
        debug!("Sending answer to peer {}", target);
        self.relay.send(target, Signal::Answer(answer)).await
    }

    pub async fn send_candidate(&self, target: PeerId, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.relay.send(target, Signal::IceCandidate(candidate)).await
    }
}

/// Applies inbound offers, answers and candidates to the matching session.
///
/// Failures never propagate: each event is either applied or logged and
/// dropped. Negotiations are not retried locally.
pub struct SignalingDispatcher {
    builder: Arc<SessionBuilder>,
    table: ConnectionTable,
    signals: SignalSender,
}

impl SignalingDispatcher {
    pub fn new(builder: Arc<SessionBuilder>, table: ConnectionTable, signals: SignalSender) -> Self {
        Self {
            builder,
            table,
            signals,
        }
    }

    pub fn signals(&self) -> &SignalSender {
        &self.signals
    }

    /// Handle one relay event to completion
    pub async fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::Signal { sender, signal } => self.dispatch_signal(sender, signal).await,
            InboundEvent::PeerDisconnected(peer_id) => {
                info!("Peer {} disconnected from relay", peer_id);
                self.table.teardown(&peer_id).await;
            }
        }
    }

    /// Handle one signal from `sender`, logging and dropping any failure
    pub async fn dispatch_signal(&self, sender: PeerId, signal: Signal) {
        let name = signal.name();
        let result = match signal {
            Signal::Offer(offer) => self.handle_offer(&sender, offer).await,
            Signal::Answer(answer) => self.handle_answer(&sender, answer).await,
            Signal::IceCandidate(candidate) => self.handle_candidate(&sender, candidate).await,
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_silent_drop() => {
                debug!("Dropping {} from peer {}: {}", name, sender, e)
            }
            Err(e) => warn!("Dropping {} from peer {}: {}", name, sender, e),
        }
    }

    /// Build or reuse the session, apply the offer and answer it
    pub async fn handle_offer(&self, sender: &PeerId, offer: RTCSessionDescription) -> Result<(), Error> {
        debug!("Handling offer from peer {}", sender);
        let session = self.builder.build_session(sender).await?;

        session.apply_remote_description(offer).await?;
        if !self.table.is_current(&session).await {
            return Err(Error::StaleReference(sender.clone()));
        }

        let answer = session.create_answer().await?;
        if !self.table.is_current(&session).await {
            return Err(Error::StaleReference(sender.clone()));
        }

        self.signals.send_answer(sender.clone(), answer).await?;
        session.release_candidates().await;
        Ok(())
    }

    /// Apply an answer to our outstanding offer
    pub async fn handle_answer(&self, sender: &PeerId, answer: RTCSessionDescription) -> Result<(), Error> {
        debug!("Handling answer from peer {}", sender);
        let session = self
            .table
            .get(sender)
            .await
            .ok_or_else(|| Error::StaleReference(sender.clone()))?;

        session.apply_remote_description(answer).await
    }

    /// Add (or queue) a remote network candidate
    pub async fn handle_candidate(&self, sender: &PeerId, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        let session = self
            .table
            .get(sender)
            .await
            .ok_or_else(|| Error::StaleReference(sender.clone()))?;

        session.add_remote_candidate(candidate).await
    }
}
