//! Signaling messages and their relay wire format.
//!
//! Frames are JSON objects `{"event": <name>, "data": <payload>}`. The
//! sender addresses a frame with `targetPeerId`; the relay strips it and
//! stamps `senderPeerId` before delivery.

use room_core::{Error, PeerId};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Payload of one signaling exchange between two peers
#[derive(Debug, Clone)]
pub enum Signal {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    IceCandidate(RTCIceCandidateInit),
}

impl Signal {
    /// Event name on the relay
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// Decoded event delivered by the relay
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Signal { sender: PeerId, signal: Signal },
    PeerDisconnected(PeerId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub offer: RTCSessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub answer: RTCSessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: RTCIceCandidateInit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartedUser {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub user: DepartedUser,
}

/// One message on the relay channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RelayFrame {
    #[serde(rename = "offer")]
    Offer(OfferPayload),
    #[serde(rename = "answer")]
    Answer(AnswerPayload),
    #[serde(rename = "ice-candidate")]
    IceCandidate(CandidatePayload),
    #[serde(rename = "peer-disconnected")]
    PeerDisconnected(DisconnectPayload),
}

impl RelayFrame {
    /// Frame a signal for sending to `target`
    pub fn outbound(target: PeerId, signal: Signal) -> Self {
        let target_peer_id = Some(target);
        match signal {
            Signal::Offer(offer) => RelayFrame::Offer(OfferPayload {
                offer,
                target_peer_id,
                sender_peer_id: None,
            }),
            Signal::Answer(answer) => RelayFrame::Answer(AnswerPayload {
                answer,
                target_peer_id,
                sender_peer_id: None,
            }),
            Signal::IceCandidate(candidate) => RelayFrame::IceCandidate(CandidatePayload {
                candidate,
                target_peer_id,
                sender_peer_id: None,
            }),
        }
    }

    pub fn peer_disconnected(peer_id: PeerId) -> Self {
        RelayFrame::PeerDisconnected(DisconnectPayload {
            user: DepartedUser { peer_id },
        })
    }

    /// Relay-side routing: take the target off the frame and stamp the
    /// sender. Returns `None` for frames that carry no target.
    pub fn route(self, sender: PeerId) -> Option<(PeerId, RelayFrame)> {
        match self {
            RelayFrame::Offer(mut p) => {
                let target = p.target_peer_id.take()?;
                p.sender_peer_id = Some(sender);
                Some((target, RelayFrame::Offer(p)))
            }
            RelayFrame::Answer(mut p) => {
                let target = p.target_peer_id.take()?;
                p.sender_peer_id = Some(sender);
                Some((target, RelayFrame::Answer(p)))
            }
            RelayFrame::IceCandidate(mut p) => {
                let target = p.target_peer_id.take()?;
                p.sender_peer_id = Some(sender);
                Some((target, RelayFrame::IceCandidate(p)))
            }
            RelayFrame::PeerDisconnected(_) => None,
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode relay frame: {}", e)))
    }

    pub fn decode(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text)
            .map_err(|e| Error::Serialization(format!("Failed to decode relay frame: {}", e)))
    }
}

fn missing_sender(event: &str) -> Error {
    Error::Serialization(format!("Delivered {} frame has no senderPeerId", event))
}

impl TryFrom<RelayFrame> for InboundEvent {
    type Error = Error;

    fn try_from(frame: RelayFrame) -> Result<Self, Self::Error> {
        match frame {
            RelayFrame::Offer(p) => Ok(InboundEvent::Signal {
                sender: p.sender_peer_id.ok_or_else(|| missing_sender("offer"))?,
                signal: Signal::Offer(p.offer),
            }),
            RelayFrame::Answer(p) => Ok(InboundEvent::Signal {
                sender: p.sender_peer_id.ok_or_else(|| missing_sender("answer"))?,
                signal: Signal::Answer(p.answer),
            }),
            RelayFrame::IceCandidate(p) => Ok(InboundEvent::Signal {
                sender: p.sender_peer_id.ok_or_else(|| missing_sender("ice-candidate"))?,
                signal: Signal::IceCandidate(p.candidate),
            }),
            RelayFrame::PeerDisconnected(p) => Ok(InboundEvent::PeerDisconnected(p.user.peer_id)),
        }
    }
}
