use crate::PeerId;
use serde::{Deserialize, Serialize};

/// Presence of a participant as reported by the membership service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Online,
    Away,
    Offline,
}

/// One entry in the room membership list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub peer_id: PeerId,
    pub display_name: String,
    pub status: ParticipantStatus,
}

impl Participant {
    pub fn online(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            status: ParticipantStatus::Online,
        }
    }
}

/// Events published by the room membership service
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    /// The whole participant list, published on every change
    Updated(Vec<Participant>),
    /// A participant left the room
    PeerDeparted(PeerId),
}
