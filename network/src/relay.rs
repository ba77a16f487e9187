//! Outbound path to the message relay, plus an in-process relay hub.

use crate::protocol::{InboundEvent, RelayFrame, Signal};
use async_trait::async_trait;
use log::{debug, trace, warn};
use room_core::{Error, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Ferries signaling payloads to another participant by identifier.
/// The relay never interprets payloads and gives no acknowledgement.
#[cfg_attr(any(test, feature = "test_utils"), mockall::automock)]
#[async_trait]
pub trait SignalRelay: Send + Sync {
    async fn send(&self, target: PeerId, signal: Signal) -> Result<(), Error>;
}

/// In-process relay server. Routes JSON frames between registered peers,
/// preserving per-target order.
#[derive(Clone)]
pub struct RelayHub {
    routes: Arc<RwLock<HashMap<PeerId, mpsc::Sender<InboundEvent>>>>,
    capacity: usize,
}

impl RelayHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Connect a participant. Returns its outbound handle and inbound events.
    pub async fn register(&self, peer_id: PeerId) -> (HubRelay, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.routes.write().await.insert(peer_id.clone(), tx).is_some() {
            warn!("Peer {} re-registered with the relay", peer_id);
        }
        debug!("Peer {} connected to relay", peer_id);

        let relay = HubRelay {
            hub: self.clone(),
            peer_id,
        };
        (relay, rx)
    }

    /// Drop a participant and tell everyone else it left
    pub async fn disconnect(&self, peer_id: &PeerId) {
        let remaining: Vec<(PeerId, mpsc::Sender<InboundEvent>)> = {
            let mut routes = self.routes.write().await;
            if routes.remove(peer_id).is_none() {
                return;
            }
            routes.iter().map(|(p, tx)| (p.clone(), tx.clone())).collect()
        };
        debug!("Peer {} disconnected from relay", peer_id);

        for (peer, tx) in remaining {
            let frame = RelayFrame::peer_disconnected(peer_id.clone());
            match Self::deliverable(&frame) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        debug!("Peer {} no longer listening", peer);
                    }
                }
                Err(e) => warn!("Failed to build disconnect notice: {}", e),
            }
        }
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.routes.read().await.keys().cloned().collect()
    }

    /// Encode and re-decode a frame the way a remote relay would deliver it
    fn deliverable(frame: &RelayFrame) -> Result<InboundEvent, Error> {
        let text = frame.encode()?;
        InboundEvent::try_from(RelayFrame::decode(&text)?)
    }

    async fn route(&self, sender: &PeerId, text: &str) -> Result<(), Error> {
        let frame = RelayFrame::decode(text)?;
        let Some((target, delivered)) = frame.route(sender.clone()) else {
            return Err(Error::Network("Frame has no target".to_string()));
        };
        let event = Self::deliverable(&delivered)?;

        let tx = self.routes.read().await.get(&target).cloned();
        match tx {
            Some(tx) => {
                trace!("Relaying frame {} -> {}", sender, target);
                tx.send(event)
                    .await
                    .map_err(|_| Error::Network(format!("Peer {} stopped listening", target)))
            }
            None => {
                // Unknown targets are dropped silently, like a real relay
                debug!("Relay dropping frame for unknown peer {}", target);
                Ok(())
            }
        }
    }
}

/// A participant's connection to a [`RelayHub`]
#[derive(Clone)]
pub struct HubRelay {
    hub: RelayHub,
    peer_id: PeerId,
}

impl HubRelay {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

#[async_trait]
impl SignalRelay for HubRelay {
    async fn send(&self, target: PeerId, signal: Signal) -> Result<(), Error> {
        let text = RelayFrame::outbound(target, signal).encode()?;
        self.hub.route(&self.peer_id, &text).await
    }
}
