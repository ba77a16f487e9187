//! Top-level voice session API: join, leave and mute controls.

use crate::state::{PeerView, SharedSessionState, VoiceSnapshot};
use audio_io::CaptureManager;
use log::{debug, info};
use network::ConnectionTable;
use room_core::{Error, PeerId};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct SessionController {
    state: SharedSessionState,
    capture: Arc<CaptureManager>,
    table: ConnectionTable,
}

impl SessionController {
    pub fn new(state: SharedSessionState, capture: Arc<CaptureManager>, table: ConnectionTable) -> Self {
        Self { state, capture, table }
    }

    /// Opt into voice. Acquires the local stream but creates no sessions;
    /// the next membership tick does that.
    pub async fn join(&self) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if state.joined {
            debug!("Already joined");
            return Ok(());
        }

        self.capture.acquire().await?;
        self.capture.set_local_muted(false).await;
        state.mark_joined();
        info!("Joined voice");
        Ok(())
    }

    /// Leave voice: release capture and tear down every session. Safe to
    /// repeat.
    ///
    /// The table is cleared before capture is released so a build still in
    /// flight either sees the clear or has its stream released here.
    pub async fn leave(&self) {
        let mut state = self.state.write().await;
        state.reset();
        let closed = self.table.clear().await;
        self.capture.release().await;
        info!("Left voice ({} session(s) closed)", closed);
    }

    /// Flip the outgoing mute. Returns the new value; no-op unless joined.
    pub async fn toggle_local_mute(&self) -> bool {
        let mut state = self.state.write().await;
        if !state.joined {
            return state.local_muted;
        }
        state.local_muted = !state.local_muted;
        self.capture.set_local_muted(state.local_muted).await;
        debug!("Local mute {}", if state.local_muted { "on" } else { "off" });
        state.local_muted
    }

    /// Flip local playback of one peer. Nothing is sent to the peer.
    pub async fn toggle_remote_mute(&self, peer_id: &PeerId) -> Result<bool, Error> {
        let session = self
            .table
            .get(peer_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("No session for peer {}", peer_id)))?;
        let muted = session.toggle_locally_muted();
        debug!("Playback of peer {} {}", peer_id, if muted { "muted" } else { "unmuted" });
        Ok(muted)
    }

    pub async fn is_joined(&self) -> bool {
        self.state.read().await.joined
    }

    pub async fn is_local_muted(&self) -> bool {
        self.state.read().await.local_muted
    }

    pub async fn remote_mutes(&self) -> BTreeMap<PeerId, bool> {
        self.table.mute_map().await
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub async fn snapshot(&self) -> VoiceSnapshot {
        let state = *self.state.read().await;
        let peers = self
            .table
            .sessions()
            .await
            .into_iter()
            .map(|s| {
                let view = PeerView {
                    muted: s.is_locally_muted(),
                    connection: s.connection_state(),
                    signaling: s.signaling_state(),
                };
                (s.peer_id().clone(), view)
            })
            .collect();

        VoiceSnapshot {
            joined: state.joined,
            local_muted: state.local_muted,
            peers,
        }
    }
}
