//! Authoritative map from peer to its live session.

use crate::session::PeerSession;
use log::debug;
use room_core::{Error, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

#[derive(Default)]
struct TableInner {
    sessions: HashMap<PeerId, Arc<PeerSession>>,
    /// Bumped whenever the whole table is cleared
    clear_epoch: u64,
}

/// Builds in flight for one peer
#[derive(Debug, Default)]
struct InFlight {
    builds: usize,
    /// Bumped whenever the peer is torn down mid-build
    epoch: u64,
}

type InFlightMap = Arc<Mutex<HashMap<PeerId, InFlight>>>;

/// Taken before a session is built; registration fails if the peer was
/// torn down (or the table cleared) while the build was in flight.
///
/// A peer only has an epoch entry while a reservation for it is alive.
#[derive(Debug)]
pub struct Reservation {
    peer_id: PeerId,
    epoch: u64,
    clear_epoch: u64,
    in_flight: InFlightMap,
}

impl Reservation {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if let Some(entry) = in_flight.get_mut(&self.peer_id) {
                entry.builds = entry.builds.saturating_sub(1);
                if entry.builds == 0 {
                    in_flight.remove(&self.peer_id);
                }
            }
        }
    }
}

/// Outcome of registering a freshly built session
pub enum Registered {
    Inserted(Arc<PeerSession>),
    /// Another session already existed; the new one was not inserted
    Existing(Arc<PeerSession>),
}

/// Shared handle to the connection table. Clones refer to the same table.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<RwLock<TableInner>>,
    /// Only locked while `inner` is held, or briefly on reservation drop
    in_flight: InFlightMap,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.inner.read().await.sessions.get(peer_id).cloned()
    }

    pub async fn contains(&self, peer_id: &PeerId) -> bool {
        self.inner.read().await.sessions.contains_key(peer_id)
    }

    /// Whether `session` is still the registered session for its peer
    pub async fn is_current(&self, session: &Arc<PeerSession>) -> bool {
        self.inner
            .read()
            .await
            .sessions
            .get(session.peer_id())
            .map(|s| Arc::ptr_eq(s, session))
            .unwrap_or(false)
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.read().await.sessions.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    /// Local playback mute flag of every peer
    pub async fn mute_map(&self) -> BTreeMap<PeerId, bool> {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .map(|(peer, s)| (peer.clone(), s.is_locally_muted()))
            .collect()
    }

    pub async fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    pub async fn reserve(&self, peer_id: &PeerId) -> Reservation {
        let inner = self.inner.read().await;
        let epoch = match self.in_flight.lock() {
            Ok(mut in_flight) => {
                let entry = in_flight.entry(peer_id.clone()).or_default();
                entry.builds += 1;
                entry.epoch
            }
            Err(_) => 0,
        };
        Reservation {
            peer_id: peer_id.clone(),
            epoch,
            clear_epoch: inner.clear_epoch,
            in_flight: self.in_flight.clone(),
        }
    }

    fn epoch_of(&self, peer_id: &PeerId) -> Option<u64> {
        self.in_flight.lock().ok()?.get(peer_id).map(|f| f.epoch)
    }

    fn check(&self, inner: &TableInner, reservation: &Reservation) -> bool {
        inner.clear_epoch == reservation.clear_epoch
            && self.epoch_of(&reservation.peer_id) == Some(reservation.epoch)
    }

    /// Whether no teardown or clear has invalidated `reservation` yet
    pub async fn is_valid(&self, reservation: &Reservation) -> bool {
        let inner = self.inner.read().await;
        self.check(&inner, reservation)
    }

    /// Whether the table was cleared since `reservation` was taken
    pub async fn cleared_since(&self, reservation: &Reservation) -> bool {
        self.inner.read().await.clear_epoch != reservation.clear_epoch
    }

    /// Peers with a build in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Insert a fully built session. Fails with `StaleReference` if the
    /// reservation was invalidated by a teardown or clear.
    pub async fn register(&self, reservation: &Reservation, session: Arc<PeerSession>) -> Result<Registered, Error> {
        let mut inner = self.inner.write().await;
        if !self.check(&inner, reservation) {
            return Err(Error::StaleReference(reservation.peer_id.clone()));
        }
        if let Some(existing) = inner.sessions.get(&reservation.peer_id) {
            return Ok(Registered::Existing(existing.clone()));
        }
        inner.sessions.insert(reservation.peer_id.clone(), session.clone());
        Ok(Registered::Inserted(session))
    }

    /// Remove a peer's session without closing it
    async fn remove(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        let mut inner = self.inner.write().await;
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if let Some(entry) = in_flight.get_mut(peer_id) {
                entry.epoch += 1;
            }
        }
        inner.sessions.remove(peer_id)
    }

    /// Close and remove a peer's session. Safe for unknown peers and
    /// repeated calls. Returns whether a session was removed.
    pub async fn teardown(&self, peer_id: &PeerId) -> bool {
        match self.remove(peer_id).await {
            Some(session) => {
                session.close().await;
                debug!("Tore down session for peer {}", peer_id);
                true
            }
            None => false,
        }
    }

    /// Tear down every session. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let drained: Vec<Arc<PeerSession>> = {
            let mut inner = self.inner.write().await;
            inner.clear_epoch += 1;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        for session in drained {
            session.close().await;
        }
        if count > 0 {
            debug!("Tore down {} session(s)", count);
        }
        count
    }
}
