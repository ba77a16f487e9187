//! Builds fully wired peer sessions and registers them in the table.

use crate::session::{OutboundCandidates, PeerSession};
use crate::signaling::SignalSender;
use crate::table::{ConnectionTable, Registered, Reservation};
use audio_io::{pcmu_capability, CaptureManager, CaptureTicket, PlaybackSink};
use log::{debug, info, trace, warn};
use room_core::{AudioBuffer, Error, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

/// Static payload type for PCMU
const PCMU_PAYLOAD_TYPE: u8 = 0;

/// Transport-level settings shared by every peer connection
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// STUN/TURN server URLs used for path discovery
    pub ice_servers: Vec<String>,
    /// Gather mDNS-obfuscated host candidates
    pub enable_mdns: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            enable_mdns: false,
        }
    }
}

impl TransportConfig {
    /// Host candidates only; no external servers
    pub fn local_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            enable_mdns: false,
        }
    }
}

/// Creates peer sessions: transport, handlers, local audio and playback
pub struct SessionBuilder {
    api: API,
    rtc_config: RTCConfiguration,
    capture: Arc<CaptureManager>,
    table: ConnectionTable,
    signals: SignalSender,
    audio_out: Option<mpsc::Sender<(PeerId, AudioBuffer)>>,
    /// Serializes builds for the same peer
    build_locks: Mutex<HashMap<PeerId, Arc<Mutex<()>>>>,
}

impl SessionBuilder {
    pub fn new(
        config: &TransportConfig,
        capture: Arc<CaptureManager>,
        table: ConnectionTable,
        signals: SignalSender,
        audio_out: Option<mpsc::Sender<(PeerId, AudioBuffer)>>,
    ) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: pcmu_capability(),
                    payload_type: PCMU_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| Error::Network(format!("Failed to register PCMU: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Network(format!("Failed to register interceptors: {}", e)))?;

        let mut setting_engine = SettingEngine::default();
        if !config.enable_mdns {
            setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            capture,
            table,
            signals,
            audio_out,
            build_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn capture(&self) -> &Arc<CaptureManager> {
        &self.capture
    }

    pub fn signals(&self) -> &SignalSender {
        &self.signals
    }

    /// Return the registered session for `peer_id`, building one if needed.
    ///
    /// On failure nothing is registered and any half-built transport is
    /// closed. Fails with `StaleReference` if the peer was torn down while
    /// the build was in flight.
    pub async fn build_session(&self, peer_id: &PeerId) -> Result<Arc<PeerSession>, Error> {
        if let Some(existing) = self.table.get(peer_id).await {
            trace!("Re-using session for peer {}", peer_id);
            return Ok(existing);
        }

        let lock = self
            .build_locks
            .lock()
            .await
            .entry(peer_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match self.table.get(peer_id).await {
                Some(existing) => Ok(existing),
                None => self.build_locked(peer_id).await,
            }
        };

        // The map and this function hold the only references once no other
        // build for this peer is waiting.
        let mut locks = self.build_locks.lock().await;
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(peer_id);
        }

        result
    }

    async fn build_locked(&self, peer_id: &PeerId) -> Result<Arc<PeerSession>, Error> {
        let reservation = self.table.reserve(peer_id).await;
        debug!("Building session for peer {}", peer_id);

        let transport = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(|e| Error::Network(format!("Failed to create peer connection: {}", e)))?,
        );

        let outbound = Arc::new(OutboundCandidates::new(peer_id.clone(), self.signals.clone()));
        let sink = Arc::new(PlaybackSink::new(peer_id.clone(), self.audio_out.clone()));
        install_handlers(&transport, peer_id, &outbound, &sink);

        // A leave or teardown may have landed while the transport was created
        if !self.table.is_valid(&reservation).await {
            debug!("Peer {} went away before capture was acquired", peer_id);
            close_quietly(&transport, peer_id).await;
            return Err(Error::StaleReference(peer_id.clone()));
        }

        let (stream, ticket) = match self.capture.acquire_with_ticket().await {
            Ok(acquired) => acquired,
            Err(e) => {
                close_quietly(&transport, peer_id).await;
                return Err(e);
            }
        };

        for track in stream.tracks() {
            match transport.add_track(track.as_track_local()).await {
                Ok(sender) => {
                    // Drain RTCP so the interceptors keep running
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 1500];
                        while sender.read(&mut buf).await.is_ok() {}
                    });
                }
                Err(e) => {
                    close_quietly(&transport, peer_id).await;
                    self.release_after_leave(&reservation, ticket).await;
                    return Err(Error::Network(format!("Failed to add local track: {}", e)));
                }
            }
        }

        let session = Arc::new(PeerSession::new(peer_id.clone(), transport, sink, outbound));
        match self.table.register(&reservation, session.clone()).await {
            Ok(Registered::Inserted(session)) => {
                info!("Session ready for peer {}", peer_id);
                Ok(session)
            }
            Ok(Registered::Existing(existing)) => {
                session.close().await;
                Ok(existing)
            }
            Err(e) => {
                debug!("Peer {} went away while its session was being built", peer_id);
                session.close().await;
                self.release_after_leave(&reservation, ticket).await;
                Err(e)
            }
        }
    }

    /// A leave that ran while we were acquiring must not leave capture
    /// held, unless someone acquired the stream after us.
    async fn release_after_leave(&self, reservation: &Reservation, ticket: CaptureTicket) {
        if self.table.cleared_since(reservation).await && self.capture.release_if_unclaimed(ticket).await {
            debug!("Released capture reopened by a build that outlived leave");
        }
    }
}

fn install_handlers(
    transport: &RTCPeerConnection,
    peer_id: &PeerId,
    outbound: &Arc<OutboundCandidates>,
    sink: &Arc<PlaybackSink>,
) {
    let outbound = outbound.clone();
    let candidate_peer = peer_id.clone();
    transport.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let outbound = outbound.clone();
        let peer_id = candidate_peer.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => outbound.discovered(init).await,
                Err(e) => warn!("Unserializable candidate for peer {}: {}", peer_id, e),
            }
        })
    }));

    let sink = sink.clone();
    transport.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            if !sink.attach(track) {
                trace!("Ignoring extra remote track");
            }
        })
    }));

    let state_peer = peer_id.clone();
    transport.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let peer_id = state_peer.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Failed => warn!("Connection to peer {} failed", peer_id),
                RTCPeerConnectionState::Connected => info!("Connected to peer {}", peer_id),
                other => debug!("Connection state for peer {}: {}", peer_id, other),
            }
        })
    }));
}

async fn close_quietly(transport: &RTCPeerConnection, peer_id: &PeerId) {
    if let Err(e) = transport.close().await {
        warn!("Error closing half-built transport for peer {}: {}", peer_id, e);
    }
}
