use crate::commands::{VoiceCommand, VoiceHandle};
use crate::controller::SessionController;
use crate::reactor::MembershipReactor;
use crate::state::{LocalSessionState, SharedSessionState};
use audio_io::{CaptureManager, MediaDevice};
use log::{debug, info, trace, warn};
use network::{
    ConnectionTable, InboundEvent, SessionBuilder, SignalRelay, SignalSender, SignalingDispatcher, TransportConfig,
};
use room_core::{AudioBuffer, Error, MembershipEvent, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Settings for one participant's voice handler
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// ICE servers and candidate gathering for every peer connection
    pub transport: TransportConfig,
    /// Capacity of the command channel
    pub queue_capacity: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            queue_capacity: 100,
        }
    }
}

/// Work for one remote peer, processed in arrival order
enum LaneTask {
    Relay(InboundEvent),
    Initiate,
    Departed,
}

/// Event loop for one participant's voice session.
///
/// Local commands, membership ticks and relay events arrive on one loop.
/// Everything about a given remote peer runs on that peer's lane, so a slow
/// negotiation with one peer never holds up another.
pub struct VoiceHandler {
    /// Our peer ID
    local_id: PeerId,
    /// Join, leave and mute controls
    controller: Arc<SessionController>,
    /// Turns membership changes into offers and teardowns
    reactor: Arc<MembershipReactor>,
    /// Applies inbound offers, answers and candidates
    dispatcher: Arc<SignalingDispatcher>,
    /// Live sessions, consulted when pruning idle lanes
    table: ConnectionTable,
    /// Channel for receiving commands
    command_rx: mpsc::Receiver<VoiceCommand>,
    /// Membership updates from the room service
    membership_rx: mpsc::Receiver<MembershipEvent>,
    /// Frames from the message relay
    relay_rx: mpsc::Receiver<InboundEvent>,
    /// One work queue per remote peer
    lanes: HashMap<PeerId, Lane>,
    /// Closed lanes still finishing their queued work
    retiring: HashMap<PeerId, JoinHandle<()>>,
}

impl VoiceHandler {
    pub fn new(
        local_id: PeerId,
        config: &VoiceConfig,
        device: Arc<dyn MediaDevice>,
        relay: Arc<dyn SignalRelay>,
        relay_rx: mpsc::Receiver<InboundEvent>,
        membership_rx: mpsc::Receiver<MembershipEvent>,
        audio_out: Option<mpsc::Sender<(PeerId, AudioBuffer)>>,
    ) -> Result<(Self, VoiceHandle), Error> {
        let state: SharedSessionState = Arc::new(RwLock::new(LocalSessionState::default()));
        let capture = Arc::new(CaptureManager::new(device));
        let table = ConnectionTable::new();
        let signals = SignalSender::new(relay);

        let builder = Arc::new(SessionBuilder::new(
            &config.transport,
            capture.clone(),
            table.clone(),
            signals.clone(),
            audio_out,
        )?);
        let controller = Arc::new(SessionController::new(state.clone(), capture, table.clone()));
        let reactor = Arc::new(MembershipReactor::new(local_id.clone(), state, builder.clone()));
        let dispatcher = Arc::new(SignalingDispatcher::new(builder, table.clone(), signals));

        let (command_tx, command_rx) = mpsc::channel(config.queue_capacity);
        let handler = Self {
            local_id,
            controller,
            reactor,
            dispatcher,
            table,
            command_rx,
            membership_rx,
            relay_rx,
            lanes: HashMap::new(),
            retiring: HashMap::new(),
        };
        Ok((handler, VoiceHandle::new(command_tx)))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn controller(&self) -> Arc<SessionController> {
        self.controller.clone()
    }

    /// Run until shut down or every input closes. Leaves voice on exit.
    pub async fn run(mut self) {
        info!("Voice handler for {} started", self.local_id);
        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    if let VoiceCommand::Shutdown = command {
                        info!("Received shutdown command, exiting voice handler");
                        break;
                    }
                    self.handle_command(command).await;
                }

                Some(event) = self.membership_rx.recv() => {
                    self.handle_membership(event).await;
                }

                Some(event) = self.relay_rx.recv() => {
                    self.handle_relay(event);
                }

                else => break,
            }
        }

        self.controller.leave().await;
        self.lanes.clear();
        self.retiring.clear();
        info!("Voice handler for {} stopped", self.local_id);
    }

    async fn handle_command(&mut self, command: VoiceCommand) {
        match command {
            VoiceCommand::Join { reply } => {
                let _ = reply.send(self.controller.join().await);
            }
            VoiceCommand::Leave { reply } => {
                self.controller.leave().await;
                let _ = reply.send(());
            }
            VoiceCommand::ToggleLocalMute { reply } => {
                let _ = reply.send(self.controller.toggle_local_mute().await);
            }
            VoiceCommand::ToggleRemoteMute { peer_id, reply } => {
                let _ = reply.send(self.controller.toggle_remote_mute(&peer_id).await);
            }
            VoiceCommand::Snapshot { reply } => {
                let _ = reply.send(self.controller.snapshot().await);
            }
            // Handled in run
            VoiceCommand::Shutdown => {}
        }
    }

    async fn handle_membership(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::Updated(participants) => {
                self.prune_lanes().await;
                let peers = self.reactor.peers_to_initiate(&participants).await;
                if !peers.is_empty() {
                    debug!("Membership tick: offering to {} new peer(s)", peers.len());
                }
                for peer_id in peers {
                    self.enqueue(peer_id, LaneTask::Initiate);
                }
            }
            MembershipEvent::PeerDeparted(peer_id) => {
                self.enqueue(peer_id.clone(), LaneTask::Departed);
                self.close_lane(&peer_id);
            }
        }
    }

    fn handle_relay(&mut self, event: InboundEvent) {
        let peer_id = match &event {
            InboundEvent::Signal { sender, .. } => sender.clone(),
            InboundEvent::PeerDisconnected(peer_id) => peer_id.clone(),
        };
        if peer_id == self.local_id {
            warn!("Ignoring relay event about ourselves");
            return;
        }
        let departed = matches!(event, InboundEvent::PeerDisconnected(_));
        self.enqueue(peer_id.clone(), LaneTask::Relay(event));
        if departed {
            self.close_lane(&peer_id);
        }
    }

    fn enqueue(&mut self, peer_id: PeerId, task: LaneTask) {
        if !self.lanes.contains_key(&peer_id) {
            let lane = self.spawn_lane(&peer_id);
            self.lanes.insert(peer_id.clone(), lane);
        }
        let Some(lane) = self.lanes.get(&peer_id) else {
            return;
        };

        if let Err(task) = lane.send(task) {
            // The lane task is gone; start a fresh one
            warn!("Lane for peer {} stopped, restarting", peer_id);
            let lane = self.spawn_lane(&peer_id);
            let _ = lane.send(task);
            self.lanes.insert(peer_id, lane);
        }
    }

    /// A new lane for `peer_id` starts only after its retired lane finished
    fn spawn_lane(&mut self, peer_id: &PeerId) -> Lane {
        let previous = self.retiring.remove(peer_id);
        Lane::spawn(peer_id.clone(), self.dispatcher.clone(), self.reactor.clone(), previous)
    }

    /// Drop our end of a lane; it finishes queued work and exits
    fn close_lane(&mut self, peer_id: &PeerId) {
        self.retiring.retain(|_, task| !task.is_finished());
        if let Some(lane) = self.lanes.remove(peer_id) {
            trace!("Closing lane for peer {}", peer_id);
            self.retiring.insert(peer_id.clone(), lane.task);
        }
    }

    /// Close lanes with no queued work whose peer has no session
    async fn prune_lanes(&mut self) {
        let mut unused = Vec::new();
        for (peer_id, lane) in &self.lanes {
            if lane.is_idle() && !self.table.contains(peer_id).await {
                unused.push(peer_id.clone());
            }
        }
        for peer_id in unused {
            self.close_lane(&peer_id);
        }
        self.retiring.retain(|_, task| !task.is_finished());
    }
}

/// Serial work queue for one remote peer
struct Lane {
    tx: mpsc::UnboundedSender<LaneTask>,
    /// Tasks sent but not yet finished
    pending: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Lane {
    fn spawn(
        peer_id: PeerId,
        dispatcher: Arc<SignalingDispatcher>,
        reactor: Arc<MembershipReactor>,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        trace!("Opening lane for peer {}", peer_id);

        let remaining = pending.clone();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            while let Some(task) = rx.recv().await {
                match task {
                    LaneTask::Relay(event) => dispatcher.dispatch(event).await,
                    LaneTask::Initiate => {
                        if let Err(e) = reactor.initiate(&peer_id).await {
                            MembershipReactor::log_failure(&peer_id, &e);
                        }
                    }
                    LaneTask::Departed => reactor.on_peer_departed(&peer_id).await,
                }
                remaining.fetch_sub(1, Ordering::SeqCst);
            }
            trace!("Lane for peer {} closed", peer_id);
        });

        Self { tx, pending, task }
    }

    fn send(&self, task: LaneTask) -> Result<(), LaneTask> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(task).map_err(|mpsc::error::SendError(task)| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            task
        })
    }

    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_io::MockMediaDevice;
    use network::{RelayHub, Signal, TransportConfig};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

    async fn handler() -> VoiceHandler {
        let hub = RelayHub::new(8);
        let (relay, relay_rx) = hub.register(PeerId::from("me")).await;
        let (_membership_tx, membership_rx) = mpsc::channel(8);
        let config = VoiceConfig {
            transport: TransportConfig::local_only(),
            queue_capacity: 8,
        };
        let (handler, _handle) = VoiceHandler::new(
            PeerId::from("me"),
            &config,
            Arc::new(MockMediaDevice::new()),
            Arc::new(relay),
            relay_rx,
            membership_rx,
            None,
        )
        .unwrap();
        handler
    }

    async fn wait_until_retired(handler: &mut VoiceHandler) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.retiring.values().any(|task| !task.is_finished()) {
            assert!(Instant::now() < deadline, "lanes did not finish");
            sleep(Duration::from_millis(10)).await;
        }
        handler.prune_lanes().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_departures_close_lanes() {
        let mut handler = handler().await;

        for i in 0..200 {
            handler.handle_relay(InboundEvent::PeerDisconnected(PeerId::from(format!("relay-{}", i))));
            handler
                .handle_membership(MembershipEvent::PeerDeparted(PeerId::from(format!("room-{}", i))))
                .await;
        }
        assert!(handler.lanes.is_empty());

        wait_until_retired(&mut handler).await;
        assert!(handler.retiring.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_stray_frame_lane_is_pruned_on_tick() {
        let mut handler = handler().await;
        let ghost = PeerId::from("ghost");

        handler.handle_relay(InboundEvent::Signal {
            sender: ghost.clone(),
            signal: Signal::IceCandidate(RTCIceCandidateInit::default()),
        });
        assert_eq!(handler.lanes.len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !handler.lanes[&ghost].is_idle() {
            assert!(Instant::now() < deadline, "lane never drained");
            sleep(Duration::from_millis(10)).await;
        }

        handler.handle_membership(MembershipEvent::Updated(Vec::new())).await;
        assert!(handler.lanes.is_empty());
        wait_until_retired(&mut handler).await;
        assert!(handler.retiring.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_events_after_departure_reopen_a_lane() {
        let mut handler = handler().await;
        let bob = PeerId::from("bob");

        handler.handle_membership(MembershipEvent::PeerDeparted(bob.clone())).await;
        assert!(!handler.lanes.contains_key(&bob));

        handler.handle_relay(InboundEvent::Signal {
            sender: bob.clone(),
            signal: Signal::IceCandidate(RTCIceCandidateInit::default()),
        });
        assert!(handler.lanes.contains_key(&bob));
        // The retired lane is handed to its successor
        assert!(!handler.retiring.contains_key(&bob));
    }
}
