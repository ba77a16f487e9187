//! In-process voice mesh: several participants sharing one relay hub.

use anyhow::{bail, Context, Result};
use audio_io::{CpalMicrophone, MediaDevice, ToneDevice};
use log::{info, warn};
use network::RelayHub;
use room::{VoiceConfig, VoiceHandle, VoiceHandler, VoiceSnapshot};
use room_core::{AudioBuffer, MembershipEvent, Participant, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub participants: usize,
    pub duration: Duration,
    /// Capture the first participant from a real input device
    pub microphone: Option<String>,
    pub username: String,
    pub voice: VoiceConfig,
}

/// Audio received from one sender
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Level {
    pub frames: u64,
    pub last_rms: f32,
    pub peak_rms: f32,
}

impl Level {
    fn record(&mut self, buffer: &[f32]) {
        let level = rms(buffer);
        self.frames += 1;
        self.last_rms = level;
        self.peak_rms = self.peak_rms.max(level);
    }
}

/// Root mean square of a buffer; zero for an empty one
pub fn rms(buffer: &[f32]) -> f32 {
    if buffer.is_empty() {
        return 0.0;
    }
    let sum: f32 = buffer.iter().map(|s| s * s).sum();
    (sum / buffer.len() as f32).sqrt()
}

type Levels = Arc<Mutex<HashMap<PeerId, Level>>>;

struct Member {
    id: PeerId,
    name: String,
    handle: VoiceHandle,
    membership_tx: mpsc::Sender<MembershipEvent>,
    levels: Levels,
    tasks: Vec<JoinHandle<()>>,
}

/// Final state of one participant
#[derive(Debug, Clone)]
pub struct MemberReport {
    pub name: String,
    pub snapshot: VoiceSnapshot,
    pub received: BTreeMap<PeerId, Level>,
}

pub struct Mesh {
    hub: RelayHub,
    members: Vec<Member>,
    options: MeshOptions,
}

impl Mesh {
    pub async fn start(options: MeshOptions) -> Result<Self> {
        if options.participants == 0 {
            bail!("A mesh needs at least one participant");
        }

        let hub = RelayHub::new(options.voice.queue_capacity);
        let mut members = Vec::with_capacity(options.participants);
        for index in 0..options.participants {
            members.push(spawn_member(&hub, index, &options).await?);
        }

        Ok(Self { hub, members, options })
    }

    /// Bring participants into the room one at a time. Each newcomer is
    /// offered to by everyone already joined, then joins itself.
    pub async fn join_all(&self) -> Result<()> {
        for k in 0..self.members.len() {
            self.publish(k + 1).await?;

            let newcomer = &self.members[k];
            if wait_for(&newcomer.handle, |s| s.negotiated_peers() >= k).await.is_none() {
                warn!("{} did not hear from every earlier participant in time", newcomer.name);
            }

            newcomer
                .handle
                .join()
                .await
                .with_context(|| format!("{} could not join voice", newcomer.name))?;
            info!("{} joined voice", newcomer.name);
        }
        Ok(())
    }

    async fn publish(&self, present: usize) -> Result<()> {
        let list: Vec<Participant> = self.members[..present]
            .iter()
            .map(|m| Participant::online(m.id.clone(), m.name.clone()))
            .collect();
        for member in &self.members[..present] {
            member
                .membership_tx
                .send(MembershipEvent::Updated(list.clone()))
                .await
                .context("membership channel closed")?;
        }
        Ok(())
    }

    /// Let audio flow for the configured duration, logging progress
    pub async fn run(&self) -> Result<()> {
        let end = Instant::now() + self.options.duration;
        let mut exercised = false;

        while Instant::now() < end {
            sleep(REPORT_INTERVAL).await;
            for member in &self.members {
                let snapshot = member.handle.snapshot().await?;
                let levels = member.levels.lock().await;
                let heard: Vec<String> = levels
                    .iter()
                    .map(|(peer, level)| format!("{}={:.3}", peer, level.last_rms))
                    .collect();
                info!(
                    "{}: {}/{} connected, levels [{}]",
                    member.name,
                    snapshot.connected_peers(),
                    snapshot.peers.len(),
                    heard.join(", ")
                );
            }

            // Halfway through, flip the mute controls once
            if !exercised && Instant::now() + self.options.duration / 2 >= end {
                self.exercise_mutes().await?;
                exercised = true;
            }
        }
        Ok(())
    }

    async fn exercise_mutes(&self) -> Result<()> {
        let Some(first) = self.members.first() else {
            return Ok(());
        };
        let muted = first.handle.toggle_local_mute().await?;
        info!("{} local mute: {}", first.name, muted);

        if let Some(second) = self.members.get(1) {
            match second.handle.toggle_remote_mute(first.id.clone()).await {
                Ok(muted) => info!("{} muted playback of {}: {}", second.name, first.name, muted),
                Err(e) => warn!("{} could not mute {}: {}", second.name, first.name, e),
            }
        }
        Ok(())
    }

    /// Everyone leaves in turn; remaining members see each departure
    pub async fn shutdown(self) -> Result<Vec<MemberReport>> {
        let mut reports = Vec::with_capacity(self.members.len());
        for member in &self.members {
            reports.push(MemberReport {
                name: member.name.clone(),
                snapshot: member.handle.snapshot().await?,
                received: member.levels.lock().await.clone().into_iter().collect(),
            });
        }

        for (index, member) in self.members.iter().enumerate() {
            member.handle.leave().await?;
            self.hub.disconnect(&member.id).await;
            for other in &self.members[index + 1..] {
                let _ = other
                    .membership_tx
                    .send(MembershipEvent::PeerDeparted(member.id.clone()))
                    .await;
            }
            info!("{} left", member.name);
        }

        for member in self.members {
            member.handle.shutdown().await?;
            for task in member.tasks {
                if let Err(e) = task.await {
                    warn!("{} task ended abnormally: {}", member.name, e);
                }
            }
        }
        Ok(reports)
    }
}

async fn spawn_member(hub: &RelayHub, index: usize, options: &MeshOptions) -> Result<Member> {
    let name = if index == 0 {
        options.username.clone()
    } else {
        format!("guest-{}", index)
    };
    let id = PeerId::new();

    let device: Arc<dyn MediaDevice> = match (&options.microphone, index) {
        (Some(device_name), 0) => Arc::new(CpalMicrophone::new(device_name.clone())),
        _ => Arc::new(ToneDevice::new(220.0 * (index + 1) as f32)),
    };

    let capacity = options.voice.queue_capacity;
    let (relay, relay_rx) = hub.register(id.clone()).await;
    let (membership_tx, membership_rx) = mpsc::channel(capacity);
    let (audio_tx, audio_rx) = mpsc::channel(capacity);

    let (handler, handle) = VoiceHandler::new(
        id.clone(),
        &options.voice,
        device,
        Arc::new(relay),
        relay_rx,
        membership_rx,
        Some(audio_tx),
    )
    .with_context(|| format!("failed to set up {}", name))?;

    let levels: Levels = Arc::new(Mutex::new(HashMap::new()));
    let tasks = vec![
        tokio::spawn(handler.run()),
        tokio::spawn(meter(audio_rx, levels.clone())),
    ];
    info!("{} is {}", name, id);

    Ok(Member {
        id,
        name,
        handle,
        membership_tx,
        levels,
        tasks,
    })
}

async fn meter(mut audio_rx: mpsc::Receiver<(PeerId, AudioBuffer)>, levels: Levels) {
    while let Some((peer, buffer)) = audio_rx.recv().await {
        levels.lock().await.entry(peer).or_default().record(&buffer);
    }
}

async fn wait_for(handle: &VoiceHandle, check: impl Fn(&VoiceSnapshot) -> bool) -> Option<VoiceSnapshot> {
    let deadline = Instant::now() + NEGOTIATION_TIMEOUT;
    while Instant::now() < deadline {
        match handle.snapshot().await {
            Ok(snapshot) if check(&snapshot) => return Some(snapshot),
            Ok(_) => sleep(Duration::from_millis(50)).await,
            Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::TransportConfig;

    #[test]
    fn rms_of_known_signals() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 160]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn level_tracks_peak() {
        let mut level = Level::default();
        level.record(&[0.5, -0.5]);
        level.record(&[0.1, -0.1]);
        assert_eq!(level.frames, 2);
        assert!((level.last_rms - 0.1).abs() < 1e-6);
        assert!((level.peak_rms - 0.5).abs() < 1e-6);
    }

    fn options(participants: usize) -> MeshOptions {
        MeshOptions {
            participants,
            duration: Duration::from_millis(1500),
            microphone: None,
            username: "host".to_string(),
            voice: VoiceConfig {
                transport: TransportConfig::local_only(),
                queue_capacity: 64,
            },
        }
    }

    #[tokio::test]
    async fn empty_mesh_is_rejected() {
        assert!(Mesh::start(options(0)).await.is_err());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn three_member_mesh_negotiates_and_leaves() {
        let mesh = Mesh::start(options(3)).await.unwrap();
        mesh.join_all().await.unwrap();
        for member in &mesh.members {
            wait_for(&member.handle, |s| s.negotiated_peers() == 2).await.unwrap();
        }
        mesh.run().await.unwrap();

        let handles: Vec<VoiceHandle> = mesh.members.iter().map(|m| m.handle.clone()).collect();
        let reports = mesh.shutdown().await.unwrap();

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].name, "host");
        assert!(reports.iter().all(|r| r.snapshot.joined && r.snapshot.peers.len() == 2));
        // Handlers are gone after shutdown
        for handle in handles {
            assert!(handle.snapshot().await.is_err());
        }
    }
}
