use audio_io::{MediaDevice, MockMediaDevice, ToneDevice};
use network::{RelayHub, TransportConfig};
use room::{VoiceConfig, VoiceHandle, VoiceHandler, VoiceSnapshot};
use room_core::{Error, MembershipEvent, Participant, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

struct Member {
    id: PeerId,
    handle: VoiceHandle,
    membership_tx: mpsc::Sender<MembershipEvent>,
    task: JoinHandle<()>,
}

fn config() -> VoiceConfig {
    VoiceConfig {
        transport: TransportConfig::local_only(),
        queue_capacity: 64,
    }
}

async fn spawn_member(hub: &RelayHub, name: &str, device: Arc<dyn MediaDevice>) -> Member {
    let id = PeerId::from(name);
    let (relay, relay_rx) = hub.register(id.clone()).await;
    let (membership_tx, membership_rx) = mpsc::channel(16);
    let (handler, handle) =
        VoiceHandler::new(id.clone(), &config(), device, Arc::new(relay), relay_rx, membership_rx, None).unwrap();
    let task = tokio::spawn(handler.run());
    Member {
        id,
        handle,
        membership_tx,
        task,
    }
}

async fn tone_member(hub: &RelayHub, name: &str) -> Member {
    spawn_member(hub, name, Arc::new(ToneDevice::new(440.0))).await
}

async fn publish(members: &[&Member]) {
    let list: Vec<Participant> = members
        .iter()
        .map(|m| Participant::online(m.id.clone(), m.id.as_str()))
        .collect();
    for member in members {
        member
            .membership_tx
            .send(MembershipEvent::Updated(list.clone()))
            .await
            .unwrap();
    }
}

async fn wait_for(handle: &VoiceHandle, what: &str, check: impl Fn(&VoiceSnapshot) -> bool) -> VoiceSnapshot {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = handle.snapshot().await.unwrap();
        if check(&snapshot) {
            return snapshot;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}: {:?}", what, snapshot);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_offer_answer_and_departure() {
    let hub = RelayHub::new(64);
    let alice = tone_member(&hub, "alice").await;
    let bob = tone_member(&hub, "bob").await;

    alice.handle.join().await.unwrap();
    publish(&[&alice, &bob]).await;

    let a = wait_for(&alice.handle, "alice negotiated", |s| s.negotiated_peers() == 1).await;
    assert!(a.peers.contains_key(&bob.id));
    let b = wait_for(&bob.handle, "bob negotiated", |s| s.negotiated_peers() == 1).await;
    assert!(b.peers.contains_key(&alice.id));
    // Bob answered without joining
    assert!(!b.joined);

    alice.handle.leave().await.unwrap();
    let a = alice.handle.snapshot().await.unwrap();
    assert!(!a.joined);
    assert!(a.peers.is_empty());

    hub.disconnect(&alice.id).await;
    wait_for(&bob.handle, "bob teardown", |s| s.peers.is_empty()).await;

    for member in [alice, bob] {
        member.handle.shutdown().await.unwrap();
        member.task.await.unwrap();
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_staggered_joins_form_full_mesh() {
    let hub = RelayHub::new(64);
    let members = vec![
        tone_member(&hub, "m0").await,
        tone_member(&hub, "m1").await,
        tone_member(&hub, "m2").await,
    ];

    for k in 0..members.len() {
        let present: Vec<&Member> = members[..=k].iter().collect();
        publish(&present).await;
        // Existing members offer to the newcomer before it opts in
        wait_for(&members[k].handle, "offers to newcomer", |s| s.negotiated_peers() == k).await;
        members[k].handle.join().await.unwrap();
    }

    for member in &members {
        let snapshot = wait_for(&member.handle, "full mesh", |s| s.negotiated_peers() == 2).await;
        assert!(snapshot.joined);
        assert!(!snapshot.peers.contains_key(&member.id));
    }

    for member in members {
        member.handle.shutdown().await.unwrap();
        member.task.await.unwrap();
    }
}

// Both sides are joined when they first see each other, so both offer and
// each rejects the other's offer while holding its own. Only the one
// session per peer is checked here; no voice flows in this case.
#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_simultaneous_discovery_keeps_one_session_per_peer() {
    let hub = RelayHub::new(64);
    let alice = tone_member(&hub, "alice").await;
    let bob = tone_member(&hub, "bob").await;

    alice.handle.join().await.unwrap();
    bob.handle.join().await.unwrap();
    publish(&[&alice, &bob]).await;
    publish(&[&alice, &bob]).await;

    let a = wait_for(&alice.handle, "alice session", |s| !s.peers.is_empty()).await;
    let b = wait_for(&bob.handle, "bob session", |s| !s.peers.is_empty()).await;
    sleep(Duration::from_millis(500)).await;

    for (snapshot, other) in [(a, &bob.id), (b, &alice.id)] {
        assert_eq!(snapshot.peers.len(), 1);
        assert!(snapshot.peers.contains_key(other));
    }
    for handle in [&alice.handle, &bob.handle] {
        assert!(handle.snapshot().await.unwrap().peers.len() <= 1);
    }

    for member in [alice, bob] {
        member.handle.shutdown().await.unwrap();
        member.task.await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_join_denied_keeps_state() {
    let hub = RelayHub::new(16);
    let mut device = MockMediaDevice::new();
    device
        .expect_acquire()
        .returning(|_| Err(Error::CaptureDenied("blocked by user".to_string())));
    let member = spawn_member(&hub, "alice", Arc::new(device)).await;

    let result = member.handle.join().await;
    assert!(matches!(result, Err(Error::CaptureDenied(_))));
    assert!(!member.handle.snapshot().await.unwrap().joined);

    // Membership ticks while not joined initiate nothing
    publish(&[&member]).await;
    member
        .membership_tx
        .send(MembershipEvent::Updated(vec![
            Participant::online(member.id.clone(), "alice"),
            Participant::online(PeerId::from("bob"), "bob"),
        ]))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(member.handle.snapshot().await.unwrap().peers.is_empty());

    member.handle.shutdown().await.unwrap();
    member.task.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_leave_twice_and_local_mute() {
    let hub = RelayHub::new(16);
    let member = tone_member(&hub, "alice").await;

    assert!(!member.handle.toggle_local_mute().await.unwrap());
    member.handle.join().await.unwrap();
    assert!(member.handle.toggle_local_mute().await.unwrap());
    assert!(member.handle.snapshot().await.unwrap().local_muted);

    member.handle.leave().await.unwrap();
    member.handle.leave().await.unwrap();
    let snapshot = member.handle.snapshot().await.unwrap();
    assert!(!snapshot.joined && !snapshot.local_muted);

    let missing = member.handle.toggle_remote_mute(PeerId::from("bob")).await;
    assert!(matches!(missing, Err(Error::NotFound(_))));

    member.handle.shutdown().await.unwrap();
    member.task.await.unwrap();
    assert!(member.handle.snapshot().await.is_err());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_remote_mute_toggles_playback_only() {
    let hub = RelayHub::new(64);
    let alice = tone_member(&hub, "alice").await;
    let bob = tone_member(&hub, "bob").await;

    alice.handle.join().await.unwrap();
    publish(&[&alice, &bob]).await;
    wait_for(&bob.handle, "bob negotiated", |s| s.negotiated_peers() == 1).await;

    assert!(bob.handle.toggle_remote_mute(alice.id.clone()).await.unwrap());
    let b = bob.handle.snapshot().await.unwrap();
    assert!(b.peers[&alice.id].muted);

    // Alice's view of bob is unaffected
    let a = alice.handle.snapshot().await.unwrap();
    assert!(!a.peers[&bob.id].muted);

    assert!(!bob.handle.toggle_remote_mute(alice.id.clone()).await.unwrap());

    for member in [alice, bob] {
        member.handle.shutdown().await.unwrap();
        member.task.await.unwrap();
    }
}
