use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use voice_room::audio::{AudioStream, DeviceGuard, LocalCapture, MediaBackend, Playback};
use voice_room::config::Config;
use voice_room::connection::{ConnectionStatus, SessionSnapshot};
use voice_room::error::{AppError, Result};
use voice_room::room::{Room, RoomConfig, RoomEvent, RoomHandle, Strategy};
use voice_room::session::CallSession;

#[derive(Default)]
struct RoomLog {
    added: Mutex<Vec<Option<String>>>,
    removed: Mutex<Vec<Option<String>>>,
    leaves: AtomicUsize,
}

struct FakeRoom {
    log: Arc<RoomLog>,
}

#[async_trait]
impl RoomHandle for FakeRoom {
    async fn add_stream(&self, _: &AudioStream, peer_id: Option<&str>) -> Result<()> {
        self.log.added.lock().unwrap().push(peer_id.map(str::to_string));
        Ok(())
    }

    async fn remove_stream(&self, _: &AudioStream, peer_id: Option<&str>) -> Result<()> {
        self.log.removed.lock().unwrap().push(peer_id.map(str::to_string));
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.log.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

enum Script {
    Join,
    Fail,
    Hang,
}

struct FakeStrategy {
    name: &'static str,
    script: Script,
    calls: AtomicUsize,
    rooms: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<RoomEvent>>>,
    log: Arc<RoomLog>,
}

impl FakeStrategy {
    fn new(name: &'static str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name,
            script,
            calls: AtomicUsize::new(0),
            rooms: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            log: Arc::new(RoomLog::default()),
        })
    }

    fn emit(&self, event: RoomEvent) {
        let events = self.events.lock().unwrap();
        events.as_ref().expect("room was never joined").send(event).unwrap();
    }
}

#[async_trait]
impl Strategy for FakeStrategy {
    fn name(&self) -> &str {
        self.name
    }

    async fn join_room(&self, _: &RoomConfig, room_name: &str) -> Result<Room> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rooms.lock().unwrap().push(room_name.to_string());
        match self.script {
            Script::Join => {
                let (tx, events) = mpsc::unbounded_channel();
                *self.events.lock().unwrap() = Some(tx);
                Ok(Room {
                    handle: Arc::new(FakeRoom { log: self.log.clone() }),
                    events,
                })
            }
            Script::Fail => Err(AppError::Join {
                strategy: self.name.to_string(),
                reason: "relay unreachable".to_string(),
            }),
            Script::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct FakeMedia {
    broken: AtomicBool,
    captures: Mutex<Vec<AudioStream>>,
    played: AtomicUsize,
}

#[async_trait]
impl MediaBackend for FakeMedia {
    async fn acquire_microphone(&self) -> Result<LocalCapture> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AppError::Media("permission denied".to_string()));
        }
        let stream = AudioStream::new("local", 48_000);
        self.captures.lock().unwrap().push(stream.clone());
        Ok(LocalCapture::new(stream, DeviceGuard::detached()))
    }

    async fn play(&self, _: &AudioStream) -> Result<Playback> {
        self.played.fetch_add(1, Ordering::SeqCst);
        Ok(Playback::detached())
    }
}

fn config() -> Config {
    Config {
        join_timeout_ms: 100,
        ..Config::default()
    }
}

fn session_with(config: Config, strategies: &[Arc<FakeStrategy>], media: Arc<FakeMedia>) -> CallSession {
    let strategies = strategies.iter().map(|s| s.clone() as Arc<dyn Strategy>).collect();
    CallSession::new(config, strategies, media)
}

async fn wait_for<F>(session: &CallSession, mut done: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let mut rx = session.subscribe();
    tokio::time::timeout(Duration::from_secs(2), async move {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if done(&snapshot) {
                return snapshot;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("session never reached the expected state")
}

/// Feeds `level` into `stream` every 10 ms until aborted.
fn keep_talking(stream: AudioStream, level: f32) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            stream.push(&[level; 480]);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

fn without_notification(snapshot: SessionSnapshot) -> SessionSnapshot {
    SessionSnapshot {
        notification: None,
        ..snapshot
    }
}

#[tokio::test]
async fn connect_publishes_microphone() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay.clone()], media.clone());

    session.connect("lobby").await.unwrap();

    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.room_name, "lobby");
    assert_eq!(snapshot.strategy.as_deref(), Some("relay"));
    assert!(snapshot.mic_enabled);
    assert_eq!(snapshot.notification.as_deref(), Some("Connected!"));
    assert_eq!(*relay.rooms.lock().unwrap(), vec!["lobby".to_string()]);
    assert_eq!(*relay.log.added.lock().unwrap(), vec![None]);
    assert_eq!(media.captures.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn peer_list_follows_join_and_leave() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay.clone()], media.clone());
    session.connect("lobby").await.unwrap();

    relay.emit(RoomEvent::PeerJoined("alice".into()));
    relay.emit(RoomEvent::PeerStream {
        peer_id: "alice".into(),
        stream: AudioStream::new("alice", 48_000),
    });
    relay.emit(RoomEvent::PeerJoined("bob".into()));
    relay.emit(RoomEvent::PeerLeft("alice".into()));
    relay.emit(RoomEvent::PeerStream {
        peer_id: "bob".into(),
        stream: AudioStream::new("bob", 48_000),
    });
    relay.emit(RoomEvent::PeerJoined("carol".into()));
    relay.emit(RoomEvent::PeerJoined("carol".into()));

    let snapshot = wait_for(&session, |s| s.peers == ["bob", "carol"]).await;
    assert_eq!(snapshot.notification.as_deref(), Some("carol joined"));
    assert_eq!(media.played.load(Ordering::SeqCst), 2);

    let added = relay.log.added.lock().unwrap().clone();
    assert!(added.contains(&Some("alice".to_string())));
    assert!(added.contains(&Some("bob".to_string())));
    assert_eq!(*relay.log.removed.lock().unwrap(), vec![Some("alice".to_string())]);
}

#[tokio::test]
async fn unknown_peer_leaving_changes_nothing() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let session = session_with(config(), &[relay.clone()], Arc::new(FakeMedia::default()));
    session.connect("lobby").await.unwrap();

    relay.emit(RoomEvent::PeerLeft("ghost".into()));
    relay.emit(RoomEvent::PeerJoined("alice".into()));

    let snapshot = wait_for(&session, |s| s.peers == ["alice"]).await;
    assert_eq!(snapshot.notification.as_deref(), Some("alice joined"));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay.clone()], media.clone());

    session.disconnect().await.unwrap();
    assert_eq!(session.snapshot(), SessionSnapshot::default());

    session.connect("lobby").await.unwrap();
    relay.emit(RoomEvent::PeerJoined("alice".into()));
    wait_for(&session, |s| s.peers.len() == 1).await;

    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();

    let snapshot = session.snapshot();
    assert_eq!(snapshot.notification.as_deref(), Some("Disconnected"));
    assert_eq!(without_notification(snapshot), SessionSnapshot::default());
    assert_eq!(relay.log.leaves.load(Ordering::SeqCst), 1);
    assert!(!session.is_active().await);

    let captures = media.captures.lock().unwrap();
    assert_eq!(captures.len(), 1);
    assert!(!captures[0].is_live());
}

#[tokio::test]
async fn session_can_be_reopened() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay.clone()], media.clone());

    session.connect("first").await.unwrap();
    session.disconnect().await.unwrap();
    session.connect("second").await.unwrap();

    assert_eq!(session.snapshot().room_name, "second");
    assert_eq!(media.captures.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn blank_room_name_is_generated() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let session = session_with(config(), &[relay.clone()], Arc::new(FakeMedia::default()));

    session.connect("   ").await.unwrap();

    let rooms = relay.rooms.lock().unwrap().clone();
    assert_eq!(rooms.len(), 1);
    assert!(rooms[0].starts_with("room-"));
    assert_eq!(session.snapshot().room_name, rooms[0]);
}

#[tokio::test]
async fn blank_room_name_uses_configured_default() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let config = Config {
        default_room: Some("standup".to_string()),
        ..config()
    };
    let session = session_with(config, &[relay.clone()], Arc::new(FakeMedia::default()));

    session.connect("").await.unwrap();
    assert_eq!(*relay.rooms.lock().unwrap(), vec!["standup".to_string()]);
}

#[tokio::test]
async fn timed_out_strategy_falls_through() {
    let slow = FakeStrategy::new("slow", Script::Hang);
    let backup = FakeStrategy::new("backup", Script::Join);
    let spare = FakeStrategy::new("spare", Script::Join);
    let session = session_with(
        config(),
        &[slow.clone(), backup.clone(), spare.clone()],
        Arc::new(FakeMedia::default()),
    );

    session.connect("lobby").await.unwrap();

    assert_eq!(session.snapshot().strategy.as_deref(), Some("backup"));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
    assert_eq!(spare.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn all_strategies_failing_reverts_status() {
    let first = FakeStrategy::new("first", Script::Fail);
    let second = FakeStrategy::new("second", Script::Fail);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[first, second], media.clone());

    let err = session.connect("lobby").await.unwrap_err();
    assert!(matches!(err, AppError::AllStrategiesFailed));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::NotConnected);
    assert_eq!(snapshot.notification.as_deref(), Some("All connection strategies failed"));
    assert!(media.captures.lock().unwrap().is_empty());
    assert!(!session.is_active().await);
}

#[tokio::test]
async fn microphone_failure_leaves_the_room() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    media.broken.store(true, Ordering::SeqCst);
    let session = session_with(config(), &[relay.clone()], media);

    let err = session.connect("lobby").await.unwrap_err();
    assert!(matches!(err, AppError::Media(_)));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::NotConnected);
    assert!(snapshot
        .notification
        .as_deref()
        .unwrap_or_default()
        .starts_with("Microphone unavailable"));
    assert_eq!(relay.log.leaves.load(Ordering::SeqCst), 1);
    assert!(!session.is_active().await);
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let session = session_with(config(), &[relay.clone()], Arc::new(FakeMedia::default()));

    session.connect("lobby").await.unwrap();
    let err = session.connect("elsewhere").await.unwrap_err();

    assert!(matches!(err, AppError::AlreadyActive));
    assert_eq!(relay.calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.snapshot().room_name, "lobby");
}

#[tokio::test]
async fn mute_round_trip() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay], media.clone());
    session.connect("lobby").await.unwrap();
    let local = media.captures.lock().unwrap()[0].clone();

    assert!(!session.toggle_mute().await);
    assert!(!local.is_enabled());
    assert!(!session.snapshot().mic_enabled);

    assert!(session.toggle_mute().await);
    assert!(local.is_enabled());
    assert!(session.snapshot().mic_enabled);
}

#[tokio::test]
async fn push_to_talk_starts_muted() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let config = Config {
        push_to_talk: true,
        ..config()
    };
    let session = session_with(config, &[relay], media.clone());
    session.connect("lobby").await.unwrap();
    let local = media.captures.lock().unwrap()[0].clone();

    assert!(!session.snapshot().mic_enabled);
    assert!(!local.is_enabled());

    assert!(session.set_mic_enabled(true).await);
    assert!(local.is_enabled());
    assert!(!session.set_mic_enabled(false).await);
    assert!(!local.is_enabled());
}

#[tokio::test]
async fn mute_without_session_does_nothing() {
    let session = session_with(config(), &[], Arc::new(FakeMedia::default()));
    assert!(!session.toggle_mute().await);
    assert_eq!(session.snapshot(), SessionSnapshot::default());
}

#[tokio::test(start_paused = true)]
async fn late_stream_from_departed_peer_is_dropped() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay.clone()], media.clone());
    session.connect("lobby").await.unwrap();

    let late = AudioStream::new("alice", 48_000);
    let talker = keep_talking(late.clone(), 0.5);
    relay.emit(RoomEvent::PeerJoined("alice".into()));
    relay.emit(RoomEvent::PeerLeft("alice".into()));
    relay.emit(RoomEvent::PeerStream {
        peer_id: "alice".into(),
        stream: late,
    });
    relay.emit(RoomEvent::PeerJoined("bob".into()));
    wait_for(&session, |s| s.peers == ["bob"]).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = session.snapshot();
    assert_eq!(snapshot.peers, ["bob"]);
    assert!(!snapshot.peers_talking);
    assert_eq!(media.played.load(Ordering::SeqCst), 0);
    talker.abort();

    // Joining again lifts the block.
    let fresh = AudioStream::new("alice", 48_000);
    let talker = keep_talking(fresh.clone(), 0.5);
    relay.emit(RoomEvent::PeerJoined("alice".into()));
    relay.emit(RoomEvent::PeerStream {
        peer_id: "alice".into(),
        stream: fresh,
    });
    wait_for(&session, |s| s.peers_talking && s.peers == ["bob", "alice"]).await;
    assert_eq!(media.played.load(Ordering::SeqCst), 1);
    talker.abort();
}

#[tokio::test(start_paused = true)]
async fn stream_before_join_is_kept() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay.clone()], media.clone());
    session.connect("lobby").await.unwrap();

    let early = AudioStream::new("carol", 48_000);
    let talker = keep_talking(early.clone(), 0.5);
    relay.emit(RoomEvent::PeerStream {
        peer_id: "carol".into(),
        stream: early,
    });
    relay.emit(RoomEvent::PeerJoined("dave".into()));

    let snapshot = wait_for(&session, |s| s.peers == ["dave"]).await;
    assert!(!snapshot.peers.contains(&"carol".to_string()));
    assert_eq!(media.played.load(Ordering::SeqCst), 1);

    relay.emit(RoomEvent::PeerJoined("carol".into()));
    wait_for(&session, |s| s.peers == ["dave", "carol"] && s.peers_talking).await;

    relay.emit(RoomEvent::PeerLeft("carol".into()));
    wait_for(&session, |s| s.peers == ["dave"] && !s.peers_talking).await;
    talker.abort();
}

#[tokio::test(start_paused = true)]
async fn loud_peer_leaving_clears_indicator() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay.clone()], media.clone());
    session.connect("lobby").await.unwrap();

    let voice = AudioStream::new("erin", 48_000);
    let talker = keep_talking(voice.clone(), 0.5);
    relay.emit(RoomEvent::PeerJoined("erin".into()));
    relay.emit(RoomEvent::PeerStream {
        peer_id: "erin".into(),
        stream: voice,
    });
    wait_for(&session, |s| s.peers_talking).await;

    relay.emit(RoomEvent::PeerLeft("erin".into()));
    let snapshot = wait_for(&session, |s| !s.peers_talking).await;
    assert!(snapshot.peers.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!session.snapshot().peers_talking);
    talker.abort();
}

#[tokio::test]
async fn room_closing_ends_the_session() {
    let relay = FakeStrategy::new("relay", Script::Join);
    let media = Arc::new(FakeMedia::default());
    let session = session_with(config(), &[relay.clone()], media.clone());
    session.connect("lobby").await.unwrap();
    relay.emit(RoomEvent::PeerJoined("alice".into()));
    wait_for(&session, |s| s.peers.len() == 1).await;

    relay.emit(RoomEvent::Closed {
        reason: "relay connection lost".into(),
    });
    let snapshot = wait_for(&session, |s| {
        s.status == ConnectionStatus::NotConnected && s.notification.as_deref() == Some("Connection lost")
    })
    .await;

    assert!(snapshot.peers.is_empty());
    assert!(!session.is_active().await);
    assert!(!media.captures.lock().unwrap()[0].is_live());
    assert_eq!(relay.log.leaves.load(Ordering::SeqCst), 1);
    assert!(!session.toggle_mute().await);

    // A new session can start straight away; the lost one is not left twice.
    session.connect("lobby").await.unwrap();
    assert_eq!(session.snapshot().status, ConnectionStatus::Connected);
    assert_eq!(relay.log.leaves.load(Ordering::SeqCst), 1);
    assert_eq!(media.captures.lock().unwrap().len(), 2);

    session.disconnect().await.unwrap();
    assert_eq!(relay.log.leaves.load(Ordering::SeqCst), 2);
}
