use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::activity::{ActivityMonitor, ActivitySettings};
use crate::audio::{AudioStream, CpalBackend, LocalCapture, MediaBackend, Playback};
use crate::config::Config;
use crate::connection::{ConnectionStatus, SessionMonitor, SessionSnapshot};
use crate::error::{AppError, Result};
use crate::notification::Notifier;
use crate::room::fallback::join_with_fallback;
use crate::room::relay::RelayStrategy;
use crate::room::{random_id, PeerId, RoomConfig, RoomEvent, RoomHandle, Strategy};

/// Room to join for a user-typed name. Blank input falls back to the configured
/// default room, then to a generated name.
pub fn resolve_room_name(input: &str, default_room: Option<&str>) -> String {
    let trimmed = input.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    match default_room.map(str::trim) {
        Some(room) if !room.is_empty() => room.to_string(),
        _ => format!("room-{}", random_id(6)),
    }
}

#[derive(Default)]
struct PeerRecord {
    /// `PeerJoined` has been seen; streams may arrive first.
    announced: bool,
    playback: Option<Playback>,
}

#[derive(Default)]
struct Roster {
    records: HashMap<PeerId, PeerRecord>,
    /// Peers whose leave was seen. Late streams from them are dropped until
    /// they join again.
    departed: HashSet<PeerId>,
}

/// State shared between the session and its event pump.
struct CallContext {
    room: Arc<dyn RoomHandle>,
    local: AudioStream,
    media: Arc<dyn MediaBackend>,
    monitor: SessionMonitor,
    notifier: Notifier,
    roster: StdMutex<Roster>,
    activity: StdMutex<Option<ActivityMonitor>>,
    capture: StdMutex<Option<LocalCapture>>,
    closed: AtomicBool,
}

struct ActiveCall {
    context: Arc<CallContext>,
    pump: JoinHandle<()>,
}

impl ActiveCall {
    fn is_live(&self) -> bool {
        !self.context.is_closed()
    }
}

/// Drives one voice-chat session at a time.
pub struct CallSession {
    config: Arc<Config>,
    strategies: Vec<Arc<dyn Strategy>>,
    media: Arc<dyn MediaBackend>,
    monitor: SessionMonitor,
    notifier: Notifier,
    active: Mutex<Option<ActiveCall>>,
}

impl CallSession {
    pub fn new(config: Config, strategies: Vec<Arc<dyn Strategy>>, media: Arc<dyn MediaBackend>) -> Self {
        let monitor = SessionMonitor::new();
        let notifier = Notifier::new(monitor.clone(), config.notification_ttl());
        Self {
            config: Arc::new(config),
            strategies,
            media,
            monitor,
            notifier,
            active: Mutex::new(None),
        }
    }

    /// Relay strategies from the config and the host's audio devices.
    pub fn from_config(config: Config) -> Self {
        let strategies = config
            .strategies
            .iter()
            .map(|s| Arc::new(RelayStrategy::new(s, &config.ice_servers)) as Arc<dyn Strategy>)
            .collect();
        Self::new(config, strategies, Arc::new(CpalBackend))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.monitor.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.monitor.snapshot()
    }

    pub async fn connect(&self, room_input: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.as_ref().map_or(false, ActiveCall::is_live) {
            return Err(AppError::AlreadyActive);
        }
        // A call whose room went away is cleaned up before the next one starts.
        if let Some(stale) = active.take() {
            stale.pump.abort();
            stale.context.shut_down().await;
        }

        let room_name = resolve_room_name(room_input, self.config.default_room.as_deref());
        self.monitor.set_room(&room_name, None);
        self.monitor.update_status(ConnectionStatus::Connecting);
        self.notifier.hold("Connecting...");

        let room_config = RoomConfig {
            app_id: self.config.app_id.clone(),
        };
        let notifier = self.notifier.clone();
        let joined = match join_with_fallback(
            &self.strategies,
            &room_config,
            &room_name,
            self.config.join_timeout(),
            |name, err| notifier.hold(format!("{} connection failed: {}", name, err)),
        )
        .await
        {
            Ok(joined) => joined,
            Err(e) => {
                self.monitor.reset();
                self.notifier.hold(e.to_string());
                return Err(e);
            }
        };
        let room = joined.room.handle;

        let capture = match self.media.acquire_microphone().await {
            Ok(capture) => capture,
            Err(e) => {
                tracing::error!("microphone unavailable: {}", e);
                if let Err(leave_err) = room.leave().await {
                    tracing::warn!("leaving {} failed: {}", room_name, leave_err);
                }
                self.monitor.reset();
                self.notifier.hold(format!("Microphone unavailable: {}", e));
                return Err(e);
            }
        };

        let local = capture.stream().clone();
        local.set_enabled(!self.config.push_to_talk);
        if let Err(e) = room.add_stream(&local, None).await {
            tracing::warn!("publishing local audio failed: {}", e);
        }

        let settings = ActivitySettings {
            poll: self.config.activity_poll(),
            threshold: self.config.activity_threshold,
            window: self.config.activity_window,
        };
        let activity = ActivityMonitor::start(&local, settings, self.monitor.clone());

        let context = Arc::new(CallContext {
            room,
            local: local.clone(),
            media: self.media.clone(),
            monitor: self.monitor.clone(),
            notifier: self.notifier.clone(),
            roster: StdMutex::new(Roster::default()),
            activity: StdMutex::new(Some(activity)),
            capture: StdMutex::new(Some(capture)),
            closed: AtomicBool::new(false),
        });
        let pump = tokio::spawn(pump_events(context.clone(), joined.room.events));

        self.monitor.set_room(&room_name, Some(&joined.strategy));
        self.monitor.set_mic_enabled(local.is_enabled());
        self.monitor.update_status(ConnectionStatus::Connected);
        self.notifier.notify("Connected!");
        tracing::info!("connected to {} via {}", room_name, joined.strategy);

        *active = Some(ActiveCall { context, pump });
        Ok(())
    }

    /// Leaves the room and releases every resource of the session. Calling it
    /// without a session is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(call) = self.active.lock().await.take() else {
            return Ok(());
        };

        call.pump.abort();
        let was_live = call.context.shut_down().await;
        self.monitor.reset();
        if was_live {
            self.notifier.notify("Disconnected");
            tracing::info!("disconnected");
        }
        Ok(())
    }

    /// Flips the local track's enabled flag and returns the new value.
    pub async fn toggle_mute(&self) -> bool {
        let active = self.active.lock().await;
        match active.as_ref().filter(|call| call.is_live()) {
            Some(call) => {
                let enabled = !call.context.local.is_enabled();
                call.context.set_mic_enabled(enabled);
                enabled
            }
            None => self.monitor.snapshot().mic_enabled,
        }
    }

    /// Enables or mutes the local track. Returns the resulting flag, which
    /// stays false while no session is active.
    pub async fn set_mic_enabled(&self, enabled: bool) -> bool {
        let active = self.active.lock().await;
        match active.as_ref().filter(|call| call.is_live()) {
            Some(call) => {
                call.context.set_mic_enabled(enabled);
                enabled
            }
            None => self.monitor.snapshot().mic_enabled,
        }
    }

    /// Shows a transient notification.
    pub fn notify(&self, text: impl Into<String>) {
        self.notifier.notify(text);
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.as_ref().map_or(false, ActiveCall::is_live)
    }
}

async fn pump_events(context: Arc<CallContext>, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
    let reason = loop {
        match events.recv().await {
            Some(RoomEvent::Closed { reason }) => break reason,
            Some(event) => context.handle(event).await,
            None => break "room event stream ended".to_string(),
        }
    };
    if context.shut_down().await {
        tracing::warn!("lost the room: {}", reason);
        context.monitor.reset();
        context.notifier.hold("Connection lost");
    }
}

impl CallContext {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_mic_enabled(&self, enabled: bool) {
        self.local.set_enabled(enabled);
        self.monitor.set_mic_enabled(enabled);
    }

    /// Releases the call's devices, analyzers and room. Only the first caller
    /// does the work and gets `true`.
    async fn shut_down(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let activity = self.activity.lock().ok().and_then(|mut a| a.take());
        if let Some(activity) = activity {
            activity.shutdown();
        }
        if let Ok(mut roster) = self.roster.lock() {
            roster.records.clear();
            roster.departed.clear();
        }
        let capture = self.capture.lock().ok().and_then(|mut c| c.take());
        if let Some(capture) = capture {
            capture.stop();
        }
        if let Err(e) = self.room.leave().await {
            tracing::warn!("leaving room failed: {}", e);
        }
        true
    }

    async fn handle(&self, event: RoomEvent) {
        match event {
            RoomEvent::PeerJoined(peer_id) => {
                if let Err(e) = self.room.add_stream(&self.local, Some(&peer_id)).await {
                    tracing::warn!("sending audio to {} failed: {}", peer_id, e);
                }
                if let Ok(mut roster) = self.roster.lock() {
                    if self.is_closed() {
                        return;
                    }
                    roster.departed.remove(&peer_id);
                    roster.records.entry(peer_id.clone()).or_default().announced = true;
                }
                if self.monitor.add_peer(&peer_id) {
                    self.notifier.notify(format!("{} joined", peer_id));
                }
            }
            RoomEvent::PeerLeft(peer_id) => {
                if let Err(e) = self.room.remove_stream(&self.local, Some(&peer_id)).await {
                    tracing::warn!("stopping audio to {} failed: {}", peer_id, e);
                }
                if let Ok(mut roster) = self.roster.lock() {
                    roster.records.remove(&peer_id);
                    roster.departed.insert(peer_id.clone());
                }
                if let Ok(activity) = self.activity.lock() {
                    if let Some(activity) = activity.as_ref() {
                        activity.remove_peer(&peer_id);
                    }
                }
                if self.monitor.remove_peer(&peer_id) {
                    self.notifier.notify(format!("{} left", peer_id));
                }
            }
            RoomEvent::PeerStream { peer_id, stream } => {
                let departed = self
                    .roster
                    .lock()
                    .map(|roster| roster.departed.contains(&peer_id))
                    .unwrap_or(true);
                if departed || self.is_closed() {
                    tracing::debug!("dropping stream from departed peer {}", peer_id);
                    return;
                }

                let playback = match self.media.play(&stream).await {
                    Ok(playback) => Some(playback),
                    Err(e) => {
                        tracing::warn!("cannot play audio from {}: {}", peer_id, e);
                        None
                    }
                };
                if let Ok(mut roster) = self.roster.lock() {
                    if self.is_closed() {
                        return;
                    }
                    let record = roster.records.entry(peer_id.clone()).or_default();
                    if !record.announced {
                        tracing::debug!("stream from {} arrived before its join", peer_id);
                    }
                    record.playback = playback;
                }
                if let Ok(activity) = self.activity.lock() {
                    if let Some(activity) = activity.as_ref() {
                        activity.add_peer(&peer_id, &stream);
                    }
                }
            }
            RoomEvent::Closed { .. } => {}
        }
    }
}
