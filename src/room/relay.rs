use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use webrtc::api::API;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::audio::AudioStream;
use crate::config::StrategyConfig;
use crate::error::{AppError, Result};
use crate::room::{random_id, PeerId, Room, RoomConfig, RoomEvent, RoomHandle, Strategy};
use crate::signaling::{SignalingClient, SignalingMessage, SignalingSender};
use crate::webrtc::{build_api, local_track, spawn_track_writer, PeerLink, Role};

/// Joins rooms through a WebSocket relay and talks to each peer over its own
/// WebRTC connection. Newcomers offer; peers already in the room answer.
pub struct RelayStrategy {
    name: String,
    signaling_url: String,
    ice_servers: Vec<String>,
}

impl RelayStrategy {
    pub fn new(config: &StrategyConfig, ice_servers: &[String]) -> Self {
        Self {
            name: config.name.clone(),
            signaling_url: config.signaling_url.clone(),
            ice_servers: ice_servers.to_vec(),
        }
    }
}

#[async_trait]
impl Strategy for RelayStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn join_room(&self, config: &RoomConfig, room_name: &str) -> Result<Room> {
        let mut client = SignalingClient::connect(&self.signaling_url).await?;
        client
            .send(SignalingMessage::Join {
                app_id: config.app_id.clone(),
                room: room_name.to_string(),
                peer_id: random_id(12),
            })
            .await?;

        let (local_id, peers) = loop {
            match client.receive().await {
                Some(SignalingMessage::Welcome { peer_id, peers }) => break (peer_id, peers),
                Some(SignalingMessage::Error { message }) => {
                    return Err(AppError::Join {
                        strategy: self.name.clone(),
                        reason: message,
                    })
                }
                Some(other) => tracing::debug!("ignoring {:?} before welcome", other),
                None => return Err(AppError::Signaling("relay closed before welcome".into())),
            }
        };
        tracing::info!("joined {} as {} with {} peers present", room_name, local_id, peers.len());

        RelayRoom::start(client, local_id, room_name, peers, &self.ice_servers).await
    }
}

struct Published {
    stream: AudioStream,
    track: Arc<TrackLocalStaticSample>,
    writer: JoinHandle<()>,
}

struct Shared {
    local_id: PeerId,
    room_name: String,
    api: API,
    ice_servers: Vec<String>,
    signaling: SignalingSender,
    links: Mutex<HashMap<PeerId, Arc<PeerLink>>>,
    published: Mutex<Option<Published>>,
    events: mpsc::UnboundedSender<RoomEvent>,
}

pub struct RelayRoom {
    shared: Arc<Shared>,
    dispatch: StdMutex<Option<JoinHandle<()>>>,
}

impl RelayRoom {
    async fn start(
        client: SignalingClient,
        local_id: PeerId,
        room_name: &str,
        peers: Vec<PeerId>,
        ice_servers: &[String],
    ) -> Result<Room> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            local_id,
            room_name: room_name.to_string(),
            api: build_api()?,
            ice_servers: ice_servers.to_vec(),
            signaling: client.sender(),
            links: Mutex::new(HashMap::new()),
            published: Mutex::new(None),
            events: events_tx,
        });

        for peer_id in peers {
            if let Err(e) = shared.ensure_link(&peer_id, Role::Offerer).await {
                tracing::warn!("could not connect to {}: {}", peer_id, e);
            }
        }

        let dispatch = tokio::spawn(dispatch(shared.clone(), client));

        Ok(Room {
            handle: Arc::new(RelayRoom {
                shared,
                dispatch: StdMutex::new(Some(dispatch)),
            }),
            events,
        })
    }
}

impl Shared {
    /// Returns the link to `peer_id`, creating it (and announcing the peer) if new.
    async fn ensure_link(&self, peer_id: &str, role: Role) -> Result<Arc<PeerLink>> {
        let link = {
            let mut links = self.links.lock().await;
            if let Some(link) = links.get(peer_id) {
                return Ok(link.clone());
            }
            let link = PeerLink::new(
                &self.api,
                &self.ice_servers,
                &self.local_id,
                peer_id,
                role,
                self.signaling.clone(),
                self.events.clone(),
            )
            .await?;
            links.insert(peer_id.to_string(), link.clone());
            link
        };
        let _ = self.events.send(RoomEvent::PeerJoined(peer_id.to_string()));

        let track = self.published.lock().await.as_ref().map(|p| p.track.clone());
        if let Some(track) = track {
            link.attach(track).await?;
        }
        Ok(link)
    }

    async fn drop_link(&self, peer_id: &str) {
        let removed = self.links.lock().await.remove(peer_id);
        if let Some(link) = removed {
            link.close().await;
            let _ = self.events.send(RoomEvent::PeerLeft(peer_id.to_string()));
        }
    }

    async fn link(&self, peer_id: &str) -> Option<Arc<PeerLink>> {
        self.links.lock().await.get(peer_id).cloned()
    }

    /// Track for `stream`, publishing it first if needed.
    async fn publish(&self, stream: &AudioStream) -> Arc<TrackLocalStaticSample> {
        let mut published = self.published.lock().await;
        if let Some(current) = published.as_ref() {
            if current.stream.same_stream(stream) {
                return current.track.clone();
            }
        }
        if let Some(previous) = published.take() {
            previous.writer.abort();
        }
        let track = local_track(stream);
        let writer = spawn_track_writer(stream, track.clone());
        *published = Some(Published {
            stream: stream.clone(),
            track: track.clone(),
            writer,
        });
        track
    }

    async fn handle(&self, msg: SignalingMessage) -> Result<()> {
        match msg {
            SignalingMessage::PeerJoined { peer_id } if peer_id != self.local_id => {
                self.ensure_link(&peer_id, Role::Answerer).await?;
            }
            SignalingMessage::PeerLeft { peer_id } => {
                self.drop_link(&peer_id).await;
            }
            SignalingMessage::Offer { from_peer, to_peer, sdp } if to_peer == self.local_id => {
                let link = self.ensure_link(&from_peer, Role::Answerer).await?;
                link.handle_offer(&sdp).await?;
            }
            SignalingMessage::Answer { from_peer, to_peer, sdp } if to_peer == self.local_id => {
                if let Some(link) = self.link(&from_peer).await {
                    link.handle_answer(&sdp).await?;
                }
            }
            SignalingMessage::IceCandidate { from_peer, to_peer, candidate } if to_peer == self.local_id => {
                if let Some(link) = self.link(&from_peer).await {
                    link.add_ice_candidate(&candidate).await?;
                }
            }
            SignalingMessage::Error { message } => {
                tracing::warn!("relay reported: {}", message);
            }
            other => tracing::debug!("ignoring signaling message {:?}", other),
        }
        Ok(())
    }

    async fn close_all(&self) {
        let links: Vec<(PeerId, Arc<PeerLink>)> = self.links.lock().await.drain().collect();
        futures::future::join_all(links.iter().map(|(_, link)| link.close())).await;
        for (peer_id, _) in links {
            let _ = self.events.send(RoomEvent::PeerLeft(peer_id));
        }
        if let Some(published) = self.published.lock().await.take() {
            published.writer.abort();
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut client: SignalingClient) {
    while let Some(msg) = client.receive().await {
        if let Err(e) = shared.handle(msg).await {
            tracing::warn!("signaling error in {}: {}", shared.room_name, e);
        }
    }
    tracing::info!("relay connection for {} closed", shared.room_name);
    shared.close_all().await;
    let _ = shared.events.send(RoomEvent::Closed {
        reason: "relay connection lost".to_string(),
    });
}

#[async_trait]
impl RoomHandle for RelayRoom {
    async fn add_stream(&self, stream: &AudioStream, peer_id: Option<&str>) -> Result<()> {
        let track = self.shared.publish(stream).await;
        match peer_id {
            Some(peer_id) => {
                if let Some(link) = self.shared.link(peer_id).await {
                    link.attach(track).await?;
                }
            }
            None => {
                let links: Vec<Arc<PeerLink>> = self.shared.links.lock().await.values().cloned().collect();
                for link in links {
                    if let Err(e) = link.attach(track.clone()).await {
                        tracing::warn!("could not send audio to {}: {}", link.peer_id(), e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn remove_stream(&self, stream: &AudioStream, peer_id: Option<&str>) -> Result<()> {
        match peer_id {
            Some(peer_id) => {
                if let Some(link) = self.shared.link(peer_id).await {
                    link.detach().await?;
                }
            }
            None => {
                let links: Vec<Arc<PeerLink>> = self.shared.links.lock().await.values().cloned().collect();
                for link in links {
                    link.detach().await?;
                }
                let mut published = self.shared.published.lock().await;
                if published.as_ref().map_or(false, |p| p.stream.same_stream(stream)) {
                    if let Some(previous) = published.take() {
                        previous.writer.abort();
                    }
                }
            }
        }
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        let dispatch = self.dispatch.lock().ok().and_then(|mut d| d.take());
        let Some(dispatch) = dispatch else {
            return Ok(());
        };
        let _ = self
            .shared
            .signaling
            .send(SignalingMessage::Leave {
                room: self.shared.room_name.clone(),
                peer_id: self.shared.local_id.clone(),
            })
            .await;
        dispatch.abort();
        self.shared.close_all().await;
        Ok(())
    }
}
