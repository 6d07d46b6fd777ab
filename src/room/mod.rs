//! The room contract the call session drives, plus the strategies that
//! implement it.

pub mod fallback;
pub mod relay;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::AudioStream;
use crate::error::Result;

pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConfig {
    pub app_id: String,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    PeerStream { peer_id: PeerId, stream: AudioStream },
    /// The transport went away without `leave` being called. No further
    /// events follow.
    Closed { reason: String },
}

/// A joined room. Events arrive in the order the transport saw them.
pub struct Room {
    pub handle: Arc<dyn RoomHandle>,
    pub events: mpsc::UnboundedReceiver<RoomEvent>,
}

#[async_trait]
pub trait RoomHandle: Send + Sync {
    /// Sends `stream` to `peer_id`, or to every current and future peer when `None`.
    async fn add_stream(&self, stream: &AudioStream, peer_id: Option<&str>) -> Result<()>;

    /// Stops sending `stream` to `peer_id`, or to everyone when `None`.
    async fn remove_stream(&self, stream: &AudioStream, peer_id: Option<&str>) -> Result<()>;

    async fn leave(&self) -> Result<()>;
}

/// One way of reaching a room.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    async fn join_room(&self, config: &RoomConfig, room_name: &str) -> Result<Room>;
}

/// Random alphanumeric identifier, used for peer ids and fallback room names.
pub fn random_id(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}
