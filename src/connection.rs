use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::room::PeerId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    /// CSS class used by the status line.
    pub fn css_class(&self) -> &'static str {
        match self {
            ConnectionStatus::NotConnected => "not-connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::NotConnected => write!(f, "not connected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Everything the UI renders about the current session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub room_name: String,
    pub strategy: Option<String>,
    pub peers: Vec<PeerId>,
    pub mic_enabled: bool,
    pub local_talking: bool,
    pub peers_talking: bool,
    pub notification: Option<String>,
}

impl SessionSnapshot {
    /// Room the session is in or joining, once a name has been resolved.
    pub fn active_room(&self) -> Option<&str> {
        if self.status == ConnectionStatus::NotConnected || self.room_name.is_empty() {
            return None;
        }
        Some(&self.room_name)
    }
}

#[derive(Clone)]
pub struct SessionMonitor {
    status: Arc<watch::Sender<SessionSnapshot>>,
    receiver: watch::Receiver<SessionSnapshot>,
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(SessionSnapshot::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_status(&self, state: ConnectionStatus) {
        self.status.send_if_modified(|snapshot| {
            let changed = snapshot.status != state;
            snapshot.status = state;
            changed
        });
    }

    pub fn set_room(&self, room_name: &str, strategy: Option<&str>) {
        self.status.send_modify(|snapshot| {
            snapshot.room_name = room_name.to_string();
            snapshot.strategy = strategy.map(str::to_string);
        });
    }

    /// Appends a peer unless it is already listed. Returns whether the list changed.
    pub fn add_peer(&self, peer_id: &str) -> bool {
        self.status.send_if_modified(|snapshot| {
            if snapshot.peers.iter().any(|p| p == peer_id) {
                return false;
            }
            snapshot.peers.push(peer_id.to_string());
            true
        })
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        self.status.send_if_modified(|snapshot| {
            let before = snapshot.peers.len();
            snapshot.peers.retain(|p| p != peer_id);
            snapshot.peers.len() != before
        })
    }

    pub fn set_mic_enabled(&self, enabled: bool) {
        self.status.send_if_modified(|snapshot| {
            let changed = snapshot.mic_enabled != enabled;
            snapshot.mic_enabled = enabled;
            changed
        });
    }

    pub fn set_local_talking(&self, talking: bool) {
        self.status.send_if_modified(|snapshot| {
            let changed = snapshot.local_talking != talking;
            snapshot.local_talking = talking;
            changed
        });
    }

    pub fn set_peers_talking(&self, talking: bool) {
        self.status.send_if_modified(|snapshot| {
            let changed = snapshot.peers_talking != talking;
            snapshot.peers_talking = talking;
            changed
        });
    }

    pub fn set_notification(&self, notification: Option<String>) {
        self.status.send_if_modified(|snapshot| {
            let changed = snapshot.notification != notification;
            snapshot.notification = notification;
            changed
        });
    }

    /// Back to the initial NotConnected state. The notification line is left alone.
    pub fn reset(&self) {
        self.status.send_modify(|snapshot| {
            let notification = snapshot.notification.take();
            *snapshot = SessionSnapshot {
                notification,
                ..SessionSnapshot::default()
            };
        });
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.receiver.clone()
    }
}
