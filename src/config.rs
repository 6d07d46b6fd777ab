use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const APP_ID: &str = "voice-room-app";

/// One signaling transport, tried in list order when joining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    pub signaling_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app_id: String,
    pub strategies: Vec<StrategyConfig>,
    pub ice_servers: Vec<String>,
    pub join_timeout_ms: u64,
    pub notification_ttl_ms: u64,
    pub activity_poll_ms: u64,
    pub activity_threshold: f32,
    pub activity_window: usize,
    pub push_to_talk: bool,
    pub push_to_talk_key: String,
    pub auto_connect_delay_ms: u64,
    pub share_base_url: String,
    pub default_room: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: APP_ID.to_string(),
            strategies: vec![StrategyConfig {
                name: "relay".to_string(),
                signaling_url: "ws://127.0.0.1:8080".to_string(),
            }],
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            join_timeout_ms: 10_000,
            notification_ttl_ms: 2_000,
            activity_poll_ms: 120,
            activity_threshold: 0.08,
            activity_window: 2048,
            push_to_talk: false,
            push_to_talk_key: "Space".to_string(),
            auto_connect_delay_ms: 500,
            share_base_url: "https://localhost:3000/".to_string(),
            default_room: None,
        }
    }
}

impl Config {
    /// Reads a JSON config file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_millis(self.notification_ttl_ms)
    }

    pub fn activity_poll(&self) -> Duration {
        Duration::from_millis(self.activity_poll_ms)
    }

    pub fn auto_connect_delay(&self) -> Duration {
        Duration::from_millis(self.auto_connect_delay_ms)
    }
}
