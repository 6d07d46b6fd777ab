use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::audio::AudioStream;
use crate::connection::SessionMonitor;
use crate::room::PeerId;

/// Root-mean-square amplitude of a block of samples, 0 for an empty block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_of_squares: f32 = samples.iter().map(|&x| x * x).sum();
    (sum_of_squares / samples.len() as f32).sqrt()
}

#[derive(Debug, Clone, Copy)]
pub struct ActivitySettings {
    pub poll: Duration,
    pub threshold: f32,
    pub window: usize,
}

/// Tracks the most recent `window` samples of one stream.
pub struct ActivityAnalyzer {
    window: Arc<Mutex<VecDeque<f32>>>,
    feeder: JoinHandle<()>,
}

impl ActivityAnalyzer {
    pub fn attach(stream: &AudioStream, window_len: usize) -> Self {
        let window_len = window_len.max(1);
        let window = Arc::new(Mutex::new(VecDeque::with_capacity(window_len)));
        let mut frames = stream.subscribe();
        let target = window.clone();

        let feeder = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        if let Ok(mut samples) = target.lock() {
                            samples.extend(frame.iter().copied());
                            let excess = samples.len().saturating_sub(window_len);
                            samples.drain(..excess);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { window, feeder }
    }

    pub fn level(&self) -> f32 {
        match self.window.lock() {
            Ok(mut samples) => rms(samples.make_contiguous()),
            Err(_) => 0.0,
        }
    }

    /// Strictly louder than `threshold`.
    pub fn is_talking(&self, threshold: f32) -> bool {
        self.level() > threshold
    }
}

impl Drop for ActivityAnalyzer {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

type PeerAnalyzers = Arc<Mutex<HashMap<PeerId, ActivityAnalyzer>>>;

/// Local and aggregate-peer talking indicators, each on its own polling timer.
pub struct ActivityMonitor {
    settings: ActivitySettings,
    peers: PeerAnalyzers,
    local_timer: JoinHandle<()>,
    peer_timer: JoinHandle<()>,
    monitor: SessionMonitor,
}

impl ActivityMonitor {
    pub fn start(local: &AudioStream, settings: ActivitySettings, monitor: SessionMonitor) -> Self {
        let local_analyzer = ActivityAnalyzer::attach(local, settings.window);
        let peers: PeerAnalyzers = Arc::new(Mutex::new(HashMap::new()));

        let local_monitor = monitor.clone();
        let local_timer = tokio::spawn(async move {
            let mut ticker = interval(settings.poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                local_monitor.set_local_talking(local_analyzer.is_talking(settings.threshold));
            }
        });

        let peer_monitor = monitor.clone();
        let analyzers = peers.clone();
        let peer_timer = tokio::spawn(async move {
            let mut ticker = interval(settings.poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let talking = analyzers
                    .lock()
                    .map(|peers| peers.values().any(|a| a.is_talking(settings.threshold)))
                    .unwrap_or(false);
                peer_monitor.set_peers_talking(talking);
            }
        });

        Self {
            settings,
            peers,
            local_timer,
            peer_timer,
            monitor,
        }
    }

    /// Replaces any analyzer already registered for `peer_id`.
    pub fn add_peer(&self, peer_id: &str, stream: &AudioStream) {
        let analyzer = ActivityAnalyzer::attach(stream, self.settings.window);
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer_id.to_string(), analyzer);
        }
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        self.peers
            .lock()
            .map(|mut peers| peers.remove(peer_id).is_some())
            .unwrap_or(false)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    /// Stops both timers, drops every analyzer and clears the indicators.
    pub fn shutdown(self) {
        self.local_timer.abort();
        self.peer_timer.abort();
        if let Ok(mut peers) = self.peers.lock() {
            peers.clear();
        }
        self.monitor.set_local_talking(false);
        self.monitor.set_peers_talking(false);
    }
}
