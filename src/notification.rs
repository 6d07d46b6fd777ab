use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::SessionMonitor;

/// Single-slot notification line. A newer message always wins and an older
/// message's clear timer never wipes a newer one.
#[derive(Clone)]
pub struct Notifier {
    monitor: SessionMonitor,
    generation: Arc<AtomicU64>,
    ttl: Duration,
}

impl Notifier {
    pub fn new(monitor: SessionMonitor, ttl: Duration) -> Self {
        Self {
            monitor,
            generation: Arc::new(AtomicU64::new(0)),
            ttl,
        }
    }

    /// Shows `text` and clears it after the configured delay.
    pub fn notify(&self, text: impl Into<String>) {
        let generation = self.show(text.into());
        let monitor = self.monitor.clone();
        let current = self.generation.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if current.load(Ordering::SeqCst) == generation {
                monitor.set_notification(None);
            }
        });
    }

    /// Shows `text` until something else replaces it.
    pub fn hold(&self, text: impl Into<String>) {
        self.show(text.into());
    }

    fn show(&self, text: String) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.monitor.set_notification(Some(text));
        generation
    }
}
