// Connectivity and app lifecycle signals
//
// Both are `watch` channels so any number of components (SSE client, queue
// flusher, debounced writer) can observe transitions without polling.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Whether the host app is visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

pub struct NetworkMonitor {
    online: watch::Sender<bool>,
    lifecycle: watch::Sender<AppLifecycle>,
    held_offline: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Arc<Self> {
        let (online, _) = watch::channel(initially_online);
        let (lifecycle, _) = watch::channel(AppLifecycle::Foreground);
        Arc::new(NetworkMonitor {
            online,
            lifecycle,
            held_offline: AtomicBool::new(false),
        })
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Report connectivity; only real transitions wake subscribers
    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!("Network is now {}", if online { "online" } else { "offline" });
        }
    }

    /// Force offline until released; probe results are ignored meanwhile.
    /// Releasing does not go online by itself.
    pub fn hold_offline(&self, held: bool) {
        self.held_offline.store(held, Ordering::SeqCst);
        if held {
            self.set_online(false);
        }
    }

    pub fn is_held_offline(&self) -> bool {
        self.held_offline.load(Ordering::SeqCst)
    }

    /// Apply a reachability check unless offline is being held
    pub fn report_probe(&self, reachable: bool) {
        if self.is_held_offline() {
            debug!("Offline is held, ignoring probe result");
            return;
        }
        if !reachable && self.is_online() {
            warn!("Health probe failed, marking offline");
        }
        self.set_online(reachable);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn lifecycle(&self) -> AppLifecycle {
        *self.lifecycle.borrow()
    }

    pub fn set_lifecycle(&self, state: AppLifecycle) {
        let changed = self.lifecycle.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!("App moved to {:?}", state);
        }
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<AppLifecycle> {
        self.lifecycle.subscribe()
    }

    /// Poll `health_url` and report reachability
    pub fn spawn_probe(
        self: &Arc<Self>,
        client: reqwest::Client,
        health_url: String,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    debug!("Network monitor dropped, stopping probe");
                    break;
                };
                let reachable = match client.get(&health_url).timeout(interval).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        debug!("Health probe failed: {}", e);
                        false
                    }
                };
                if !reachable {
                    debug!("Health probe to {} got no answer", health_url);
                }
                monitor.report_probe(reachable);
            }
        })
    }
}
