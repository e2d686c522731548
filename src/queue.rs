// Offline outgoing queue and its flusher
//
// Entries persist under `offline:outgoing_queue`. Flushing is sequential to
// bound server load: mark `sending`, attempt, remove on success, bump the
// retry counter and back off linearly on failure.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::api::{MessageApi, SendMessageRequest};
use crate::config::QueueConfig;
use crate::error::{ChatError, Result};
use crate::models::{Message, QueueStatus, QueuedMessage};
use crate::network::NetworkMonitor;
use crate::storage::{KeyValueStore, LocalStore};

pub const QUEUE_KEY: &str = "offline:outgoing_queue";
const MIN_RECEIPT_CAPACITY: usize = 64;

/// Clears the in-progress flag even when a flush is cancelled mid-way
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a flush accomplished
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushSummary {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Outcome of a queued send, for whoever is showing the temporary message
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Sent {
        conversation_id: String,
        temp_id: String,
        message: Message,
    },
    /// Retries exhausted; the entry stays queued until retried by hand
    GaveUp {
        conversation_id: String,
        temp_id: String,
        error: String,
    },
}

pub struct OfflineQueue {
    kv: Arc<dyn KeyValueStore>,
    store: LocalStore,
    api: Arc<dyn MessageApi>,
    network: Arc<NetworkMonitor>,
    config: QueueConfig,
    entries: TokioMutex<Vec<QueuedMessage>>,
    flushing: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
}

impl OfflineQueue {
    /// Build the queue and load any entries persisted by a previous run
    pub async fn load(
        kv: Arc<dyn KeyValueStore>,
        store: LocalStore,
        api: Arc<dyn MessageApi>,
        network: Arc<NetworkMonitor>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let entries = match kv.get(QUEUE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<QueuedMessage>>(&raw) {
                Ok(mut entries) => {
                    // a crash mid-flush leaves entries marked sending
                    for entry in entries.iter_mut().filter(|e| e.status == QueueStatus::Sending) {
                        entry.status = QueueStatus::Queued;
                    }
                    entries
                }
                Err(e) => {
                    warn!("Discarding corrupt offline queue: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read offline queue: {}", e);
                Vec::new()
            }
        };
        if !entries.is_empty() {
            info!("Loaded {} queued outgoing messages", entries.len());
        }
        // every entry can produce a receipt before a listener catches up
        let receipt_capacity = config.max_size.max(MIN_RECEIPT_CAPACITY);

        Arc::new(OfflineQueue {
            kv,
            store,
            api,
            network,
            config,
            entries: TokioMutex::new(entries),
            flushing: AtomicBool::new(false),
            events: broadcast::channel(receipt_capacity).0,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: QueueEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    pub fn capacity(&self) -> usize {
        self.config.max_size
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn entries(&self) -> Vec<QueuedMessage> {
        self.entries.lock().await.clone()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.lock().await.iter().any(|e| e.id == id)
    }

    /// Add an outgoing message. Fails when full; duplicates are ignored.
    pub async fn queue_outgoing(&self, message: QueuedMessage) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.id == message.id) {
            warn!("Message {} is already queued, ignoring", message.id);
            return Ok(());
        }
        if entries.len() >= self.config.max_size {
            error!("Offline queue full ({} messages), rejecting {}", entries.len(), message.id);
            return Err(ChatError::QueueFull {
                capacity: self.config.max_size,
            });
        }
        info!("Queued message {} for conversation {}", message.id, message.conversation_id);
        entries.push(message);
        self.persist(&entries).await;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if removed {
            self.persist(&entries).await;
        }
        removed
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist(&entries).await;
    }

    /// Best-effort: a failed write leaves the in-memory queue authoritative
    async fn persist(&self, entries: &[QueuedMessage]) {
        let json = match serde_json::to_string(entries) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize offline queue: {}", e);
                return;
            }
        };
        if let Err(e) = self.kv.set(QUEUE_KEY, &json).await {
            warn!("Failed to persist offline queue: {}", e);
        }
    }

    async fn update_entry(&self, id: &str, f: impl FnOnce(&mut QueuedMessage)) -> Option<QueuedMessage> {
        let mut entries = self.entries.lock().await;
        let updated = entries.iter_mut().find(|e| e.id == id).map(|entry| {
            f(entry);
            entry.clone()
        });
        if updated.is_some() {
            self.persist(&entries).await;
        }
        updated
    }

    /// Replay queued messages through the send API, one at a time
    pub async fn flush(&self) -> FlushSummary {
        let mut summary = FlushSummary::default();

        if !self.network.is_online() {
            debug!("Offline, not flushing queue");
            return summary;
        }
        if self.flushing.swap(true, Ordering::SeqCst) {
            debug!("Flush already in progress");
            return summary;
        }
        let _guard = FlushGuard(&self.flushing);

        let snapshot = self.entries().await;
        let total = snapshot.len();
        if total > 0 {
            info!("Flushing {} queued messages", total);
        }

        for (index, queued) in snapshot.into_iter().enumerate() {
            if !self.network.is_online() {
                info!("Went offline mid-flush, stopping");
                break;
            }
            // removed concurrently (e.g. sent by a manual retry)
            if !self.contains(&queued.id).await {
                continue;
            }

            if queued.retry_count >= self.config.max_retries {
                self.update_entry(&queued.id, |e| e.status = QueueStatus::Failed).await;
                summary.failed += 1;
                let error = format!("permanently failed after {} retries", queued.retry_count);
                summary.errors.push(format!("{}: {}", queued.id, error));
                self.notify(QueueEvent::GaveUp {
                    conversation_id: queued.conversation_id.clone(),
                    temp_id: queued.id.clone(),
                    error,
                });
                continue;
            }

            self.update_entry(&queued.id, |e| e.status = QueueStatus::Sending).await;

            let request = SendMessageRequest {
                conversation_id: queued.conversation_id.clone(),
                text: queued.text.clone(),
                sender_id: queued.sender_id.clone(),
            };
            match self.api.send_message(&request).await {
                Ok(response) => {
                    let confirmed = response.into_message();
                    info!("Queued message {} sent as {}", queued.id, confirmed.id);
                    self.remove(&queued.id).await;
                    if let Err(e) = self
                        .store
                        .upsert_message(&queued.conversation_id, &confirmed, Some(&queued.id))
                        .await
                    {
                        warn!("Sent {} but could not store it locally: {}", confirmed.id, e);
                    }
                    self.notify(QueueEvent::Sent {
                        conversation_id: queued.conversation_id.clone(),
                        temp_id: queued.id.clone(),
                        message: confirmed,
                    });
                    summary.success += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    let updated = self
                        .update_entry(&queued.id, |entry| {
                            entry.retry_count += 1;
                            entry.status = QueueStatus::Failed;
                            entry.last_error = Some(message.clone());
                        })
                        .await;
                    let retry_count = updated.map_or(queued.retry_count + 1, |u| u.retry_count);
                    warn!("Queued message {} failed (retry {}): {}", queued.id, retry_count, message);
                    summary.failed += 1;
                    summary.errors.push(format!("{}: {}", queued.id, message));

                    if index + 1 < total {
                        let delay = self.config.backoff_after(retry_count);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        if summary.success + summary.failed > 0 {
            info!("Flush finished: {} sent, {} failed", summary.success, summary.failed);
        }
        summary
    }

    /// Flush every time connectivity comes back
    pub fn spawn_auto_flush(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::downgrade(self);
        let mut online = self.network.subscribe();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if !is_online {
                    continue;
                }
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                let summary = queue.flush().await;
                if summary.failed > 0 {
                    warn!("Auto-flush left {} messages unsent: {:?}", summary.failed, summary.errors);
                }
            }
        })
    }
}
