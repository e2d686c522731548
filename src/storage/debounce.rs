// Debounced timeline writes
//
// Rapid successive saves of the same conversation collapse into one write
// after a fixed delay. `save_now` bypasses the delay and `flush_all` drains
// everything (called when the app goes to background).

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use super::LocalStore;
use crate::error::Result;
use crate::models::{ConversationMetadata, Message};
use crate::network::AppLifecycle;

struct PendingWrite {
    messages: Vec<Message>,
    generation: u64,
}

#[derive(Clone)]
pub struct DebouncedWriter {
    store: LocalStore,
    delay: Duration,
    pending: Arc<TokioMutex<HashMap<String, PendingWrite>>>,
    generation: Arc<AtomicU64>,
}

impl DebouncedWriter {
    pub fn new(store: LocalStore, delay: Duration) -> Self {
        DebouncedWriter {
            store,
            delay,
            pending: Arc::new(TokioMutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Queue a write; a later call for the same conversation supersedes this one
    pub async fn schedule(&self, conversation_id: &str, messages: Vec<Message>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                conversation_id.to_string(),
                PendingWrite { messages, generation },
            );
        }

        let writer = self.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(writer.delay).await;
            let due = {
                let mut pending = writer.pending.lock().await;
                match pending.get(&conversation_id) {
                    Some(write) if write.generation == generation => pending.remove(&conversation_id),
                    _ => None,
                }
            };
            if let Some(write) = due {
                if let Err(e) = writer.store.save_messages(&conversation_id, &write.messages).await {
                    warn!("Debounced save for {} failed: {}", conversation_id, e);
                }
            }
        });
    }

    /// Write immediately, discarding any pending write for the conversation
    pub async fn save_now(&self, conversation_id: &str, messages: &[Message]) -> Result<ConversationMetadata> {
        self.pending.lock().await.remove(conversation_id);
        self.store.save_messages(conversation_id, messages).await
    }

    /// Write the pending state of one conversation now, if any
    pub async fn flush(&self, conversation_id: &str) -> Result<bool> {
        let write = self.pending.lock().await.remove(conversation_id);
        match write {
            Some(write) => {
                self.store.save_messages(conversation_id, &write.messages).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drain every pending write. Failures are logged; returns how many were written.
    pub async fn flush_all(&self) -> usize {
        let drained: Vec<(String, PendingWrite)> = self.pending.lock().await.drain().collect();
        let mut written = 0;
        for (conversation_id, write) in drained {
            match self.store.save_messages(&conversation_id, &write.messages).await {
                Ok(_) => written += 1,
                Err(e) => warn!("Forced save for {} failed: {}", conversation_id, e),
            }
        }
        if written > 0 {
            debug!("Flushed {} pending timeline writes", written);
        }
        written
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Force a flush whenever the app moves to background
    pub fn flush_on_background(&self, mut lifecycle: watch::Receiver<AppLifecycle>) -> JoinHandle<()> {
        let writer = self.clone();
        tokio::spawn(async move {
            while lifecycle.changed().await.is_ok() {
                let state = *lifecycle.borrow_and_update();
                if state == AppLifecycle::Background {
                    let written = writer.flush_all().await;
                    info!("App backgrounded, flushed {} pending writes", written);
                }
            }
        })
    }
}
