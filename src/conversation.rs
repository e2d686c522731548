// Conversation controller
//
// Owns one conversation's timeline (newest first) and funnels every mutation
// through a single async mutex: user sends and retries, SSE events, queue
// receipts, pagination and refresh. Anything that lands after `close` is
// dropped.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{MessageApi, SendMessageRequest};
use crate::config::ConversationConfig;
use crate::error::{ChatError, Result, SendFailure};
use crate::models::{sort_newest_first, ConversationMetadata, Message, MessageStatus, QueuedMessage, Session};
use crate::network::NetworkMonitor;
use crate::queue::{OfflineQueue, QueueEvent};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::sse::{SseClient, SseError, SseEvent, SseEvents, SseSubscription};
use crate::storage::DebouncedWriter;

pub const TEMP_ID_PREFIX: &str = "temp_";

/// Everything a conversation needs from the rest of the client
#[derive(Clone)]
pub struct ConversationServices {
    pub session: Session,
    pub api: Arc<dyn MessageApi>,
    pub writer: DebouncedWriter,
    pub network: Arc<NetworkMonitor>,
    pub queue: Option<Arc<OfflineQueue>>,
}

#[derive(Debug, Default)]
struct TimelineState {
    messages: Vec<Message>,
    has_more: bool,
    loading_older: bool,
    connected: bool,
    closed: bool,
}

pub struct Conversation {
    conversation_id: String,
    services: ConversationServices,
    config: ConversationConfig,
    reconciler: Reconciler,
    state: TokioMutex<TimelineState>,
    subscription: Mutex<Option<SseSubscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

impl Conversation {
    /// Load the stored timeline and start listening for queue receipts
    pub async fn open(
        conversation_id: &str,
        services: ConversationServices,
        config: ConversationConfig,
    ) -> Arc<Self> {
        let messages = match services.writer.store().load_messages(conversation_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Could not load stored timeline for {}: {}", conversation_id, e);
                Vec::new()
            }
        };
        info!("Opened conversation {} with {} stored messages", conversation_id, messages.len());

        let conversation = Arc::new(Conversation {
            conversation_id: conversation_id.to_string(),
            reconciler: Reconciler::from_millis(config.match_tolerance_ms),
            services,
            config,
            state: TokioMutex::new(TimelineState {
                messages,
                has_more: true,
                ..TimelineState::default()
            }),
            subscription: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        if let Some(queue) = &conversation.services.queue {
            let handle = spawn_receipt_listener(Arc::downgrade(&conversation), queue.subscribe());
            conversation.track(handle);
        }
        conversation
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    pub async fn has_more(&self) -> bool {
        self.state.lock().await.has_more
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    /// Immediate write. Failures are logged, never surfaced.
    async fn persist_now(&self, messages: &[Message]) {
        if let Err(e) = self.services.writer.save_now(&self.conversation_id, messages).await {
            warn!("Failed to persist conversation {}: {}", self.conversation_id, e);
        }
    }

    async fn persist_later(&self, messages: &[Message]) {
        self.services
            .writer
            .schedule(&self.conversation_id, messages.to_vec())
            .await;
    }

    fn validate(&self, text: &str) -> Result<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::Validation("message text is empty".to_string()));
        }
        let length = trimmed.chars().count();
        if length > self.config.max_message_length {
            return Err(ChatError::Validation(format!(
                "message is {} characters, limit is {}",
                length, self.config.max_message_length
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Optimistically add a message and deliver it.
    ///
    /// Returns the timeline entry as it stands afterwards: `sent` with the
    /// server id, or still `sending` when it went to the offline queue.
    pub async fn send_message(&self, text: &str) -> std::result::Result<Message, SendFailure> {
        let text = self.validate(text)?;

        let temp = Message {
            id: format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()),
            text,
            sender_id: self.services.session.user_id.clone(),
            created_at: Utc::now(),
            status: MessageStatus::Sending,
            server_id: None,
            archived: false,
            error_message: None,
        };

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ChatError::Validation("conversation is closed".to_string()).into());
            }
            state.messages.insert(0, temp.clone());
            sort_newest_first(&mut state.messages);
            self.persist_now(&state.messages).await;
        }
        debug!("Optimistic message {} added to {}", temp.id, self.conversation_id);

        self.deliver(temp).await
    }

    /// Resend a `failed` message through the same path as a fresh send
    pub async fn retry_message(&self, message_id: &str) -> std::result::Result<Message, SendFailure> {
        let pending = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ChatError::Validation("conversation is closed".to_string()).into());
            }
            let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) else {
                return Err(ChatError::NotFound(message_id.to_string()).into());
            };
            if !message.status.can_transition_to(MessageStatus::Sending) {
                return Err(ChatError::Validation(format!(
                    "only failed messages can be retried, {} is {:?}",
                    message_id, message.status
                ))
                .into());
            }
            message.status = MessageStatus::Sending;
            message.error_message = None;
            let pending = message.clone();
            self.persist_now(&state.messages).await;
            pending
        };

        // a queue entry that gave up would otherwise be sent twice
        if let Some(queue) = &self.services.queue {
            queue.remove(&pending.id).await;
        }

        info!("Retrying message {} in {}", pending.id, self.conversation_id);
        self.deliver(pending).await
    }

    /// Ids of every failed message, oldest first
    pub async fn failed_message_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .messages
            .iter()
            .rev()
            .filter(|m| m.status == MessageStatus::Failed)
            .map(|m| m.id.clone())
            .collect()
    }

    async fn deliver(&self, pending: Message) -> std::result::Result<Message, SendFailure> {
        if !self.services.network.is_online() {
            if let Some(queue) = &self.services.queue {
                let entry = QueuedMessage::from_message(&self.conversation_id, &pending);
                return match queue.queue_outgoing(entry).await {
                    Ok(()) => {
                        info!("Offline, queued {} for later delivery", pending.id);
                        Ok(pending)
                    }
                    Err(e) => Err(self.mark_failed(&pending.id, &e).await),
                };
            }
        }

        let request = SendMessageRequest {
            conversation_id: self.conversation_id.clone(),
            text: pending.text.clone(),
            sender_id: pending.sender_id.clone(),
        };
        match self.services.api.send_message(&request).await {
            Ok(response) => {
                let confirmed = response.into_message();
                info!("Message {} confirmed as {}", pending.id, confirmed.id);
                Ok(self
                    .apply_confirmation(&pending.id, confirmed.clone())
                    .await
                    .unwrap_or(confirmed))
            }
            Err(e) => {
                error!("Sending {} failed: {}", pending.id, e);
                Err(self.mark_failed(&pending.id, &e).await)
            }
        }
    }

    /// Swap the temporary entry for the confirmed one. Also removes an SSE
    /// echo of the same message that may have arrived first.
    async fn apply_confirmation(&self, temp_id: &str, confirmed: Message) -> Option<Message> {
        let mut state = self.state.lock().await;
        if state.closed {
            debug!("Dropping confirmation for {}: conversation closed", temp_id);
            return None;
        }
        let Some(position) = state.messages.iter().position(|m| m.id == temp_id) else {
            debug!("Temporary message {} is gone, ignoring confirmation", temp_id);
            return None;
        };
        if state.messages[position].status != MessageStatus::Sending {
            debug!("Message {} is no longer sending, ignoring confirmation", temp_id);
            return None;
        }

        let mut merged = confirmed;
        let echo_status = state
            .messages
            .iter()
            .filter(|m| m.same_identity(&merged))
            .map(|m| m.status)
            .max_by_key(|s| s.rank());
        if let Some(status) = echo_status {
            merged.advance_status(status);
        }

        state
            .messages
            .retain(|m| m.id != temp_id && !m.same_identity(&merged));
        state.messages.push(merged.clone());
        sort_newest_first(&mut state.messages);
        self.persist_now(&state.messages).await;
        Some(merged)
    }

    async fn mark_failed(&self, message_id: &str, cause: &ChatError) -> SendFailure {
        let failure = SendFailure::from(cause);
        let mut state = self.state.lock().await;
        if state.closed {
            return failure;
        }
        let updated = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.status == MessageStatus::Sending)
            .map(|m| {
                m.status = MessageStatus::Failed;
                m.error_message = Some(failure.message.clone());
            })
            .is_some();
        if updated {
            self.persist_now(&state.messages).await;
        }
        failure
    }

    /// Fetch the page before the oldest known message.
    ///
    /// Returns how many new messages were added; 0 without a request when a
    /// load is already running or there is nothing more to fetch.
    pub async fn load_older(&self) -> Result<usize> {
        let before = {
            let mut state = self.state.lock().await;
            if state.closed || state.loading_older || !state.has_more {
                return Ok(0);
            }
            state.loading_older = true;
            // local clocks are not server time; page from the oldest confirmed message
            state
                .messages
                .iter()
                .rev()
                .find(|m| !is_temp_id(&m.id))
                .map(|m| m.created_at)
        };

        let limit = self.config.page_size;
        let result = self
            .services
            .api
            .fetch_messages(&self.conversation_id, limit, before)
            .await;

        let mut state = self.state.lock().await;
        state.loading_older = false;
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!("Loading older messages for {} failed: {}", self.conversation_id, e);
                return Err(e);
            }
        };
        if state.closed {
            return Ok(0);
        }

        let fetched = page.messages.len();
        state.has_more = fetched >= limit;

        let mut added = 0;
        for message in page.messages.into_iter().map(Message::from) {
            if state.messages.iter().any(|m| m.same_identity(&message)) {
                continue;
            }
            state.messages.push(message);
            added += 1;
        }
        sort_newest_first(&mut state.messages);
        debug!(
            "Loaded {} older messages for {} ({} new, has_more {})",
            fetched, self.conversation_id, added, state.has_more
        );
        if added > 0 {
            self.persist_later(&state.messages).await;
        }
        Ok(added)
    }

    /// Fetch the newest page and reconcile it with the local window
    pub async fn refresh(&self) -> Result<ReconcileOutcome> {
        let limit = self.config.page_size;
        let page = self
            .services
            .api
            .fetch_messages(&self.conversation_id, limit, None)
            .await?;
        let full_page = page.messages.len() >= limit;
        let server: Vec<Message> = page.messages.into_iter().map(Message::from).collect();

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ChatError::Validation("conversation is closed".to_string()));
        }

        // Only a full page bounds the window; otherwise the server sent everything
        let floor = if full_page {
            server.iter().map(|m| m.created_at).min()
        } else {
            None
        };
        let (window, older): (Vec<Message>, Vec<Message>) =
            state.messages.drain(..).partition(|m| {
                m.server_id.is_none() || floor.map_or(true, |floor| m.created_at >= floor)
            });

        let outcome = self.reconciler.reconcile(&window, &server);
        let kept_older = older.len();
        state.messages = outcome.messages.iter().cloned().chain(older).collect();
        sort_newest_first(&mut state.messages);
        if kept_older == 0 {
            state.has_more = full_page;
        }
        info!(
            "Refreshed {}: {} matched, {} retained, {} dropped",
            self.conversation_id,
            outcome.matches.len(),
            outcome.retained.len(),
            outcome.dropped.len()
        );
        self.persist_now(&state.messages).await;
        Ok(outcome)
    }

    /// Catch up on queue outcomes that were never delivered as receipts.
    ///
    /// A temporary message that left the queue and whose stored copy was
    /// replaced has been confirmed; the server copy is taken from storage.
    /// One whose queue entry ran out of retries is marked failed. Returns
    /// how many timeline entries changed.
    pub async fn reload_pending(&self) -> Result<usize> {
        let stored = self.services.writer.store().load_messages(&self.conversation_id).await?;
        let (queued, max_retries) = match &self.services.queue {
            Some(queue) => (queue.entries().await, queue.max_retries()),
            None => (Vec::new(), 0),
        };

        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(0);
        }

        let before = state.messages.len();
        state.messages.retain(|m| {
            let confirmed_elsewhere = m.status == MessageStatus::Sending
                && is_temp_id(&m.id)
                && !queued.iter().any(|q| q.id == m.id)
                && !stored.iter().any(|s| s.id == m.id);
            !confirmed_elsewhere
        });
        let mut changed = before - state.messages.len();

        for message in stored.into_iter().filter(|m| m.status.is_confirmed()) {
            if !state.messages.iter().any(|m| m.same_identity(&message)) {
                state.messages.push(message);
                changed += 1;
            }
        }

        for entry in queued.iter().filter(|q| q.retry_count >= max_retries) {
            if let Some(message) = state
                .messages
                .iter_mut()
                .find(|m| m.id == entry.id && m.status == MessageStatus::Sending)
            {
                message.status = MessageStatus::Failed;
                message.error_message = Some(format!(
                    "permanently failed after {} retries",
                    entry.retry_count
                ));
                changed += 1;
            }
        }

        if changed > 0 {
            sort_newest_first(&mut state.messages);
            info!("Reloaded {} pending messages for {}", changed, self.conversation_id);
            self.persist_now(&state.messages).await;
        }
        Ok(changed)
    }

    /// Mark incoming messages read and zero the unread counter
    pub async fn mark_read(&self) -> Result<ConversationMetadata> {
        let mut state = self.state.lock().await;
        let user_id = &self.services.session.user_id;
        for message in state.messages.iter_mut().filter(|m| &m.sender_id != user_id) {
            message.advance_status(MessageStatus::Read);
        }
        self.services
            .writer
            .save_now(&self.conversation_id, &state.messages)
            .await
    }

    /// Insert a message pushed by the server unless we already have it
    pub async fn handle_incoming(&self, message: Message) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        if state.messages.iter().any(|m| m.same_identity(&message)) {
            debug!("Skipping duplicate message {}", message.id);
            return false;
        }
        debug!("New message {} from {}", message.id, message.sender_id);
        state.messages.push(message);
        sort_newest_first(&mut state.messages);
        self.persist_later(&state.messages).await;
        true
    }

    /// Forward-only status change for a known message
    pub async fn handle_status_update(&self, message_id: &str, status: MessageStatus) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        let Some(message) = state.messages.iter_mut().find(|m| m.matches_id(message_id)) else {
            debug!("Status update for unknown message {}", message_id);
            return false;
        };
        if !message.advance_status(status) {
            debug!(
                "Ignoring status {:?} for {} (currently {:?})",
                status, message_id, message.status
            );
            return false;
        }
        self.persist_later(&state.messages).await;
        true
    }

    pub async fn handle_event(&self, event: SseEvent) {
        match event {
            SseEvent::Connected => self.set_connected(true).await,
            SseEvent::Disconnected => self.set_connected(false).await,
            SseEvent::Message(message) => {
                self.handle_incoming(message).await;
            }
            SseEvent::StatusUpdate { message_id, status } => {
                self.handle_status_update(&message_id, status).await;
            }
            SseEvent::Error(SseError::ReconnectExhausted { attempts }) => {
                error!(
                    "Live updates for {} stopped after {} attempts",
                    self.conversation_id, attempts
                );
                self.set_connected(false).await;
            }
            SseEvent::Error(e) => warn!("Event stream for {}: {}", self.conversation_id, e),
        }
    }

    async fn set_connected(&self, connected: bool) {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.connected = connected;
        }
    }

    /// Subscribe to live updates and apply them to this timeline
    pub fn attach(self: &Arc<Self>, client: &SseClient) -> Result<()> {
        let (subscription, events) = client.subscribe(&self.conversation_id, &self.services.session.token)?;
        let handle = spawn_event_pump(Arc::downgrade(self), events);
        self.track(handle);
        if let Ok(mut slot) = self.subscription.lock() {
            // replacing drops (and closes) any previous subscription
            *slot = Some(subscription);
        }
        Ok(())
    }

    /// Force the live stream to reconnect now
    pub fn reconnect(&self) {
        if let Ok(slot) = self.subscription.lock() {
            if let Some(subscription) = slot.as_ref() {
                subscription.reconnect();
            }
        }
    }

    /// Stop live updates, cancel background tasks and flush pending writes
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.connected = false;
        }
        if let Ok(mut slot) = self.subscription.lock() {
            if let Some(subscription) = slot.take() {
                subscription.unsubscribe();
            }
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        match self.services.writer.flush(&self.conversation_id).await {
            Ok(true) => debug!("Flushed pending write for {} on close", self.conversation_id),
            Ok(false) => {}
            Err(e) => warn!("Final write for {} failed: {}", self.conversation_id, e),
        }
        info!("Closed conversation {}", self.conversation_id);
    }
}

fn spawn_event_pump(conversation: Weak<Conversation>, mut events: SseEvents) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(conversation) = conversation.upgrade() else {
                break;
            };
            conversation.handle_event(event).await;
        }
        debug!("Event pump finished");
    })
}

fn spawn_receipt_listener(
    conversation: Weak<Conversation>,
    mut receipts: broadcast::Receiver<QueueEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match receipts.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} queue receipts, reloading pending messages", skipped);
                    let Some(conversation) = conversation.upgrade() else {
                        break;
                    };
                    if let Err(e) = conversation.reload_pending().await {
                        warn!("Could not reload pending messages: {}", e);
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(conversation) = conversation.upgrade() else {
                break;
            };
            match event {
                QueueEvent::Sent {
                    conversation_id,
                    temp_id,
                    message,
                } if conversation_id == conversation.conversation_id => {
                    conversation.apply_confirmation(&temp_id, message).await;
                }
                QueueEvent::GaveUp {
                    conversation_id,
                    temp_id,
                    error,
                } if conversation_id == conversation.conversation_id => {
                    conversation.mark_failed(&temp_id, &ChatError::Network(error)).await;
                }
                _ => {}
            }
        }
    })
}
