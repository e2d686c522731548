// Common test utilities for integration tests
// Mock API, scripted event-stream transport, and a wired-up client harness
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use log::{info, LevelFilter};
use tokio::sync::mpsc;
use url::Url;

use parley::api::{HistoryMessage, MessagePage, SendMessageRequest, SendMessageResponse};
use parley::config::{ConversationConfig, QueueConfig, SseConfig};
use parley::error::{ChatError, Result};
use parley::sse::{ByteStream, SseTransport};
use parley::{
    Conversation, ConversationServices, DebouncedWriter, LocalStore, MemoryStore, Message,
    MessageApi, MessageStatus, NetworkMonitor, OfflineQueue, Session, SseEvent, SseEvents,
};

pub const USER_ID: &str = "me";
pub const CONVERSATION_ID: &str = "conv-1";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Fixed instant plus `secs`, so ordering in assertions is deterministic
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// In-memory stand-in for the REST API
#[derive(Default)]
pub struct MockApi {
    history: Mutex<Vec<Message>>,
    pub fail_sends: AtomicBool,
    pub sends: AtomicUsize,
    pub fetches: AtomicUsize,
    echo: Mutex<Option<(Weak<Conversation>, MessageStatus)>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(MockApi::default())
    }

    /// Put `count` messages from `sender` on the server, one second apart
    pub fn seed(&self, count: usize, sender: &str) {
        let mut history = self.history.lock().unwrap();
        for i in 0..count {
            history.push(Message::confirmed(
                format!("hist_{}", i),
                format!("history {}", i),
                sender,
                at(i as i64),
                MessageStatus::Delivered,
            ));
        }
    }

    pub fn push_history(&self, message: Message) {
        self.history.lock().unwrap().push(message);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    /// Push the stream echo of each accepted message into `conversation`
    /// before the send call returns
    pub fn echo_before_reply(&self, conversation: &Arc<Conversation>, status: MessageStatus) {
        *self.echo.lock().unwrap() = Some((Arc::downgrade(conversation), status));
    }
}

#[async_trait]
impl MessageApi for MockApi {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Network("simulated outage".to_string()));
        }
        let message = Message::confirmed(
            format!("srv_{}", n),
            request.text.clone(),
            request.sender_id.clone(),
            Utc::now(),
            MessageStatus::Sent,
        );
        self.history.lock().unwrap().push(message.clone());
        info!("MockApi accepted {} as {}", request.text, message.id);

        let echo = self.echo.lock().unwrap().clone();
        if let Some((conversation, status)) = echo {
            if let Some(conversation) = conversation.upgrade() {
                let mut echoed = message.clone();
                echoed.status = status;
                conversation.handle_incoming(echoed).await;
            }
        }
        Ok(SendMessageResponse {
            message_id: message.id,
            conversation_id: request.conversation_id.clone(),
            text: message.text,
            sender_id: message.sender_id,
            created_at: message.created_at,
            status: MessageStatus::Sent,
        })
    }

    async fn fetch_messages(
        &self,
        _conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<MessagePage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut older: Vec<Message> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|m| before.map_or(true, |before| m.created_at < before))
            .cloned()
            .collect();
        older.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let has_more = older.len() > limit;
        let messages = older
            .into_iter()
            .take(limit)
            .map(|m| HistoryMessage {
                id: m.id,
                text: m.text,
                sender_id: m.sender_id,
                created_at: m.created_at,
                status: m.status,
            })
            .collect();
        Ok(MessagePage { messages, has_more })
    }
}

type Connection = std::result::Result<mpsc::UnboundedReceiver<Result<Vec<u8>>>, String>;

/// Transport that plays back queued connection outcomes in order
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Connection>>,
    pub opens: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedTransport::default())
    }

    /// Next open succeeds; bytes sent on the returned sender arrive on the stream
    pub fn push_stream(&self) -> mpsc::UnboundedSender<Result<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().push_back(Ok(rx));
        tx
    }

    /// Next open fails
    pub fn push_failure(&self, reason: &str) {
        self.script.lock().unwrap().push_back(Err(reason.to_string()));
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SseTransport for ScriptedTransport {
    async fn open(&self, _url: &Url) -> Result<ByteStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(rx)) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Some(Err(reason)) => Err(ChatError::Connection(reason)),
            None => Err(ChatError::Connection("no scripted connection left".to_string())),
        }
    }
}

/// One wire-format event
pub fn sse_frame(event: &str, data: &str) -> Result<Vec<u8>> {
    Ok(format!("event: {}\ndata: {}\n\n", event, data).into_bytes())
}

/// Event-stream settings with short delays and no jitter
pub fn fast_sse_config(max_attempts: u32) -> SseConfig {
    SseConfig {
        base_delay_ms: 10,
        max_delay_ms: 40,
        max_jitter_ms: 0,
        max_reconnect_attempts: max_attempts,
        heartbeat_interval_ms: 60_000,
        stale_after_ms: 120_000,
        background_grace_ms: 50,
        event_buffer: 16,
    }
}

/// Every client component wired up over memory storage and the mock API
pub struct Harness {
    pub kv: Arc<MemoryStore>,
    pub store: LocalStore,
    pub writer: DebouncedWriter,
    pub api: Arc<MockApi>,
    pub network: Arc<NetworkMonitor>,
    pub queue: Arc<OfflineQueue>,
}

impl Harness {
    pub async fn new(online: bool, queue_config: QueueConfig) -> Self {
        setup_logging();
        let kv = Arc::new(MemoryStore::new());
        let store = LocalStore::new(kv.clone(), USER_ID);
        let writer = DebouncedWriter::new(store.clone(), Duration::from_millis(20));
        let api = MockApi::new();
        let network = NetworkMonitor::new(online);
        let queue = OfflineQueue::load(kv.clone(), store.clone(), api.clone(), network.clone(), queue_config).await;
        Harness {
            kv,
            store,
            writer,
            api,
            network,
            queue,
        }
    }

    pub fn session(&self) -> Session {
        Session::new(USER_ID, "test-token", "http://chat.test")
    }

    pub fn services(&self) -> ConversationServices {
        ConversationServices {
            session: self.session(),
            api: self.api.clone(),
            writer: self.writer.clone(),
            network: self.network.clone(),
            queue: Some(self.queue.clone()),
        }
    }

    pub async fn open(&self) -> Arc<Conversation> {
        Conversation::open(CONVERSATION_ID, self.services(), ConversationConfig::default()).await
    }
}

pub fn fast_queue_config(max_size: usize) -> QueueConfig {
    QueueConfig {
        max_size,
        max_retries: 3,
        retry_delay_ms: 10,
    }
}

/// Poll the timeline until `predicate` holds or two seconds pass
pub async fn wait_for_messages<F>(conversation: &Conversation, predicate: F) -> Vec<Message>
where
    F: Fn(&[Message]) -> bool,
{
    for _ in 0..200 {
        let messages = conversation.messages().await;
        if predicate(&messages) {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    conversation.messages().await
}

/// Receive the next event or give up after a second
pub async fn next_event(events: &mut SseEvents) -> Option<SseEvent> {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .ok()
        .flatten()
}
