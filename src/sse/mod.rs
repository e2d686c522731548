// Server-Sent Events client
// One live stream per conversation with backoff reconnection, stale-stream
// detection, and background/foreground handling.

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

pub mod backoff;
pub mod ingress;
pub mod parser;
pub mod transport;

pub use backoff::Backoff;
pub use transport::{ByteStream, HttpTransport, SseTransport};

use crate::config::SseConfig;
use crate::error::{ChatError, Result};
use crate::models::{Message, MessageStatus};
use crate::network::AppLifecycle;
use parser::{SseDecoder, SseFrame};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SseError {
    /// Payload could not be normalized; the stream stays up
    #[error("malformed event payload: {0}")]
    Parse(String),

    #[error("event stream connection failed: {0}")]
    Connection(String),

    /// Terminal: no further reconnects will be attempted
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Everything a subscriber hears about
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Connected,
    Message(Message),
    StatusUpdate {
        message_id: String,
        status: MessageStatus,
    },
    Error(SseError),
    Disconnected,
}

struct Shared {
    connected: AtomicBool,
    closed: AtomicBool,
    reconnect: Notify,
}

/// Why a live connection ended
#[derive(Debug)]
enum StreamEnd {
    Closed,
    Failed(String),
    Stale,
    Manual,
    Backgrounded,
}

#[derive(Clone)]
struct StreamWorker {
    url: Url,
    conversation_id: String,
    transport: Arc<dyn SseTransport>,
    config: SseConfig,
    backoff: Backoff,
    shared: Arc<Shared>,
    events: mpsc::Sender<SseEvent>,
    lifecycle: Option<watch::Receiver<AppLifecycle>>,
}

impl StreamWorker {
    /// Emit unless the subscription was closed
    async fn emit(&self, event: SseEvent) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.events.send(event).await.is_ok()
    }

    fn in_background(&self) -> bool {
        self.lifecycle
            .as_ref()
            .map_or(false, |rx| *rx.borrow() == AppLifecycle::Background)
    }

    async fn wait_for_foreground(&mut self) {
        if let Some(rx) = self.lifecycle.as_mut() {
            while *rx.borrow_and_update() == AppLifecycle::Background {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.shared.closed.load(Ordering::SeqCst) || self.events.is_closed() {
                break;
            }
            if self.in_background() {
                debug!("App in background, holding stream for {}", self.conversation_id);
                self.wait_for_foreground().await;
                attempt = 0;
                continue;
            }

            match self.transport.open(&self.url).await {
                Ok(stream) => {
                    attempt = 0;
                    self.shared.connected.store(true, Ordering::SeqCst);
                    info!("Event stream connected for conversation {}", self.conversation_id);
                    if !self.emit(SseEvent::Connected).await {
                        break;
                    }

                    let reason = self.pump(stream).await;
                    self.shared.connected.store(false, Ordering::SeqCst);
                    if self.shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    self.emit(SseEvent::Disconnected).await;

                    match reason {
                        StreamEnd::Manual => {
                            info!("Manual reconnect for {}", self.conversation_id);
                            continue;
                        }
                        StreamEnd::Stale => {
                            warn!("Event stream for {} went stale, reconnecting", self.conversation_id);
                            continue;
                        }
                        StreamEnd::Backgrounded => {
                            info!("Disconnected {} while in background", self.conversation_id);
                            continue;
                        }
                        StreamEnd::Closed => {
                            warn!("Event stream for {} closed by server", self.conversation_id);
                        }
                        StreamEnd::Failed(e) => {
                            warn!("Event stream for {} failed: {}", self.conversation_id, e);
                            self.emit(SseEvent::Error(SseError::Connection(e))).await;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to open event stream for {}: {}", self.conversation_id, e);
                    self.emit(SseEvent::Error(SseError::Connection(e.to_string()))).await;
                }
            }

            if self.backoff.exhausted(attempt) {
                error!(
                    "Giving up on event stream for {} after {} attempts",
                    self.conversation_id, attempt
                );
                self.emit(SseEvent::Error(SseError::ReconnectExhausted { attempts: attempt }))
                    .await;
                break;
            }

            let delay = self.backoff.delay(attempt);
            attempt += 1;
            info!(
                "Reconnecting {} in {:?} (attempt {}/{})",
                self.conversation_id,
                delay,
                attempt,
                self.backoff.max_attempts()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shared.reconnect.notified() => {
                    attempt = 0;
                }
            }
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        debug!("Event stream worker for {} stopped", self.conversation_id);
    }

    /// Read one connection until it drops
    async fn pump(&self, mut stream: ByteStream) -> StreamEnd {
        let mut decoder = SseDecoder::new();
        let mut last_activity = Instant::now();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;
        let stale_after = self.config.stale_after();
        let grace = self.config.background_grace();
        let mut background_since: Option<Instant> = None;
        let mut lifecycle = self.lifecycle.clone();

        loop {
            let grace_deadline = background_since.map(|since| since + grace);
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        last_activity = Instant::now();
                        for frame in decoder.feed(&bytes) {
                            if !self.handle_frame(frame).await {
                                return StreamEnd::Closed;
                            }
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Failed(e.to_string()),
                    None => return StreamEnd::Closed,
                },
                _ = heartbeat.tick() => {
                    if last_activity.elapsed() > stale_after {
                        return StreamEnd::Stale;
                    }
                }
                _ = self.shared.reconnect.notified() => return StreamEnd::Manual,
                state = next_lifecycle(&mut lifecycle) => {
                    background_since = match state {
                        AppLifecycle::Background => background_since.or_else(|| Some(Instant::now())),
                        AppLifecycle::Foreground => None,
                    };
                }
                _ = tokio::time::sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => {
                    return StreamEnd::Backgrounded;
                }
            }
        }
    }

    /// Returns false once nobody is listening any more
    async fn handle_frame(&self, frame: SseFrame) -> bool {
        let raw = match frame {
            SseFrame::Comment(_) => return true,
            SseFrame::Event(raw) => raw,
        };
        match ingress::interpret(&raw) {
            None => true,
            Some(Ok(event)) => self.emit(event).await,
            Some(Err(e)) => {
                warn!("Dropping '{}' event for {}: {}", raw.event, self.conversation_id, e);
                self.emit(SseEvent::Error(e)).await
            }
        }
    }
}

async fn next_lifecycle(rx: &mut Option<watch::Receiver<AppLifecycle>>) -> AppLifecycle {
    match rx.as_mut() {
        Some(rx) => match rx.changed().await {
            Ok(()) => *rx.borrow_and_update(),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Handle returned by `SseClient::subscribe`
pub struct SseSubscription {
    conversation_id: String,
    shared: Arc<Shared>,
    template: Mutex<Option<StreamWorker>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SseSubscription {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Drop the current connection and reconnect now with a fresh attempt
    /// counter. Restarts the worker if it had given up.
    pub fn reconnect(&self) {
        if self.is_closed() {
            return;
        }
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        let finished = task.as_ref().map_or(true, |handle| handle.is_finished());
        if finished {
            let template = self.template.lock().ok().and_then(|t| t.clone());
            if let Some(worker) = template {
                info!("Restarting event stream worker for {}", self.conversation_id);
                *task = Some(tokio::spawn(worker.run()));
            }
        } else {
            self.shared.reconnect.notify_one();
        }
    }

    /// Close the stream. Idempotent; no events are emitted afterwards.
    pub fn unsubscribe(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        if let Ok(mut template) = self.template.lock() {
            template.take();
        }
        info!("Unsubscribed from event stream for {}", self.conversation_id);
    }
}

impl Drop for SseSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Receiving half of a subscription. Yields nothing once unsubscribed,
/// including events still buffered at that point.
pub struct SseEvents {
    rx: mpsc::Receiver<SseEvent>,
    shared: Arc<Shared>,
}

impl SseEvents {
    pub async fn recv(&mut self) -> Option<SseEvent> {
        if self.shared.closed.load(Ordering::SeqCst) {
            self.rx.close();
            return None;
        }
        let event = self.rx.recv().await?;
        if self.shared.closed.load(Ordering::SeqCst) {
            self.rx.close();
            return None;
        }
        Some(event)
    }
}

/// Factory for per-conversation subscriptions
pub struct SseClient {
    base_url: String,
    transport: Arc<dyn SseTransport>,
    config: SseConfig,
    lifecycle: Option<watch::Receiver<AppLifecycle>>,
}

impl SseClient {
    pub fn new(base_url: &str, transport: Arc<dyn SseTransport>, config: SseConfig) -> Self {
        SseClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
            config,
            lifecycle: None,
        }
    }

    /// Follow app lifecycle: disconnect after a grace delay in background, reconnect on foreground
    pub fn with_lifecycle(mut self, lifecycle: watch::Receiver<AppLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// `GET /api/sse?conversationId=..&token=..`; the transport cannot carry headers
    pub fn stream_url(&self, conversation_id: &str, token: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/api/sse", self.base_url))
            .map_err(|e| ChatError::Connection(format!("invalid base url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("conversationId", conversation_id)
            .append_pair("token", token);
        Ok(url)
    }

    /// Start streaming events for one conversation
    pub fn subscribe(
        &self,
        conversation_id: &str,
        token: &str,
    ) -> Result<(SseSubscription, SseEvents)> {
        let url = self.stream_url(conversation_id, token)?;
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnect: Notify::new(),
        });

        let worker = StreamWorker {
            url,
            conversation_id: conversation_id.to_string(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            backoff: Backoff::from_config(&self.config),
            shared: shared.clone(),
            events: events_tx,
            lifecycle: self.lifecycle.clone(),
        };

        let task = tokio::spawn(worker.clone().run());
        info!("Subscribed to event stream for conversation {}", conversation_id);

        Ok((
            SseSubscription {
                conversation_id: conversation_id.to_string(),
                shared: shared.clone(),
                template: Mutex::new(Some(worker)),
                task: Mutex::new(Some(task)),
            },
            SseEvents {
                rx: events_rx,
                shared,
            },
        ))
    }
}
