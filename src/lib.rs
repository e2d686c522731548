// Client-side message delivery pipeline: live events, offline queue,
// reconciliation and local persistence for chat conversations.
pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod models;
pub mod network;
pub mod queue;
pub mod reconcile;
pub mod sse;
pub mod storage;

// Re-export main types for convenience
pub use api::{HttpApi, MessageApi};
pub use config::ClientConfig;
pub use conversation::{Conversation, ConversationServices};
pub use error::{ChatError, SendFailure};
pub use models::*;
pub use network::{AppLifecycle, NetworkMonitor};
pub use queue::{FlushSummary, OfflineQueue, QueueEvent};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use sse::{SseClient, SseEvent, SseEvents, SseSubscription};
pub use storage::{DebouncedWriter, KeyValueStore, LocalStore, MemoryStore, SqliteStore};
