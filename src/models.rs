// Core data model shared by the store, queue, SSE client and conversation controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of a message as seen by this client
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,   // Optimistically shown, not yet confirmed
    Sent,      // Accepted by the server
    Delivered, // Delivered to the recipient's device
    Read,      // Read by the recipient
    Failed,    // Send failed, retry offered
}

impl MessageStatus {
    /// Ordering used to keep status updates forward-only.
    /// Sending and Failed share the bottom rank: neither is server-confirmed.
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending | MessageStatus::Failed => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
        }
    }

    /// Whether the server has acknowledged the message
    pub fn is_confirmed(self) -> bool {
        self.rank() > 0
    }

    /// Explicit state machine for locally driven transitions.
    ///
    /// Delivered/Read are only reachable once the message has been Sent.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sending, Sent)
                | (Sending, Failed)
                | (Failed, Sending)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Delivered, Read)
        )
    }

    /// Parse the loose status strings the server emits
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sending" | "pending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" | "seen" => Some(MessageStatus::Read),
            "failed" | "error" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// A message in a conversation timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Message {
    /// Build a message that already exists on the server
    pub fn confirmed(
        id: impl Into<String>,
        text: impl Into<String>,
        sender_id: impl Into<String>,
        created_at: DateTime<Utc>,
        status: MessageStatus,
    ) -> Self {
        let id = id.into();
        Message {
            server_id: Some(id.clone()),
            id,
            text: text.into(),
            sender_id: sender_id.into(),
            created_at,
            status,
            archived: false,
            error_message: None,
        }
    }

    /// True when `key` names this message by its local or server identity
    pub fn matches_id(&self, key: &str) -> bool {
        self.id == key || self.server_id.as_deref() == Some(key)
    }

    /// True when both messages share any identity
    pub fn same_identity(&self, other: &Message) -> bool {
        self.matches_id(&other.id)
            || other
                .server_id
                .as_deref()
                .map_or(false, |server_id| self.matches_id(server_id))
    }

    /// Apply a server status update. Returns false when the update would regress.
    pub fn advance_status(&mut self, status: MessageStatus) -> bool {
        if !self.status.is_confirmed() || status.rank() <= self.status.rank() {
            return false;
        }
        self.status = status;
        true
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Sort newest first, the order timelines are kept and persisted in
pub fn sort_newest_first(messages: &mut [Message]) {
    messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}

/// Status of an entry in the offline queue
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Sending,
    Failed,
}

/// An outgoing message waiting for connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    pub local_timestamp: i64,
    pub retry_count: u32,
    pub status: QueueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedMessage {
    /// Queue entry for an optimistic message that could not be sent
    pub fn from_message(conversation_id: &str, message: &Message) -> Self {
        QueuedMessage {
            id: message.id.clone(),
            conversation_id: conversation_id.to_string(),
            text: message.text.clone(),
            sender_id: message.sender_id.clone(),
            created_at: message.created_at,
            local_timestamp: Utc::now().timestamp_millis(),
            retry_count: 0,
            status: QueueStatus::Queued,
            last_error: None,
        }
    }
}

/// Cached per-conversation summary, recomputed on every save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: usize,
    #[serde(default)]
    pub archived: bool,
}

/// Who we are and where we talk to. Passed explicitly to every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub token: String,
    pub base_url: String,
}

impl Session {
    pub fn new(user_id: &str, token: &str, base_url: &str) -> Self {
        Session {
            user_id: user_id.to_string(),
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}
