// REST API used by the delivery pipeline: send a message, page through history

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::models::{Message, MessageStatus, Session};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub text: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message_id: String,
    pub conversation_id: String,
    pub text: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_sent")]
    pub status: MessageStatus,
}

fn default_sent() -> MessageStatus {
    MessageStatus::Sent
}

impl SendMessageResponse {
    /// The server-confirmed message this response describes
    pub fn into_message(self) -> Message {
        Message::confirmed(
            self.message_id,
            self.text,
            self.sender_id,
            self.created_at,
            self.status,
        )
    }
}

/// History entry as returned by `GET /api/messages`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    #[serde(alias = "_id", alias = "messageId")]
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_sent")]
    pub status: MessageStatus,
}

impl From<HistoryMessage> for Message {
    fn from(m: HistoryMessage) -> Self {
        Message::confirmed(m.id, m.text, m.sender_id, m.created_at, m.status)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub has_more: bool,
}

/// The calls the conversation controller and queue flusher make
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse>;

    /// Up to `limit` messages strictly older than `before`, newest first
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<MessagePage>;
}

/// `MessageApi` over HTTP with bearer auth
pub struct HttpApi {
    client: reqwest::Client,
    session: Session,
}

impl HttpApi {
    pub fn new(session: Session, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Network(format!("HTTP client: {}", e)))?;
        Ok(HttpApi { client, session })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.session.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").or_else(|| v.get("message")).cloned())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        error!("API request failed with HTTP {}: {}", status, message);
        Err(ChatError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl MessageApi for HttpApi {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        debug!("POST /api/messages/send for conversation {}", request.conversation_id);
        let resp = self
            .client
            .post(self.url("/api/messages/send"))
            .bearer_auth(&self.session.token)
            .json(request)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<SendMessageResponse>().await?)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<MessagePage> {
        let mut query: Vec<(&str, String)> = vec![
            ("conversationId", conversation_id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339()));
        }
        debug!("GET /api/messages for {} (limit {}, before {:?})", conversation_id, limit, before);
        let resp = self
            .client
            .get(self.url("/api/messages"))
            .bearer_auth(&self.session.token)
            .query(&query)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<MessagePage>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_response_becomes_confirmed_message() {
        let json = r#"{
            "messageId": "srv-9",
            "conversationId": "c1",
            "text": "hi",
            "senderId": "me",
            "createdAt": "2024-05-01T10:00:00.000Z",
            "status": "sent"
        }"#;
        let response: SendMessageResponse = serde_json::from_str(json).unwrap();
        let message = response.into_message();
        assert_eq!(message.id, "srv-9");
        assert_eq!(message.server_id.as_deref(), Some("srv-9"));
        assert_eq!(message.status, MessageStatus::Sent);
    }

    #[test]
    fn test_history_page_accepts_mongo_ids() {
        let json = r#"{
            "messages": [
                {"_id": "a", "text": "x", "senderId": "bob", "createdAt": "2024-05-01T10:00:00Z"},
                {"id": "b", "text": "y", "senderId": "me", "createdAt": "2024-05-01T09:00:00Z", "status": "read"}
            ],
            "hasMore": true
        }"#;
        let page: MessagePage = serde_json::from_str(json).unwrap();
        assert!(page.has_more);
        assert_eq!(page.messages[0].id, "a");
        assert_eq!(page.messages[0].status, MessageStatus::Sent);
        assert_eq!(Message::from(page.messages[1].clone()).status, MessageStatus::Read);
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let request = SendMessageRequest {
            conversation_id: "c1".into(),
            text: "hi".into(),
            sender_id: "me".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["senderId"], "me");
    }
}
