// Conversation-level persistence on top of a KeyValueStore
//
// Layout:
//   conversation:<id>   -> Message array, newest first
//   conversations:list  -> ConversationMetadata array

use log::{debug, warn};
use std::sync::Arc;

use super::KeyValueStore;
use crate::error::Result;
use crate::models::{sort_newest_first, ConversationMetadata, Message, MessageStatus};

pub const CONVERSATIONS_KEY: &str = "conversations:list";
pub const CONVERSATION_PREFIX: &str = "conversation:";

pub fn conversation_key(conversation_id: &str) -> String {
    format!("{}{}", CONVERSATION_PREFIX, conversation_id)
}

/// Derive the cached summary from a message array.
///
/// `previous` carries state that is not derivable from messages (archived flag).
pub fn compute_metadata(
    conversation_id: &str,
    messages: &[Message],
    current_user_id: &str,
    previous: Option<&ConversationMetadata>,
) -> ConversationMetadata {
    let newest = messages
        .iter()
        .filter(|m| !m.archived)
        .max_by_key(|m| m.created_at);

    let unread_count = messages
        .iter()
        .filter(|m| m.sender_id != current_user_id && m.status != MessageStatus::Read)
        .count();

    ConversationMetadata {
        conversation_id: conversation_id.to_string(),
        last_message: newest.map(|m| m.text.clone()),
        last_message_time: newest.map(|m| m.created_at),
        unread_count,
        archived: previous.map_or(false, |p| p.archived),
    }
}

/// Read-modify-write access to per-conversation message arrays
#[derive(Clone)]
pub struct LocalStore {
    kv: Arc<dyn KeyValueStore>,
    user_id: String,
}

impl LocalStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, user_id: &str) -> Self {
        LocalStore {
            kv,
            user_id: user_id.to_string(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Stored timeline, newest first. Missing or corrupt documents read as empty.
    pub async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let key = conversation_key(conversation_id);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<Message>>(&raw) {
            Ok(mut messages) => {
                sort_newest_first(&mut messages);
                Ok(messages)
            }
            Err(e) => {
                warn!("Discarding corrupt timeline under {}: {}", key, e);
                Ok(Vec::new())
            }
        }
    }

    /// Replace the timeline and recompute its metadata entry
    pub async fn save_messages(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<ConversationMetadata> {
        let mut ordered = messages.to_vec();
        sort_newest_first(&mut ordered);

        let json = serde_json::to_string(&ordered)?;
        self.kv.set(&conversation_key(conversation_id), &json).await?;

        let mut list = self.load_conversations().await?;
        let previous = list.iter().find(|m| m.conversation_id == conversation_id);
        let metadata = compute_metadata(conversation_id, &ordered, &self.user_id, previous);

        match list.iter_mut().find(|m| m.conversation_id == conversation_id) {
            Some(entry) => *entry = metadata.clone(),
            None => list.push(metadata.clone()),
        }
        self.write_conversations(&list).await?;

        debug!(
            "Saved {} messages for conversation {} (unread {})",
            ordered.len(),
            conversation_id,
            metadata.unread_count
        );
        Ok(metadata)
    }

    /// Insert `message`, replacing any entry with the same identity or the id in `replaces`.
    pub async fn upsert_message(
        &self,
        conversation_id: &str,
        message: &Message,
        replaces: Option<&str>,
    ) -> Result<()> {
        let mut messages = self.load_messages(conversation_id).await?;
        messages.retain(|m| {
            !m.same_identity(message) && replaces.map_or(true, |old| !m.matches_id(old))
        });
        messages.push(message.clone());
        self.save_messages(conversation_id, &messages).await?;
        Ok(())
    }

    /// Forward-only status update for a stored message
    pub async fn update_message_status(
        &self,
        conversation_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<bool> {
        let mut messages = self.load_messages(conversation_id).await?;
        let changed = messages
            .iter_mut()
            .find(|m| m.matches_id(message_id))
            .map_or(false, |m| m.advance_status(status));
        if changed {
            self.save_messages(conversation_id, &messages).await?;
        }
        Ok(changed)
    }

    pub async fn load_conversations(&self) -> Result<Vec<ConversationMetadata>> {
        let Some(raw) = self.kv.get(CONVERSATIONS_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(list) => Ok(list),
            Err(e) => {
                warn!("Discarding corrupt conversation list: {}", e);
                Ok(Vec::new())
            }
        }
    }

    pub async fn get_metadata(&self, conversation_id: &str) -> Result<Option<ConversationMetadata>> {
        Ok(self
            .load_conversations()
            .await?
            .into_iter()
            .find(|m| m.conversation_id == conversation_id))
    }

    /// Mark every incoming message read, which zeroes the unread counter
    pub async fn mark_read(&self, conversation_id: &str) -> Result<ConversationMetadata> {
        let mut messages = self.load_messages(conversation_id).await?;
        for message in messages.iter_mut().filter(|m| m.sender_id != self.user_id) {
            message.advance_status(MessageStatus::Read);
        }
        self.save_messages(conversation_id, &messages).await
    }

    pub async fn set_archived(&self, conversation_id: &str, archived: bool) -> Result<()> {
        let mut list = self.load_conversations().await?;
        match list.iter_mut().find(|m| m.conversation_id == conversation_id) {
            Some(entry) => entry.archived = archived,
            None => {
                let mut metadata = compute_metadata(conversation_id, &[], &self.user_id, None);
                metadata.archived = archived;
                list.push(metadata);
            }
        }
        self.write_conversations(&list).await
    }

    /// Drop the timeline and its metadata entry
    pub async fn clear_conversation(&self, conversation_id: &str) -> Result<()> {
        self.kv.remove(&conversation_key(conversation_id)).await?;
        let mut list = self.load_conversations().await?;
        list.retain(|m| m.conversation_id != conversation_id);
        self.write_conversations(&list).await
    }

    async fn write_conversations(&self, list: &[ConversationMetadata]) -> Result<()> {
        let json = serde_json::to_string(list)?;
        self.kv.set(CONVERSATIONS_KEY, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};

    fn message(id: &str, sender: &str, secs: i64, status: MessageStatus) -> Message {
        let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        Message::confirmed(id, format!("text {}", id), sender, at, status)
    }

    fn store() -> (Arc<MemoryStore>, LocalStore) {
        let kv = Arc::new(MemoryStore::new());
        (kv.clone(), LocalStore::new(kv, "me"))
    }

    #[tokio::test]
    async fn test_save_orders_newest_first_and_updates_metadata() {
        let (_kv, store) = store();
        let messages = vec![
            message("a", "me", 0, MessageStatus::Sent),
            message("c", "bob", 20, MessageStatus::Delivered),
            message("b", "bob", 10, MessageStatus::Read),
        ];

        let metadata = store.save_messages("conv1", &messages).await.unwrap();
        assert_eq!(metadata.last_message.as_deref(), Some("text c"));
        assert_eq!(metadata.unread_count, 1);

        let loaded = store.load_messages("conv1").await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let list = store.load_conversations().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0], metadata);
    }

    #[tokio::test]
    async fn test_archived_messages_are_not_last_message() {
        let mut newest = message("z", "bob", 100, MessageStatus::Read);
        newest.archived = true;
        let older = message("y", "bob", 50, MessageStatus::Read);

        let metadata = compute_metadata("c", &[newest, older.clone()], "me", None);
        assert_eq!(metadata.last_message.as_deref(), Some("text y"));
        assert_eq!(metadata.last_message_time, Some(older.created_at));
    }

    #[tokio::test]
    async fn test_archived_flag_survives_saves() {
        let (_kv, store) = store();
        store.set_archived("conv1", true).await.unwrap();
        let metadata = store
            .save_messages("conv1", &[message("a", "bob", 0, MessageStatus::Sent)])
            .await
            .unwrap();
        assert!(metadata.archived);
    }

    #[tokio::test]
    async fn test_upsert_replaces_temporary_entry() {
        let (_kv, store) = store();
        let mut temp = message("temp_1", "me", 0, MessageStatus::Sending);
        temp.server_id = None;
        store.save_messages("conv1", &[temp]).await.unwrap();

        let confirmed = message("srv_1", "me", 0, MessageStatus::Sent);
        store.upsert_message("conv1", &confirmed, Some("temp_1")).await.unwrap();

        let loaded = store.load_messages("conv1").await.unwrap();
        assert_eq!(loaded, vec![confirmed]);
    }

    #[tokio::test]
    async fn test_status_updates_never_regress() {
        let (_kv, store) = store();
        store
            .save_messages("conv1", &[message("m1", "me", 0, MessageStatus::Read)])
            .await
            .unwrap();

        let changed = store
            .update_message_status("conv1", "m1", MessageStatus::Delivered)
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(store.load_messages("conv1").await.unwrap()[0].status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_mark_read_zeroes_unread() {
        let (_kv, store) = store();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let messages = vec![
            Message::confirmed("1", "hey", "bob", at, MessageStatus::Delivered),
            Message::confirmed("2", "there", "bob", at + Duration::seconds(1), MessageStatus::Sent),
        ];
        store.save_messages("conv1", &messages).await.unwrap();
        assert_eq!(store.get_metadata("conv1").await.unwrap().unwrap().unread_count, 2);

        let metadata = store.mark_read("conv1").await.unwrap();
        assert_eq!(metadata.unread_count, 0);
    }

    #[tokio::test]
    async fn test_corrupt_document_reads_as_empty() {
        let (kv, store) = store();
        kv.set(&conversation_key("conv1"), "{not json").await.unwrap();
        assert!(store.load_messages("conv1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_conversation() {
        let (_kv, store) = store();
        store
            .save_messages("conv1", &[message("a", "bob", 0, MessageStatus::Sent)])
            .await
            .unwrap();
        store.clear_conversation("conv1").await.unwrap();
        assert!(store.load_messages("conv1").await.unwrap().is_empty());
        assert!(store.get_metadata("conv1").await.unwrap().is_none());
    }
}
