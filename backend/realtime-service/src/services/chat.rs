/// Chat collaborators used by room orchestration
use crate::error::ChatError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Validates, sanitizes and persists chat messages.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn send_message(
        &self,
        room_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ChatError>;
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn room_exists(&self, room_id: &str) -> Result<bool, ChatError>;
    async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, ChatError>;
}

/// Trim and drop control characters other than line breaks and tabs.
pub fn sanitize_message(content: &str) -> String {
    content
        .trim()
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect()
}

#[derive(Debug, Default)]
struct Room {
    members: HashSet<String>,
    messages: Vec<ChatMessage>,
}

/// Room store kept in memory.
#[derive(Debug)]
pub struct InMemoryChatService {
    max_message_length: usize,
    rooms: RwLock<HashMap<String, Room>>,
}

impl InMemoryChatService {
    pub fn new(max_message_length: usize) -> Self {
        Self {
            max_message_length,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_room<I, S>(&self, room_id: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        room.members.extend(members.into_iter().map(Into::into));
    }

    pub async fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), ChatError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;
        room.members.insert(user_id.to_string());
        Ok(())
    }

    pub async fn messages(&self, room_id: &str) -> Vec<ChatMessage> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatService for InMemoryChatService {
    async fn send_message(
        &self,
        room_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let content = sanitize_message(content);
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if content.chars().count() > self.max_message_length {
            return Err(ChatError::TooLong {
                max: self.max_message_length,
            });
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;
        if !room.members.contains(user_id) {
            return Err(ChatError::NotMember {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            content,
            created_at: Utc::now(),
        };
        room.messages.push(message.clone());
        Ok(message)
    }
}

#[async_trait]
impl RoomRepository for InMemoryChatService {
    async fn room_exists(&self, room_id: &str) -> Result<bool, ChatError> {
        Ok(self.rooms.read().await.contains_key(room_id))
    }

    async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, ChatError> {
        Ok(self
            .rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.members.contains(user_id))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_controls() {
        assert_eq!(sanitize_message("  hi\u{0007} there\n "), "hi there");
        assert_eq!(sanitize_message("a\nb\tc"), "a\nb\tc");
    }

    #[tokio::test]
    async fn send_message_validates_and_persists() {
        let chat = InMemoryChatService::new(10);
        chat.create_room("r1", ["u1"]).await;

        assert_eq!(
            chat.send_message("r1", "u1", "   ").await,
            Err(ChatError::EmptyMessage)
        );
        assert_eq!(
            chat.send_message("r1", "u1", "this is far too long").await,
            Err(ChatError::TooLong { max: 10 })
        );
        assert!(matches!(
            chat.send_message("r1", "u9", "hi").await,
            Err(ChatError::NotMember { .. })
        ));
        assert!(matches!(
            chat.send_message("r404", "u1", "hi").await,
            Err(ChatError::RoomNotFound(_))
        ));

        let message = chat.send_message("r1", "u1", " hello ").await.unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(chat.messages("r1").await.len(), 1);
    }

    #[tokio::test]
    async fn membership_queries() {
        let chat = InMemoryChatService::new(100);
        chat.create_room("r1", ["u1"]).await;
        chat.add_member("r1", "u2").await.unwrap();

        assert!(chat.room_exists("r1").await.unwrap());
        assert!(!chat.room_exists("r2").await.unwrap());
        assert!(chat.is_member("r1", "u2").await.unwrap());
        assert!(!chat.is_member("r1", "u3").await.unwrap());
        assert!(chat.add_member("r2", "u1").await.is_err());
    }
}
