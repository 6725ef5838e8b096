use super::broker::Broker;
use super::chat::{ChatService, RoomRepository};
use super::presence::PresenceTracker;
use crate::error::ComposerError;
use crate::models::{room_channel, ChannelName, NotificationEnvelope, PresenceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub const USER_JOINED: &str = "user_joined";
pub const USER_LEFT: &str = "user_left";
pub const NEW_MESSAGE: &str = "new_message";
pub const FOCUS_STARTED: &str = "focus_started";
pub const FOCUS_ENDED: &str = "focus_ended";

/// Event published on `room:{room_id}:events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub room_id: String,
    pub user_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl RoomEvent {
    fn new(event_type: &str, room_id: &str, user_id: &str, data: Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    fn title(&self) -> String {
        match self.event_type.as_str() {
            USER_JOINED => format!("{} joined the room", self.user_id),
            USER_LEFT => format!("{} left the room", self.user_id),
            NEW_MESSAGE => format!("New message from {}", self.user_id),
            FOCUS_STARTED => format!("{} started focusing", self.user_id),
            FOCUS_ENDED => format!("{} finished focusing", self.user_id),
            other => other.to_string(),
        }
    }
}

/// Orchestrates room actions: presence change or chat write, then event publish.
#[derive(Clone)]
pub struct RoomEventComposer {
    presence: PresenceTracker,
    chat: Arc<dyn ChatService>,
    rooms: Arc<dyn RoomRepository>,
    broker: Arc<dyn Broker>,
}

impl RoomEventComposer {
    pub fn new(
        presence: PresenceTracker,
        chat: Arc<dyn ChatService>,
        rooms: Arc<dyn RoomRepository>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            presence,
            chat,
            rooms,
            broker,
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub async fn join(&self, room_id: &str, user_id: &str) -> Result<RoomEvent, ComposerError> {
        if !self.rooms.room_exists(room_id).await? {
            return Err(ComposerError::RoomNotFound(room_id.to_string()));
        }

        self.presence.join(room_id, user_id).await?;
        let online = self.presence.get_online_users(room_id).await?;
        let event = RoomEvent::new(
            USER_JOINED,
            room_id,
            user_id,
            json!({
                "room_id": room_id,
                "user_id": user_id,
                "participant_count": online.len(),
                "online_users": online,
            }),
        );
        self.publish(&event, &online).await?;
        Ok(event)
    }

    pub async fn leave(&self, room_id: &str, user_id: &str) -> Result<RoomEvent, ComposerError> {
        self.presence.leave(room_id, user_id).await?;
        let online = self.presence.get_online_users(room_id).await?;
        let event = RoomEvent::new(
            USER_LEFT,
            room_id,
            user_id,
            json!({
                "room_id": room_id,
                "user_id": user_id,
                "participant_count": online.len(),
                "online_users": online,
            }),
        );
        self.publish(&event, &online).await?;
        Ok(event)
    }

    /// Persist through the chat service; publish only if it accepted the message.
    pub async fn send_message(
        &self,
        room_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<RoomEvent, ComposerError> {
        let message = self.chat.send_message(room_id, user_id, content).await?;
        let online = self.presence.get_online_users(room_id).await?;
        let event = RoomEvent::new(NEW_MESSAGE, room_id, user_id, json!({ "message": message }));
        self.publish(&event, &online).await?;
        Ok(event)
    }

    pub async fn focus_start(
        &self,
        room_id: &str,
        user_id: &str,
        duration: Option<Value>,
    ) -> Result<RoomEvent, ComposerError> {
        self.focus(room_id, user_id, PresenceStatus::Focusing, FOCUS_STARTED, duration)
            .await
    }

    pub async fn focus_end(
        &self,
        room_id: &str,
        user_id: &str,
        duration: Option<Value>,
    ) -> Result<RoomEvent, ComposerError> {
        self.focus(room_id, user_id, PresenceStatus::Online, FOCUS_ENDED, duration)
            .await
    }

    async fn focus(
        &self,
        room_id: &str,
        user_id: &str,
        status: PresenceStatus,
        event_type: &str,
        duration: Option<Value>,
    ) -> Result<RoomEvent, ComposerError> {
        self.presence.update_status(room_id, user_id, status).await?;
        let online = self.presence.get_online_users(room_id).await?;
        let event = RoomEvent::new(
            event_type,
            room_id,
            user_id,
            json!({
                "room_id": room_id,
                "user_id": user_id,
                "status": status,
                "duration": duration.unwrap_or(Value::Null),
            }),
        );
        self.publish(&event, &online).await?;
        Ok(event)
    }

    /// Publish on the room channel, then copy to each member's user channel.
    ///
    /// The room channel publish must succeed; per-member copies are best-effort.
    async fn publish(&self, event: &RoomEvent, members: &[String]) -> Result<(), ComposerError> {
        let payload = serde_json::to_string(event).map_err(crate::error::BrokerError::from)?;
        self.broker
            .publish(&room_channel(&event.room_id), &payload)
            .await?;

        let data = serde_json::to_value(event).map_err(crate::error::BrokerError::from)?;
        for member in members {
            let envelope = NotificationEnvelope::new(
                format!("{}:{}", event.event_id, member),
                member.clone(),
                event.event_type.clone(),
                event.title(),
                "",
            )
            .with_data(data.clone());

            let channel = ChannelName::user(member.clone());
            let result = match serde_json::to_string(&envelope) {
                Ok(body) => self.broker.publish(&channel.to_string(), &body).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                tracing::warn!(room_id = %event.room_id, user_id = %member, error = %e, "failed to fan out room event");
            }
        }

        tracing::debug!(
            room_id = %event.room_id,
            event_type = %event.event_type,
            recipients = members.len(),
            "room event published"
        );
        Ok(())
    }
}
