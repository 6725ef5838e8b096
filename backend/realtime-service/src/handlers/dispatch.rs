/// Inbound message dispatch for one authenticated session
///
/// | type              | reply                   |
/// |-------------------|-------------------------|
/// | ping              | pong                    |
/// | subscribe         | subscribed {topics}     |
/// | unsubscribe       | unsubscribed {topics}   |
/// | mark_read         | marked_read {id}        |
/// | ack               | none                    |
/// | join_room         | room_joined             |
/// | leave_room        | room_left               |
/// | send_message      | message_sent            |
/// | focus_start       | focus_started           |
/// | focus_end         | focus_ended             |
/// | presence_refresh  | presence_refreshed      |
/// | anything else     | error                   |
use crate::error::DispatchError;
use crate::models::Identity;
use crate::services::RoomEventComposer;
use crate::websocket::{InboundEnvelope, OutboundEnvelope};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
struct TopicsPayload {
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MarkReadPayload {
    notification_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct AckPayload {
    #[serde(default)]
    notification_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoomPayload {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    room_id: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct FocusPayload {
    room_id: String,
    #[serde(default)]
    duration: Option<Value>,
}

fn payload<T: DeserializeOwned>(inbound: &InboundEnvelope) -> Result<T, DispatchError> {
    let raw = if inbound.payload.is_null() {
        json!({})
    } else {
        inbound.payload.clone()
    };
    serde_json::from_value(raw)
        .map_err(|e| DispatchError::Malformed(format!("{} payload: {e}", inbound.message_type)))
}

fn non_empty(field: &str, value: &str) -> Result<(), DispatchError> {
    if value.trim().is_empty() {
        return Err(DispatchError::Malformed(format!("{field} must not be empty")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Dispatcher {
    composer: RoomEventComposer,
}

impl Dispatcher {
    pub fn new(composer: RoomEventComposer) -> Self {
        Self { composer }
    }

    /// Parse and dispatch one text frame. Failures become error replies.
    pub async fn handle_text(&self, identity: &Identity, text: &str) -> Option<OutboundEnvelope> {
        let inbound = match InboundEnvelope::from_json(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                let err = DispatchError::Malformed(e.to_string());
                tracing::debug!(user_id = %identity.user_id, error = %err, "unparseable frame");
                return Some(OutboundEnvelope::error(err.code(), err.to_string()));
            }
        };

        match self.dispatch(identity, &inbound).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(
                    user_id = %identity.user_id,
                    message_type = %inbound.message_type,
                    error = %err,
                    "inbound message rejected"
                );
                Some(OutboundEnvelope::error(err.code(), err.to_string()))
            }
        }
    }

    pub async fn dispatch(
        &self,
        identity: &Identity,
        inbound: &InboundEnvelope,
    ) -> Result<Option<OutboundEnvelope>, DispatchError> {
        let user_id = identity.user_id.as_str();

        let reply = match inbound.message_type.as_str() {
            "ping" => OutboundEnvelope::pong(),
            "subscribe" | "unsubscribe" => {
                let TopicsPayload { topics } = payload(inbound)?;
                let kind = if inbound.message_type == "subscribe" {
                    "subscribed"
                } else {
                    "unsubscribed"
                };
                // Advisory only; routing is decided by channel scope
                OutboundEnvelope::success(kind, Some(json!({ "topics": topics })))
            }
            "mark_read" => {
                let MarkReadPayload { notification_id } = payload(inbound)?;
                non_empty("notification_id", &notification_id)?;
                OutboundEnvelope::success(
                    "marked_read",
                    Some(json!({ "notification_id": notification_id })),
                )
            }
            "ack" => {
                let AckPayload { notification_id } = payload(inbound).unwrap_or_default();
                tracing::debug!(user_id = %user_id, notification_id = ?notification_id, "client ack");
                return Ok(None);
            }
            "join_room" => {
                let RoomPayload { room_id } = payload(inbound)?;
                non_empty("room_id", &room_id)?;
                let event = self.composer.join(&room_id, user_id).await?;
                OutboundEnvelope::success("room_joined", Some(event.data))
            }
            "leave_room" => {
                let RoomPayload { room_id } = payload(inbound)?;
                non_empty("room_id", &room_id)?;
                let event = self.composer.leave(&room_id, user_id).await?;
                OutboundEnvelope::success("room_left", Some(event.data))
            }
            "send_message" => {
                let SendMessagePayload { room_id, content } = payload(inbound)?;
                non_empty("room_id", &room_id)?;
                let event = self
                    .composer
                    .send_message(&room_id, user_id, &content)
                    .await?;
                OutboundEnvelope::success("message_sent", Some(event.data))
            }
            "focus_start" => {
                let FocusPayload { room_id, duration } = payload(inbound)?;
                non_empty("room_id", &room_id)?;
                let event = self.composer.focus_start(&room_id, user_id, duration).await?;
                OutboundEnvelope::success("focus_started", Some(event.data))
            }
            "focus_end" => {
                let FocusPayload { room_id, duration } = payload(inbound)?;
                non_empty("room_id", &room_id)?;
                let event = self.composer.focus_end(&room_id, user_id, duration).await?;
                OutboundEnvelope::success("focus_ended", Some(event.data))
            }
            "presence_refresh" => {
                let RoomPayload { room_id } = payload(inbound)?;
                non_empty("room_id", &room_id)?;
                let active = self.composer.presence().refresh(&room_id, user_id).await?;
                OutboundEnvelope::success(
                    "presence_refreshed",
                    Some(json!({ "room_id": room_id, "active": active })),
                )
            }
            other => return Err(DispatchError::UnknownMessageType(other.to_string())),
        };

        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        InMemoryChatService, MemoryBroker, MemoryPresenceStore, PresenceTracker,
    };
    use std::sync::Arc;
    use tokio::time::Duration;

    async fn dispatcher() -> Dispatcher {
        let chat = Arc::new(InMemoryChatService::new(50));
        chat.create_room("r1", ["u1"]).await;
        let presence =
            PresenceTracker::new(Arc::new(MemoryPresenceStore::new()), Duration::from_secs(300));
        Dispatcher::new(RoomEventComposer::new(
            presence,
            chat.clone(),
            chat,
            Arc::new(MemoryBroker::default()),
        ))
    }

    fn identity() -> Identity {
        Identity::new("u1", "student")
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let reply = dispatcher()
            .await
            .handle_text(&identity(), r#"{"type":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(reply.message_type, "pong");
    }

    #[tokio::test]
    async fn unknown_type_is_an_error_reply() {
        let reply = dispatcher()
            .await
            .handle_text(&identity(), r#"{"type":"dance","payload":{}}"#)
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.data.unwrap()["code"], "unknown_message_type");
    }

    #[tokio::test]
    async fn malformed_json_is_an_error_reply() {
        let reply = dispatcher()
            .await
            .handle_text(&identity(), "{oops")
            .await
            .unwrap();
        assert_eq!(reply.data.unwrap()["code"], "malformed_message");
    }

    #[tokio::test]
    async fn ack_has_no_reply() {
        let reply = dispatcher()
            .await
            .handle_text(&identity(), r#"{"type":"ack","payload":{"notification_id":"n1"}}"#)
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn subscribe_and_mark_read_are_acknowledged() {
        let dispatcher = dispatcher().await;
        let reply = dispatcher
            .handle_text(
                &identity(),
                r#"{"type":"subscribe","payload":{"topics":["grades","exams"]}}"#,
            )
            .await
            .unwrap();
        assert_eq!(reply.message_type, "subscribed");
        assert_eq!(reply.data.unwrap()["topics"][1], "exams");

        let reply = dispatcher
            .handle_text(
                &identity(),
                r#"{"type":"mark_read","payload":{"notification_id":"n9"}}"#,
            )
            .await
            .unwrap();
        assert_eq!(reply.message_type, "marked_read");
        assert_eq!(reply.data.unwrap()["notification_id"], "n9");

        let reply = dispatcher
            .handle_text(&identity(), r#"{"type":"mark_read"}"#)
            .await
            .unwrap();
        assert_eq!(reply.data.unwrap()["code"], "malformed_message");
    }

    #[tokio::test]
    async fn room_actions_round_trip() {
        let dispatcher = dispatcher().await;
        let reply = dispatcher
            .handle_text(&identity(), r#"{"type":"join_room","payload":{"room_id":"r1"}}"#)
            .await
            .unwrap();
        assert_eq!(reply.message_type, "room_joined");
        assert_eq!(reply.data.unwrap()["participant_count"], 1);

        let reply = dispatcher
            .handle_text(
                &identity(),
                r#"{"type":"presence_refresh","payload":{"room_id":"r1"}}"#,
            )
            .await
            .unwrap();
        assert_eq!(reply.data.unwrap()["active"], true);

        let reply = dispatcher
            .handle_text(&identity(), r#"{"type":"join_room","payload":{"room_id":"r404"}}"#)
            .await
            .unwrap();
        assert_eq!(reply.data.unwrap()["code"], "room_not_found");

        let reply = dispatcher
            .handle_text(
                &identity(),
                r#"{"type":"send_message","payload":{"room_id":"r1","content":"   "}}"#,
            )
            .await
            .unwrap();
        assert_eq!(reply.data.unwrap()["code"], "chat_rejected");
    }
}
