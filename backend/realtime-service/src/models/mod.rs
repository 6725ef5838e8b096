use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pattern the bridge subscribes to; covers every notification channel.
pub const NOTIFICATION_PATTERN: &str = "notifications:*";

const USER_CHANNEL_PREFIX: &str = "notifications:user:";
const ROLE_CHANNEL_PREFIX: &str = "notifications:role:";
const SYSTEM_CHANNEL: &str = "notifications:system";

/// Authenticated caller, as returned by an authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
        }
    }
}

/// Notification published by domain services onto the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Dedup key; unique per logical notification.
    pub id: String,
    /// Target user. Required on user-scoped channels, ignored elsewhere.
    #[serde(default)]
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
}

impl NotificationEnvelope {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        notification_type: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            notification_type: notification_type.into(),
            title: title.into(),
            body: body.into(),
            data: None,
            created_at: Utc::now(),
            expires_at: None,
            read: false,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Delivery scope of a broker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    User,
    Role,
    System,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::User => "user",
            ChannelKind::Role => "role",
            ChannelKind::System => "system",
        }
    }
}

/// A notification topic, classified by scope.
///
/// ```text
/// notifications:user:{user_id}
/// notifications:role:{role}
/// notifications:system
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelName {
    User(String),
    Role(String),
    System,
}

impl ChannelName {
    pub fn user(user_id: impl Into<String>) -> Self {
        ChannelName::User(user_id.into())
    }

    pub fn role(role: impl Into<String>) -> Self {
        ChannelName::Role(role.into())
    }

    /// Classify a raw topic. Returns `None` for anything outside the convention.
    pub fn parse(topic: &str) -> Option<Self> {
        if topic == SYSTEM_CHANNEL {
            return Some(ChannelName::System);
        }
        if let Some(user_id) = topic.strip_prefix(USER_CHANNEL_PREFIX) {
            return (!user_id.is_empty() && !user_id.contains(':'))
                .then(|| ChannelName::User(user_id.to_string()));
        }
        if let Some(role) = topic.strip_prefix(ROLE_CHANNEL_PREFIX) {
            return (!role.is_empty() && !role.contains(':'))
                .then(|| ChannelName::Role(role.to_string()));
        }
        None
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelName::User(_) => ChannelKind::User,
            ChannelName::Role(_) => ChannelKind::Role,
            ChannelName::System => ChannelKind::System,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelName::User(user_id) => write!(f, "{USER_CHANNEL_PREFIX}{user_id}"),
            ChannelName::Role(role) => write!(f, "{ROLE_CHANNEL_PREFIX}{role}"),
            ChannelName::System => f.write_str(SYSTEM_CHANNEL),
        }
    }
}

/// Broker channel carrying a room's lifecycle and chat events.
pub fn room_channel(room_id: &str) -> String {
    format!("room:{room_id}:events")
}

/// Activity status of a user inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Focusing,
    Away,
    /// Sentinel for "no live presence record".
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Focusing => "focusing",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "focusing" => Ok(PresenceStatus::Focusing),
            "away" => Ok(PresenceStatus::Away),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_classification() {
        assert_eq!(
            ChannelName::parse("notifications:user:u-42"),
            Some(ChannelName::User("u-42".into()))
        );
        assert_eq!(
            ChannelName::parse("notifications:role:teacher"),
            Some(ChannelName::Role("teacher".into()))
        );
        assert_eq!(
            ChannelName::parse("notifications:system"),
            Some(ChannelName::System)
        );
        assert_eq!(ChannelName::parse("notifications:user:"), None);
        assert_eq!(ChannelName::parse("notifications:user:a:b"), None);
        assert_eq!(ChannelName::parse("notifications:other"), None);
        assert_eq!(ChannelName::parse("room:r1:events"), None);
    }

    #[test]
    fn channel_display_matches_parse() {
        for channel in [
            ChannelName::user("u1"),
            ChannelName::role("admin"),
            ChannelName::System,
        ] {
            assert_eq!(ChannelName::parse(&channel.to_string()), Some(channel));
        }
    }

    #[test]
    fn envelope_defaults_optional_fields() {
        let envelope: NotificationEnvelope = serde_json::from_str(
            r#"{"id":"n1","type":"exam_published","title":"New exam"}"#,
        )
        .unwrap();

        assert_eq!(envelope.id, "n1");
        assert!(envelope.user_id.is_empty());
        assert!(envelope.body.is_empty());
        assert!(!envelope.read);
        assert!(envelope.expires_at.is_none());
    }

    #[test]
    fn envelope_expiry() {
        let now = Utc::now();
        let envelope = NotificationEnvelope::new("n1", "u1", "t", "title", "body")
            .with_expiry(now - chrono::Duration::seconds(1));
        assert!(envelope.is_expired(now));

        let fresh = NotificationEnvelope::new("n2", "u1", "t", "title", "body");
        assert!(!fresh.is_expired(now));
    }

    #[test]
    fn presence_status_round_trips_through_str() {
        for status in [
            PresenceStatus::Online,
            PresenceStatus::Focusing,
            PresenceStatus::Away,
            PresenceStatus::Offline,
        ] {
            assert_eq!(status.as_str().parse::<PresenceStatus>().unwrap(), status);
        }
        assert!("busy".parse::<PresenceStatus>().is_err());
    }
}
