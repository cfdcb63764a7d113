//! Outbound event envelope delivered to the webhook consumer.
//!
//! Every event is `{type, session_id, client_id, timestamp, data}` where
//! `data` is one of [`MessageData`], [`StatusData`] or [`ConnectionData`].

use serde::{Deserialize, Serialize};

/// Envelope `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Status,
    Connection,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Status => "status",
            Self::Connection => "connection",
        }
    }
}

/// Classification of an inbound message's payload. Exactly one per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    Document,
    Audio,
    Video,
}

/// Delivery states reported for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Read,
}

/// Connection lifecycle states reported for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    QrReady,
    LoggedOut,
}

/// An inbound chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    /// Absent when the payload carried no recognized content.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ContentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub is_from_me: bool,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub push_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_msg_id: Option<String>,
}

/// A delivery/read receipt for one outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub message_id: String,
    pub status: DeliveryStatus,
    pub to: String,
}

/// A session connection transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
}

impl ConnectionData {
    pub fn connected(phone_number: impl Into<String>) -> Self {
        let phone_number = phone_number.into();
        Self {
            status: ConnectionStatus::Connected,
            phone_number: (!phone_number.is_empty()).then_some(phone_number),
            qr_code: None,
        }
    }

    pub fn disconnected() -> Self {
        Self::bare(ConnectionStatus::Disconnected)
    }

    pub fn logged_out() -> Self {
        Self::bare(ConnectionStatus::LoggedOut)
    }

    pub fn qr_ready(qr_code: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::QrReady,
            phone_number: None,
            qr_code: Some(qr_code.into()),
        }
    }

    fn bare(status: ConnectionStatus) -> Self {
        Self {
            status,
            phone_number: None,
            qr_code: None,
        }
    }
}

/// Variant payload of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Message(MessageData),
    Status(StatusData),
    Connection(ConnectionData),
}

/// The normalized envelope POSTed to the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: String,
    pub client_id: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub data: EventData,
}

impl Event {
    fn stamped(
        event_type: EventType,
        session_id: impl Into<String>,
        client_id: impl Into<String>,
        data: EventData,
    ) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            client_id: client_id.into(),
            timestamp: chrono::Utc::now().timestamp(),
            data,
        }
    }

    pub fn message(
        session_id: impl Into<String>,
        client_id: impl Into<String>,
        data: MessageData,
    ) -> Self {
        Self::stamped(EventType::Message, session_id, client_id, EventData::Message(data))
    }

    pub fn status(
        session_id: impl Into<String>,
        client_id: impl Into<String>,
        data: StatusData,
    ) -> Self {
        Self::stamped(EventType::Status, session_id, client_id, EventData::Status(data))
    }

    pub fn connection(
        session_id: impl Into<String>,
        client_id: impl Into<String>,
        data: ConnectionData,
    ) -> Self {
        Self::stamped(
            EventType::Connection,
            session_id,
            client_id,
            EventData::Connection(data),
        )
    }

    pub fn as_message(&self) -> Option<&MessageData> {
        match &self.data {
            EventData::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<&StatusData> {
        match &self.data {
            EventData::Status(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_connection(&self) -> Option<&ConnectionData> {
        match &self.data {
            EventData::Connection(c) => Some(c),
            _ => None,
        }
    }
}
