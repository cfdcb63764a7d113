//! Protocol-engine contract.
//!
//! The engine owns the wire protocol, encryption and credentials. The gateway
//! only sees one opaque [`ProtocolConnection`] per session, which pushes
//! typed [`ProtocolEvent`]s into the session's inbox.

use crate::error::GatewayResult;
use crate::jid::Jid;
use crate::store::DeviceHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Media categories understood by the engine's upload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Document,
    Audio,
    Video,
}

/// Reference to encrypted media hosted by the chat network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub direct_path: String,
    /// Base64 media key.
    pub media_key: String,
    #[serde(default)]
    pub file_length: u64,
}

/// Result of uploading outbound media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHandle {
    pub url: String,
    pub direct_path: String,
    pub media_key: String,
    pub file_sha256: String,
    pub file_enc_sha256: String,
}

/// A media attachment on an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub media: MediaRef,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Text with formatting or a quoted reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedText {
    pub text: String,
    #[serde(default)]
    pub quoted_message_id: Option<String>,
}

/// Content sub-fields of an inbound message. Any combination may be present;
/// the gateway classifies by fixed priority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text: Option<ExtendedText>,
    #[serde(default)]
    pub image: Option<MediaAttachment>,
    #[serde(default)]
    pub document: Option<MediaAttachment>,
    #[serde(default)]
    pub audio: Option<MediaAttachment>,
    #[serde(default)]
    pub video: Option<MediaAttachment>,
}

/// Routing metadata of an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub chat: Jid,
    pub sender: Jid,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub push_name: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub info: MessageInfo,
    pub message: MessagePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptType {
    Delivered,
    Read,
    ReadSelf,
    Played,
    Retry,
    #[serde(other)]
    Other,
}

/// A batch receipt covering one or more message ids in one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub chat: Jid,
    pub message_ids: Vec<String>,
    pub receipt_type: ReceiptType,
}

/// Events the engine pushes into a session inbox, in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Message(InboundMessage),
    Receipt(Receipt),
    Connected,
    Disconnected,
    LoggedOut {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Items emitted on a bootstrap (pairing) channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BootstrapEvent {
    /// A fresh pairing code to render as a QR image.
    Code { code: String },
    Success,
    Timeout,
    Error { message: String },
}

/// Outbound message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        text: String,
    },
    Image {
        upload: UploadHandle,
        mime_type: String,
        caption: String,
        file_length: u64,
    },
    Document {
        upload: UploadHandle,
        mime_type: String,
        file_name: String,
        caption: String,
        file_length: u64,
    },
}

impl OutboundMessage {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn upload(&self) -> Option<&UploadHandle> {
        match self {
            Self::Text { .. } => None,
            Self::Image { upload, .. } | Self::Document { upload, .. } => Some(upload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub message_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// One live protocol connection bound to one device identity.
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    /// Request a connection. Confirmation arrives later as
    /// [`ProtocolEvent::Connected`].
    async fn connect(&self) -> GatewayResult<()>;

    /// Request a close without waiting for confirmation.
    async fn disconnect(&self) -> GatewayResult<()>;

    /// Live transport connectivity as seen by the engine.
    fn is_connected(&self) -> bool;

    /// The paired account address, once the device identity is resolved.
    fn identity(&self) -> Option<Jid>;

    /// Route all future protocol events for this connection into `inbox`.
    fn subscribe(&self, inbox: mpsc::UnboundedSender<ProtocolEvent>);

    /// Open a pairing-code stream. Must be called before [`connect`] on a
    /// device without identity.
    ///
    /// [`connect`]: ProtocolConnection::connect
    async fn open_bootstrap_channel(&self) -> GatewayResult<mpsc::Receiver<BootstrapEvent>>;

    async fn send(&self, to: &Jid, message: OutboundMessage) -> GatewayResult<SendResponse>;

    async fn upload(&self, data: Vec<u8>, kind: MediaKind) -> GatewayResult<UploadHandle>;

    async fn download(&self, media: &MediaRef) -> GatewayResult<Vec<u8>>;

    async fn group_name(&self, group: &Jid) -> GatewayResult<String>;
}

/// Factory for per-device connections.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    async fn open(&self, device: &DeviceHandle) -> GatewayResult<Arc<dyn ProtocolConnection>>;
}
