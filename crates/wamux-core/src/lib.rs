//! wamux-core: shared types for the multi-session chat gateway.
//!
//! Provides the outbound event envelope, chat addresses, the protocol-engine
//! contract consumed by each session, and the persistence contract.

pub mod engine;
pub mod error;
pub mod events;
pub mod jid;
pub mod store;

// Re-export commonly used items at crate root.
pub use engine::{
    BootstrapEvent, InboundMessage, MediaKind, MediaRef, OutboundMessage, ProtocolConnection,
    ProtocolEngine, ProtocolEvent, Receipt, ReceiptType, SendResponse, UploadHandle,
};
pub use error::{GatewayError, GatewayResult};
pub use events::{
    ConnectionData, ConnectionStatus, ContentKind, DeliveryStatus, Event, EventData, EventType,
    MessageData, StatusData,
};
pub use jid::Jid;
pub use store::{DeviceHandle, SessionRecord, SessionStore};
