//! Persistence contract: durable session records plus the engine's
//! device-identity bindings.

use crate::error::GatewayResult;
use crate::jid::Jid;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable projection of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub client_id: String,
    pub phone_number: String,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A device binding. Keyed by session id; `jid` is set once pairing resolves
/// the account identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub session_id: String,
    pub jid: Option<Jid>,
}

impl DeviceHandle {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            jid: None,
        }
    }
}

/// Durable store for session records and device bindings.
///
/// Implementations must be safe for concurrent use by many sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or update a record. `created_at` is kept on update.
    async fn upsert_session(
        &self,
        id: &str,
        client_id: &str,
        phone_number: &str,
        connected: bool,
    ) -> GatewayResult<()>;

    async fn get_session(&self, id: &str) -> GatewayResult<Option<SessionRecord>>;

    async fn get_session_by_client_id(&self, client_id: &str)
        -> GatewayResult<Option<SessionRecord>>;

    /// Delete a record. Deleting an absent record is not an error.
    async fn delete_session(&self, id: &str) -> GatewayResult<()>;

    async fn list_sessions(&self) -> GatewayResult<Vec<SessionRecord>>;

    /// Allocate a fresh, unpaired device binding for `session_id`.
    async fn new_device(&self, session_id: &str) -> GatewayResult<DeviceHandle>;

    async fn all_devices(&self) -> GatewayResult<Vec<DeviceHandle>>;

    async fn delete_device(&self, session_id: &str) -> GatewayResult<()>;

    /// Record (or clear) the account identity of a device after pairing.
    async fn set_device_identity(&self, session_id: &str, jid: Option<&Jid>)
        -> GatewayResult<()>;
}
